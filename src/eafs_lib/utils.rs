use std::io::Write;
use chrono::Local;
use env_logger::{Builder, Env};

/// Set up `env_logger`, filtered by `RUST_LOG` (default `info`)
pub fn init_logs() {
    let _ = Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(buf, "{} {:<5} [{}] {}",
                     Local::now().format("%H:%M:%S%.3f"),
                     record.level(),
                     record.target(),
                     record.args())
        })
        .try_init();
}

/// Hex lines of `group_size` bytes each
pub fn hex_dump(data: &[u8], group_size: usize) -> Vec<String> {
    data.chunks(group_size)
        .enumerate()
        .map(|(i, chunk)| format!("{:04x}: {}", i * group_size,
                                  chunk.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")))
        .collect()
}
