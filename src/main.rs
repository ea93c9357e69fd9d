use std::env::set_var;
use std::fs::File;
use std::io::{stdin, stdout, BufReader};
use std::sync::Arc;
use anyhow::{anyhow, Result};
use clap::{arg, command, value_parser, ArgAction};
use disk_driver::cache::CacheDiskDriver;
use disk_driver::file::FileDiskDriver;
use disk_driver::memory::MemoryDiskDriver;
use disk_driver::DiskDriver;
use log::*;
use eafs::eafs_lib::shell::Shell;
use eafs::eafs_lib::utils::init_logs;
use eafs::{MountOptions, Volume, VolumeConfig, XattrContext};

const DISK_UNIT: usize = 512;

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!([script] "Command script, read from stdin when absent"))
        .arg(
            arg!(-d --device <FILE> "Disk image to (re)create, a RAM disk is used when absent")
                .required(false),
        )
        .arg(arg!(-b --"block-size" <BYTES> "Filesystem block size")
            .value_parser(value_parser!(usize))
            .required(false)
            .default_value("1024"))
        .arg(arg!(-n --blocks <COUNT> "Number of filesystem blocks")
            .value_parser(value_parser!(u32))
            .required(false)
            .default_value("4096"))
        .arg(arg!(--cache <UNITS> "Put an LRU cache of this many disk units in front of the disk")
            .value_parser(value_parser!(usize))
            .required(false))
        .arg(arg!(--quota <BLOCKS> "Blocks each owner may be charged for")
            .value_parser(value_parser!(u64))
            .required(false))
        .arg(arg!(--"no-user-xattr" "Disable the user. namespace").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-r --"read-only" "Refuse every change").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    let block_size = *matches.get_one::<usize>("block-size").ok_or_else(|| anyhow!("missing block size"))?;
    let blocks = *matches.get_one::<u32>("blocks").ok_or_else(|| anyhow!("missing block count"))?;
    if block_size % DISK_UNIT != 0 {
        return Err(anyhow!("block size {} is not a multiple of {}", block_size, DISK_UNIT));
    }
    let layout_size = block_size as u64 * blocks as u64;

    let driver: Box<dyn DiskDriver> = match matches.get_one::<String>("device") {
        Some(path) => {
            info!("Device: {}", path);
            Box::new(FileDiskDriver::create(path, layout_size)?)
        }
        None => Box::new(MemoryDiskDriver::with_size(layout_size, DISK_UNIT as u32)),
    };
    let driver: Box<dyn DiskDriver> = match matches.get_one::<usize>("cache") {
        Some(units) => Box::new(CacheDiskDriver::new(driver, *units)?),
        None => driver,
    };

    let ctx = XattrContext::init(MountOptions { user_xattr: !matches.get_flag("no-user-xattr") })?;
    let config = VolumeConfig {
        device: 0,
        block_size,
        blocks_count: blocks,
        blocks_per_group: (block_size * 8) as u32,
        quota_limit: matches.get_one::<u64>("quota").copied(),
        read_only: matches.get_flag("read-only"),
    };
    let device = config.device;
    let volume = Arc::new(Volume::new(driver, config)?);
    let mut shell = Shell::new(ctx.clone(), volume.clone());
    match matches.get_one::<String>("script") {
        Some(path) => shell.run(BufReader::new(File::open(path)?), stdout().lock())?,
        None => shell.run(stdin().lock(), stdout().lock())?,
    }

    volume.driver().flush()?;
    ctx.put_device(device);
    ctx.shutdown();
    info!("All Done.");
    Ok(())
}
