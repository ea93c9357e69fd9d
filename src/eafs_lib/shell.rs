//! Line oriented command interpreter over one volume.
//!
//! ```text
//! set 1 user.mime text/plain     create or replace
//! set 1 user.mime - create       `-` is the empty value, 0x.. is hex
//! get 1 user.mime
//! rm 1 user.mime
//! list 1
//! flags 1 sync|immutable|append|none
//! block 1                        attribute block and its reference count
//! dump 1                         hex dump of the attribute block
//! delete 1                       destroy the owner
//! stats
//! detach                         drop the device from the sharing cache
//! ```
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;
use anyhow::{anyhow, Result};
use disk_driver::DiskDriver;
use log::debug;
use crate::eafs_lib::codec;
use crate::eafs_lib::context::XattrContext;
use crate::eafs_lib::desc::*;
use crate::eafs_lib::error::XattrError;
use crate::eafs_lib::owner::{Owner, OwnerId};
use crate::eafs_lib::utils::hex_dump;
use crate::eafs_lib::volume::{BlockStorage, Volume};
use crate::eafs_lib::xattr::{SetMode, XattrStore};

pub struct Shell<T: DiskDriver> {
    store: XattrStore,
    volume: Arc<Volume<T>>,
    owners: HashMap<OwnerId, Owner>,
}

fn parse_value(s: &str) -> Result<Vec<u8>> {
    if s == "-" {
        return Ok(vec![]);
    }
    match s.strip_prefix("0x") {
        Some(hex) => {
            if !hex.is_ascii() {
                return Err(anyhow!("bad hex {}", s));
            }
            if hex.len() % 2 != 0 {
                return Err(anyhow!("odd number of hex digits in {}", s));
            }
            (0..hex.len()).step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| anyhow!("bad hex {}: {}", s, e)))
                .collect()
        }
        None => Ok(s.as_bytes().to_vec()),
    }
}

fn show_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) if !s.chars().any(|c| c.is_control()) => format!("{:?}", s),
        _ => format!("0x{}", value.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
    }
}

fn parse_owner(arg: Option<&str>) -> Result<OwnerId> {
    Ok(arg.ok_or_else(|| anyhow!("missing owner"))?.parse()?)
}

impl<T: DiskDriver + 'static> Shell<T> {
    pub fn new(ctx: Arc<XattrContext>, volume: Arc<Volume<T>>) -> Self {
        Self { store: XattrStore::on_volume(ctx, volume.clone()), volume, owners: HashMap::new() }
    }

    pub fn store(&self) -> &XattrStore { &self.store }

    pub fn volume(&self) -> &Arc<Volume<T>> { &self.volume }

    /// Owner by id, created in a block group picked from the id on first use
    fn owner<'a>(owners: &'a mut HashMap<OwnerId, Owner>, volume: &Volume<T>, id: OwnerId) -> &'a Owner {
        let config = volume.config();
        let groups = (config.blocks_count / config.blocks_per_group).max(1) as u64;
        owners.entry(id).or_insert_with(|| Owner::new(id, (id % groups) as u32))
    }

    /// Run one command, returning what it prints
    pub fn execute(&mut self, line: &str) -> Result<String> {
        let mut args = line.split_whitespace();
        let cmd = match args.next() {
            Some(cmd) => cmd,
            None => return Ok(String::new()),
        };
        debug!("shell: {}", line);
        match cmd {
            "set" => {
                let id = parse_owner(args.next())?;
                let name = args.next().ok_or_else(|| anyhow!("missing name"))?;
                let value = parse_value(args.next().ok_or_else(|| anyhow!("missing value"))?)?;
                let mode = match args.next() {
                    None => SetMode::Any,
                    Some("create") => SetMode::CreateOnly,
                    Some("replace") => SetMode::ReplaceOnly,
                    Some(other) => return Err(anyhow!("unknown mode {}", other)),
                };
                let owner = Self::owner(&mut self.owners, &self.volume, id);
                self.store.setxattr(owner, name, &value, mode)?;
                Ok(String::new())
            }
            "get" => {
                let id = parse_owner(args.next())?;
                let name = args.next().ok_or_else(|| anyhow!("missing name"))?;
                let owner = Self::owner(&mut self.owners, &self.volume, id);
                let size = self.store.getxattr(owner, name, None)?;
                let mut buf = vec![0 as u8; size];
                let size = self.store.getxattr(owner, name, Some(&mut buf))?;
                Ok(format!("{}={}\n", name, show_value(&buf[..size])))
            }
            "rm" => {
                let id = parse_owner(args.next())?;
                let name = args.next().ok_or_else(|| anyhow!("missing name"))?;
                let owner = Self::owner(&mut self.owners, &self.volume, id);
                self.store.removexattr(owner, name)?;
                Ok(String::new())
            }
            "list" => {
                let id = parse_owner(args.next())?;
                let owner = Self::owner(&mut self.owners, &self.volume, id);
                let size = self.store.listxattr(owner, None)?;
                let mut buf = vec![0 as u8; size];
                self.store.listxattr(owner, Some(&mut buf))?;
                Ok(buf.split(|b| *b == 0)
                    .filter(|name| !name.is_empty())
                    .map(|name| format!("{}\n", String::from_utf8_lossy(name)))
                    .collect())
            }
            "flags" => {
                let id = parse_owner(args.next())?;
                let flags = match args.next() {
                    Some("sync") => EXT2_SYNC_FL,
                    Some("immutable") => EXT2_IMMUTABLE_FL,
                    Some("append") => EXT2_APPEND_FL,
                    Some("none") => 0,
                    other => return Err(anyhow!("unknown flags {:?}", other)),
                };
                Self::owner(&mut self.owners, &self.volume, id).set_flags(flags);
                Ok(String::new())
            }
            "block" | "dump" => {
                let id = parse_owner(args.next())?;
                let block = Self::owner(&mut self.owners, &self.volume, id).xattr_block();
                if block == 0 {
                    return Ok("no attribute block\n".to_string());
                }
                let buffer = self.volume.read_buffer(block)?;
                let data = buffer.snapshot()?;
                let refcount = codec::refcount(&data).map_err(|c| anyhow!("block {}: {}", block, c.0))?;
                let mut text = format!("block {} refcount {}\n", block, refcount);
                if cmd == "dump" {
                    for line in hex_dump(&data, 16) {
                        text.push_str(&line);
                        text.push('\n');
                    }
                }
                Ok(text)
            }
            "delete" => {
                let id = parse_owner(args.next())?;
                if let Some(mut owner) = self.owners.remove(&id) {
                    self.store.delete_all(&mut owner)?;
                }
                Ok(String::new())
            }
            "stats" => {
                let ctx = self.store.context();
                Ok(format!("owners {} cached blocks {} free blocks {} corruption reports {}\n",
                           self.owners.len(), ctx.cache().len(), self.volume.free_blocks(),
                           ctx.corruption_reports()))
            }
            "detach" => {
                self.store.context().put_device(self.volume.config().device);
                Ok(String::new())
            }
            "help" => Ok("set get rm list flags block dump delete stats detach\n".to_string()),
            _ => Err(anyhow!("unknown command {}", cmd)),
        }
    }

    /// Run every line of `input`. A failed command prints an error and the
    /// run goes on.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut out: W) -> Result<()> {
        for line in input.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.execute(line) {
                Ok(text) => write!(out, "{}", text)?,
                Err(e) => match e.downcast_ref::<XattrError>() {
                    Some(xe) => writeln!(out, "error: {} (errno {})", xe, xe.errno())?,
                    None => writeln!(out, "error: {:#}", e)?,
                },
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eafs_lib::context::MountOptions;
    use crate::eafs_lib::volume::VolumeConfig;
    use disk_driver::memory::MemoryDiskDriver;
    use anyhow::Result;

    fn shell() -> Result<Shell<MemoryDiskDriver>> {
        let ctx = XattrContext::init(MountOptions::default())?;
        let volume = Arc::new(Volume::new(MemoryDiskDriver::new(), VolumeConfig::default())?);
        Ok(Shell::new(ctx, volume))
    }

    #[test]
    fn values() -> Result<()> {
        assert_eq!(parse_value("-")?, b"");
        assert_eq!(parse_value("0x00ff")?, vec![0, 0xff]);
        assert!(parse_value("0x0").is_err());
        assert!(parse_value("0xaéb").is_err());
        assert!(parse_value("0xé").is_err());
        assert!(parse_value("0xzz").is_err());
        assert_eq!(parse_value("abc")?, b"abc");
        assert_eq!(show_value(b"abc"), "\"abc\"");
        assert_eq!(show_value(&[0, 1]), "0x0001");
        Ok(())
    }

    #[test]
    fn script() -> Result<()> {
        let mut shell = shell()?;
        let script = "\
            # two owners sharing one block\n\
            set 1 user.k v\n\
            set 2 user.k v\n\
            get 2 user.k\n\
            block 1\n\
            set 1 user.k again create\n\
            rm 1 user.k\n\
            list 2\n\
            get 1 user.nothing\n\
            bogus\n";
        let mut out = vec![];
        shell.run(script.as_bytes(), &mut out)?;
        let out = String::from_utf8(out)?;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "user.k=\"v\"");
        assert!(lines[1].ends_with("refcount 2"));
        assert!(lines[2].starts_with("error: attribute already exists"));
        assert_eq!(lines[3], "user.k");
        assert!(lines[4].starts_with("error: attribute not found"));
        assert_eq!(lines[5], "error: unknown command bogus");
        Ok(())
    }

    #[test]
    fn delete_and_stats() -> Result<()> {
        let mut shell = shell()?;
        shell.execute("set 1 trusted.a 0x0102")?;
        assert!(shell.execute("dump 1")?.contains("0000: 00 00 02 ea"));
        shell.execute("delete 1")?;
        let stats = shell.execute("stats")?;
        assert!(stats.starts_with("owners 0 cached blocks 0"));
        assert!(shell.execute("flags 1 weird").is_err());
        Ok(())
    }
}
