use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use anyhow::{Context, Result};
use log::info;
use crate::*;

const FILE_DISK_UNIT: u32 = 512;

/// Disk image kept in a regular file
pub struct FileDiskDriver {
    pub info: DiskInfo,
    file: File,
}

impl DiskDriver for FileDiskDriver {
    fn info(&self) -> DiskInfo { self.info }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_io(&self.info.consts, index, buf.len())?;
        self.seek_unit(index)?;
        self.file.read_exact(buf)
            .with_context(|| format!("read disk unit {}", index))?;
        self.info.stats.read_cnt += 1;
        Ok(())
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<()> {
        check_io(&self.info.consts, index, buf.len())?;
        self.seek_unit(index)?;
        self.file.write_all(buf)
            .with_context(|| format!("write disk unit {}", index))?;
        self.info.stats.write_cnt += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data().context("sync disk image")?;
        self.info.stats.flush_cnt += 1;
        Ok(())
    }
}

impl FileDiskDriver {
    /// Create (or truncate) an image of `layout_size` zero bytes
    pub fn create<P: AsRef<Path>>(path: P, layout_size: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true)
            .open(path)
            .with_context(|| format!("create disk image {}", path.display()))?;
        file.set_len(layout_size)?;
        info!("FileDrv create: {} ({} bytes)", path.display(), layout_size);
        Ok(Self::from_file(file, layout_size))
    }

    /// Open an existing image, its size is the file length
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)
            .with_context(|| format!("open disk image {}", path.display()))?;
        let layout_size = file.metadata()?.len() / FILE_DISK_UNIT as u64 * FILE_DISK_UNIT as u64;
        info!("FileDrv open: {} ({} bytes)", path.display(), layout_size);
        Ok(Self::from_file(file, layout_size))
    }

    fn from_file(file: File, layout_size: u64) -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst { layout_size, iounit_size: FILE_DISK_UNIT },
            },
            file,
        }
    }

    fn seek_unit(&mut self, index: u64) -> Result<()> {
        let offset = index * self.info.consts.iounit_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}
