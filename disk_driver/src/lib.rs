use anyhow::{anyhow, Result};

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DiskStats {
    pub write_cnt: u64,
    pub read_cnt: u64,
    pub flush_cnt: u64,
}

#[derive(Debug, Copy, Clone)]
pub struct DiskConst {
    pub layout_size: u64,
    pub iounit_size: u32,
}

#[derive(Default, Copy, Debug, Clone)]
pub struct DiskInfo {
    pub stats: DiskStats,
    pub consts: DiskConst,
}

impl DiskConst {
    pub fn disk_block_count(&self) -> u64 {
        self.layout_size / self.iounit_size as u64
    }
}

impl Default for DiskConst {
    fn default() -> Self {
        Self {
            layout_size: 4 * 0x400 * 0x400,
            iounit_size: 512,
        }
    }
}

/// DiskDriver abstract interface.
///
/// Every transfer is exactly one disk unit (`iounit_size` bytes) addressed by
/// its unit number.
pub trait DiskDriver: Send {
    /// Disk size, disk unit and stats
    fn info(&self) -> DiskInfo;
    /// Read one disk unit
    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<()>;
    /// Write one disk unit
    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<()>;
    /// Push everything written so far to stable storage
    fn flush(&mut self) -> Result<()>;
}

impl<T: DiskDriver + ?Sized> DiskDriver for Box<T> {
    fn info(&self) -> DiskInfo { (**self).info() }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(index, buf)
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<()> {
        (**self).write_block(index, buf)
    }

    fn flush(&mut self) -> Result<()> { (**self).flush() }
}

/// Check index and buffer length against the disk geometry
pub(crate) fn check_io(consts: &DiskConst, index: u64, len: usize) -> Result<()> {
    if len != consts.iounit_size as usize {
        return Err(anyhow!("io size {} is not one disk unit ({})", len, consts.iounit_size));
    }
    if index >= consts.disk_block_count() {
        return Err(anyhow!("disk unit {} out of range ({} units)", index, consts.disk_block_count()));
    }
    Ok(())
}

pub mod memory;
pub mod file;
pub mod cache;

#[allow(dead_code)]
fn driver_tester(driver: &mut dyn DiskDriver) -> Result<()> {
    let info = driver.info();
    let disk_unit = info.consts.iounit_size as usize;
    println!("disk size: {}, disk unit: {}", info.consts.layout_size, disk_unit);
    let write_data = [0x55 as u8].repeat(disk_unit);
    driver.write_block(3, &write_data)?;
    let mut read_data = [0 as u8].repeat(disk_unit);
    driver.read_block(3, &mut read_data)?;
    assert_eq!(read_data, write_data);
    driver.read_block(4, &mut read_data)?;
    assert!(read_data.iter().all(|b| *b == 0));
    assert!(driver.read_block(info.consts.disk_block_count(), &mut read_data).is_err());
    driver.flush()?;
    Ok(())
}
