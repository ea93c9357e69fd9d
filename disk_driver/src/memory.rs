use anyhow::{anyhow, Result};
use crate::*;

const MEM_DISK_SIZE: u64 = 4 * 0x400 * 0x400;
const MEM_DISK_UNIT: u32 = 512;

/// RAM disk. Can be told to fail writes after a number of successful ones,
/// which is how the upper layers exercise their I/O error paths.
pub struct MemoryDiskDriver {
    pub info: DiskInfo,
    pub mem: Vec<u8>,
    writes_left: Option<u64>,
}

impl DiskDriver for MemoryDiskDriver {
    fn info(&self) -> DiskInfo { self.info }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_io(&self.info.consts, index, buf.len())?;
        buf.copy_from_slice(self.get_unit_slice(index));
        self.info.stats.read_cnt += 1;
        Ok(())
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<()> {
        check_io(&self.info.consts, index, buf.len())?;
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(anyhow!("injected write failure at unit {}", index));
            }
            *left -= 1;
        }
        self.get_unit_slice(index).copy_from_slice(buf);
        self.info.stats.write_cnt += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.info.stats.flush_cnt += 1;
        Ok(())
    }
}

impl MemoryDiskDriver {
    pub fn new() -> Self {
        Self::with_size(MEM_DISK_SIZE, MEM_DISK_UNIT)
    }

    pub fn with_size(layout_size: u64, iounit_size: u32) -> Self {
        assert_eq!(layout_size % iounit_size as u64, 0);
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst { layout_size, iounit_size },
            },
            mem: vec![0 as u8; layout_size as usize],
            writes_left: None,
        }
    }

    /// Let `count` more writes succeed, then fail every write after them
    pub fn fail_writes_after(&mut self, count: u64) {
        self.writes_left = Some(count);
    }

    pub fn clear_faults(&mut self) {
        self.writes_left = None;
    }

    fn get_unit_slice(&mut self, index: u64) -> &mut [u8] {
        let unit = self.info.consts.iounit_size as usize;
        let start = index as usize * unit;
        &mut self.mem[start..start + unit]
    }
}
