use std::num::NonZeroUsize;
use anyhow::{anyhow, Result};
use log::debug;
use lru::LruCache;
use crate::*;

#[derive(Debug, Default, Clone, PartialOrd, PartialEq, Ord, Eq)]
struct CacheItem {
    dirty: bool,
    data: Vec<u8>,
}

/// Write-back LRU cache in front of another driver.
///
/// ```rust
/// use disk_driver::cache::CacheDiskDriver;
/// use disk_driver::memory::MemoryDiskDriver;
/// use disk_driver::DiskDriver;
/// let mut driver = CacheDiskDriver::new(MemoryDiskDriver::new(), 2).unwrap();
/// driver.write_block(1, &[0xa; 512]).unwrap();
/// let mut buf = [0; 512];
/// driver.read_block(1, &mut buf).unwrap();
/// assert_eq!(buf, [0xa; 512]);
/// ```
pub struct CacheDiskDriver<T: DiskDriver> {
    inner: T,
    cache: LruCache<u64, CacheItem>,
    stats: DiskStats,
}

impl<T: DiskDriver> CacheDiskDriver<T> {
    pub fn new(inner: T, size: usize) -> Result<Self> {
        let size = NonZeroUsize::new(size).ok_or_else(|| anyhow!("cache size must not be zero"))?;
        let info = inner.info();
        debug!("cache init, cache size: {}, disk size: {:x}, disk unit: {:x}",
            size, info.consts.layout_size, info.consts.iounit_size);
        Ok(Self { inner, cache: LruCache::new(size), stats: DiskStats::default() })
    }

    pub fn inner(&self) -> &T { &self.inner }

    fn write_back_item(&mut self, replaced: Option<(u64, CacheItem)>) -> Result<()> {
        if let Some((index, item)) = replaced {
            if item.dirty {
                debug!("cache write back unit {:x}", index);
                self.inner.write_block(index, &item.data)?;
            }
        }
        Ok(())
    }
}

impl<T: DiskDriver> DiskDriver for CacheDiskDriver<T> {
    fn info(&self) -> DiskInfo {
        DiskInfo { stats: self.stats, consts: self.inner.info().consts }
    }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<()> {
        check_io(&self.inner.info().consts, index, buf.len())?;
        self.stats.read_cnt += 1;
        if let Some(item) = self.cache.get(&index) {
            buf.copy_from_slice(&item.data);
            return Ok(());
        }
        let mut data = vec![0 as u8; buf.len()];
        self.inner.read_block(index, &mut data)?;
        buf.copy_from_slice(&data);
        let replaced = self.cache.push(index, CacheItem { data, dirty: false });
        // push hands back the old value when the key was already present
        self.write_back_item(replaced.filter(|(k, _)| *k != index))
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<()> {
        check_io(&self.inner.info().consts, index, buf.len())?;
        self.stats.write_cnt += 1;
        if let Some(item) = self.cache.get_mut(&index) {
            item.data.copy_from_slice(buf);
            item.dirty = true;
            return Ok(());
        }
        // no need to read first, the whole unit is overwritten
        let replaced = self.cache.push(index, CacheItem { data: buf.to_vec(), dirty: true });
        self.write_back_item(replaced.filter(|(k, _)| *k != index))
    }

    fn flush(&mut self) -> Result<()> {
        debug!("flush cached data");
        self.stats.flush_cnt += 1;
        for (index, item) in self.cache.iter_mut() {
            if !item.dirty { continue; }
            self.inner.write_block(*index, &item.data)?;
            item.dirty = false;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDiskDriver;
    use anyhow::Result;

    #[test]
    fn simple_test() -> Result<()> {
        let mut driver = CacheDiskDriver::new(MemoryDiskDriver::new(), 4)?;
        driver_tester(&mut driver)
    }

    #[test]
    fn write_back_on_evict_and_flush() -> Result<()> {
        let mut driver = CacheDiskDriver::new(MemoryDiskDriver::with_size(64 * 512, 512), 2)?;
        driver.write_block(0, &[1; 512])?;
        driver.write_block(1, &[2; 512])?;
        assert_eq!(driver.inner().info().stats.write_cnt, 0);
        // evicts unit 0
        driver.write_block(2, &[3; 512])?;
        assert_eq!(driver.inner().info().stats.write_cnt, 1);
        assert_eq!(driver.inner().mem[0], 1);
        driver.flush()?;
        assert_eq!(driver.inner().info().stats.write_cnt, 3);
        assert_eq!(driver.inner().mem[2 * 512], 3);
        Ok(())
    }
}
