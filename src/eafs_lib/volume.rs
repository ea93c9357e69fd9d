//! Services the attribute store consumes, and a volume providing them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use anyhow::anyhow;
use disk_driver::DiskDriver;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use crate::eafs_lib::{BlockId, DeviceId};
use crate::eafs_lib::buffer::{scratch, BlockBuffer};
use crate::eafs_lib::error::{Result, XattrError};
use crate::eafs_lib::journal::{Journal, Transaction};
use crate::eafs_lib::owner::{OwnerId, OwnerRecord};

/// Block storage: buffers, allocation and geometry
pub trait BlockStorage: Send + Sync {
    fn device(&self) -> DeviceId;
    fn block_size(&self) -> usize;
    fn is_read_only(&self) -> bool;
    /// First block of a block group
    fn group_first_block(&self, group: u32) -> BlockId;
    /// Buffer of an existing block, read from disk on first use
    fn read_buffer(&self, block: BlockId) -> Result<Arc<BlockBuffer>>;
    /// Buffer of a block allocated in this transaction, zero filled
    fn new_buffer(&self, block: BlockId) -> Result<Arc<BlockBuffer>>;
    /// Allocate a free block, the first one at or after `goal` if any
    fn allocate(&self, txn: &mut Transaction, goal: BlockId) -> Result<BlockId>;
}

/// Per owner block accounting
pub trait QuotaAccounting: Send + Sync {
    fn charge_block(&self, txn: &mut Transaction, owner: OwnerId) -> Result<()>;
    fn release_block(&self, txn: &mut Transaction, owner: OwnerId);
}

/// Persistent owner metadata
pub trait OwnerStore: Send + Sync {
    fn load_owner(&self, owner: OwnerId) -> Option<OwnerRecord>;
    fn store_owner(&self, owner: OwnerId, record: OwnerRecord);
}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub device: DeviceId,
    /// Filesystem block size, a multiple of the disk unit
    pub block_size: usize,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    /// Blocks each owner may be charged for, unlimited if `None`
    pub quota_limit: Option<u64>,
    pub read_only: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            device: 0,
            block_size: 0x400,
            blocks_count: 0x1000,
            blocks_per_group: 0x2000,
            quota_limit: None,
            read_only: false,
        }
    }
}

fn bitmap_test(bitmap: &[u8], index: usize) -> bool {
    bitmap[index / 8] & (1 << (index % 8)) != 0
}

fn bitmap_set(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

fn bitmap_clear(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] &= !(1 << (index % 8));
}

/// First clear bit in `[from, to)`
fn bitmap_search(bitmap: &[u8], from: usize, to: usize) -> Option<usize> {
    (from..to).find(|i| !bitmap_test(bitmap, *i))
}

/// A volume over any disk driver.
///
/// Attribute blocks live on the driver. The allocation bitmap, quota usage
/// and owner records are kept in memory. Commit writes every dirty buffer
/// through to the driver before deferred frees and owner updates take effect.
///
/// A block gets one buffer the first time it is used and keeps it, freed or
/// not, so every thread locking a block locks the same buffer.
pub struct Volume<T: DiskDriver> {
    config: VolumeConfig,
    disk_unit: usize,
    first_data_block: BlockId,
    driver: Mutex<T>,
    bitmap: Mutex<Vec<u8>>,
    buffers: Mutex<HashMap<BlockId, Arc<BlockBuffer>>>,
    quota: Mutex<HashMap<OwnerId, u64>>,
    owners: Mutex<HashMap<OwnerId, OwnerRecord>>,
    features: AtomicU32,
    commit_lock: Mutex<()>,
}

impl<T: DiskDriver> Volume<T> {
    pub fn new(driver: T, config: VolumeConfig) -> Result<Self> {
        let consts = driver.info().consts;
        let disk_unit = consts.iounit_size as usize;
        let bs = config.block_size;
        if bs < 0x400 || bs > 0x10000 || !bs.is_power_of_two() || bs % disk_unit != 0 {
            error!("block size {} unusable with disk unit {}", bs, disk_unit);
            return Err(XattrError::InvalidArgument);
        }
        if config.blocks_count < 2 || config.blocks_per_group == 0
            || config.blocks_count as u64 * bs as u64 > consts.layout_size {
            error!("{} blocks of {} bytes do not fit a disk of {} bytes",
                config.blocks_count, bs, consts.layout_size);
            return Err(XattrError::InvalidArgument);
        }
        // a 1k block volume starts its data after the boot block
        let first_data_block = if bs == 0x400 { 1 } else { 0 };
        let mut bitmap = vec![0 as u8; (config.blocks_count as usize + 7) / 8];
        // block 0 is never handed out, it means "no block"
        for b in 0..=first_data_block as usize {
            bitmap_set(&mut bitmap, b);
        }
        info!("volume {}: {} blocks of {} bytes, {} blocks per group{}",
            config.device, config.blocks_count, bs, config.blocks_per_group,
            if config.read_only { ", read only" } else { "" });
        Ok(Self {
            config,
            disk_unit,
            first_data_block,
            driver: Mutex::new(driver),
            bitmap: Mutex::new(bitmap),
            buffers: Mutex::new(HashMap::new()),
            quota: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            features: AtomicU32::new(0),
            commit_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &VolumeConfig { &self.config }

    pub fn first_data_block(&self) -> BlockId { self.first_data_block }

    pub fn driver(&self) -> MutexGuard<'_, T> { self.driver.lock() }

    pub fn has_feature(&self, feature: u32) -> bool {
        self.features.load(Ordering::Acquire) & feature != 0
    }

    pub fn is_allocated(&self, block: BlockId) -> bool {
        (block as usize) < self.config.blocks_count as usize && bitmap_test(&self.bitmap.lock(), block as usize)
    }

    pub fn free_blocks(&self) -> usize {
        let bitmap = self.bitmap.lock();
        (0..self.config.blocks_count as usize).filter(|i| !bitmap_test(&bitmap, *i)).count()
    }

    pub fn quota_usage(&self, owner: OwnerId) -> u64 {
        self.quota.lock().get(&owner).copied().unwrap_or(0)
    }

    /// Drop all buffers, later reads come from the disk again. Only for a
    /// volume nobody else is using.
    pub fn forget_buffers(&self) {
        self.buffers.lock().clear();
    }

    fn block_disk_ratio(&self) -> usize { self.config.block_size / self.disk_unit }

    fn check_block(&self, block: BlockId) -> Result<()> {
        if block < self.first_data_block || block == 0 || block >= self.config.blocks_count {
            return Err(anyhow!("block {} outside data area of volume {}", block, self.config.device).into());
        }
        Ok(())
    }

    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()> {
        let ratio = self.block_disk_ratio() as u64;
        let mut driver = self.driver.lock();
        for (i, unit) in buf.chunks_mut(self.disk_unit).enumerate() {
            driver.read_block(block as u64 * ratio + i as u64, unit)?;
        }
        Ok(())
    }

    fn write_block(&self, block: BlockId, buf: &[u8]) -> Result<()> {
        let ratio = self.block_disk_ratio() as u64;
        let mut driver = self.driver.lock();
        for (i, unit) in buf.chunks(self.disk_unit).enumerate() {
            driver.write_block(block as u64 * ratio + i as u64, unit)?;
        }
        Ok(())
    }

    fn write_out(&self, txn: &Transaction) -> Result<()> {
        for buffer in txn.dirty_buffers() {
            if txn.freed_blocks().contains(&buffer.block()) {
                continue;
            }
            let data = buffer.snapshot()?;
            self.write_block(buffer.block(), &data)?;
        }
        if txn.is_sync() {
            self.driver.lock().flush()?;
        }
        Ok(())
    }

    /// Caller holds the commit lock
    fn rollback(&self, mut txn: Transaction) {
        txn.rollback_buffers();
        {
            let mut bitmap = self.bitmap.lock();
            for block in txn.allocated_blocks() {
                bitmap_clear(&mut bitmap, *block as usize);
            }
            for block in txn.orphaned_blocks() {
                warn!("block {} has no references left after abort, freeing", block);
                bitmap_clear(&mut bitmap, *block as usize);
            }
        }
        {
            let mut quota = self.quota.lock();
            for (owner, blocks) in txn.quota_changes().iter().rev() {
                let used = quota.entry(*owner).or_insert(0);
                *used = (*used as i64 - blocks).max(0) as u64;
            }
        }
        // a restored buffer may have reached the disk through another commit
        for buffer in txn.dirty_buffers() {
            let block = buffer.block();
            if txn.allocated_blocks().contains(&block) || txn.orphaned_blocks().contains(&block) {
                continue;
            }
            let written = buffer.snapshot().and_then(|data| self.write_block(buffer.block(), &data));
            if let Err(e) = written {
                warn!("rewrite of block {} after abort failed: {}", buffer.block(), e);
            }
        }
        debug!("transaction aborted, {} blocks returned", txn.allocated_blocks().len());
    }
}

impl<T: DiskDriver> BlockStorage for Volume<T> {
    fn device(&self) -> DeviceId { self.config.device }

    fn block_size(&self) -> usize { self.config.block_size }

    fn is_read_only(&self) -> bool { self.config.read_only }

    fn group_first_block(&self, group: u32) -> BlockId {
        self.first_data_block + group.saturating_mul(self.config.blocks_per_group)
    }

    fn read_buffer(&self, block: BlockId) -> Result<Arc<BlockBuffer>> {
        self.check_block(block)?;
        if let Some(buffer) = self.buffers.lock().get(&block) {
            return Ok(buffer.clone());
        }
        let mut data = scratch(self.config.block_size)?;
        self.read_block(block, &mut data)?;
        let mut buffers = self.buffers.lock();
        // somebody may have read it meanwhile, theirs wins
        Ok(buffers.entry(block).or_insert_with(|| Arc::new(BlockBuffer::new(block, data))).clone())
    }

    fn new_buffer(&self, block: BlockId) -> Result<Arc<BlockBuffer>> {
        self.check_block(block)?;
        let data = scratch(self.config.block_size)?;
        let buffer = self.buffers.lock()
            .entry(block)
            .or_insert_with(|| Arc::new(BlockBuffer::new(block, data)))
            .clone();
        // a block used before keeps its buffer, wipe the old content
        buffer.lock().fill(0);
        Ok(buffer)
    }

    fn allocate(&self, txn: &mut Transaction, goal: BlockId) -> Result<BlockId> {
        let count = self.config.blocks_count as usize;
        let first = self.first_data_block as usize;
        let goal = if (goal as usize) < first || goal as usize >= count { first } else { goal as usize };
        let mut bitmap = self.bitmap.lock();
        let block = bitmap_search(&bitmap, goal, count)
            .or_else(|| bitmap_search(&bitmap, first, goal))
            .ok_or(XattrError::NoSpace)?;
        bitmap_set(&mut bitmap, block);
        txn.allocated(block as BlockId);
        debug!("allocated block {} (goal {})", block, goal);
        Ok(block as BlockId)
    }
}

impl<T: DiskDriver> QuotaAccounting for Volume<T> {
    fn charge_block(&self, txn: &mut Transaction, owner: OwnerId) -> Result<()> {
        let mut quota = self.quota.lock();
        let used = quota.entry(owner).or_insert(0);
        if let Some(limit) = self.config.quota_limit {
            if *used + 1 > limit {
                debug!("owner {} over quota ({} blocks)", owner, limit);
                return Err(XattrError::QuotaExceeded);
            }
        }
        *used += 1;
        txn.quota_changed(owner, 1);
        Ok(())
    }

    fn release_block(&self, txn: &mut Transaction, owner: OwnerId) {
        let mut quota = self.quota.lock();
        if let Some(used) = quota.get_mut(&owner) {
            if *used > 0 {
                *used -= 1;
                txn.quota_changed(owner, -1);
            }
        }
    }
}

impl<T: DiskDriver> OwnerStore for Volume<T> {
    fn load_owner(&self, owner: OwnerId) -> Option<OwnerRecord> {
        self.owners.lock().get(&owner).copied()
    }

    fn store_owner(&self, owner: OwnerId, record: OwnerRecord) {
        self.owners.lock().insert(owner, record);
    }
}

impl<T: DiskDriver> Journal for Volume<T> {
    fn begin(&self, credits: usize) -> Result<Transaction> {
        if self.config.read_only {
            return Err(XattrError::ReadOnly);
        }
        Ok(Transaction::new(credits))
    }

    fn commit(&self, mut txn: Transaction) -> Result<()> {
        let _guard = self.commit_lock.lock();
        if let Err(e) = txn.apply_releases().and_then(|_| self.write_out(&txn)) {
            error!("commit on volume {} failed: {}", self.config.device, e);
            self.rollback(txn);
            return Err(e);
        }
        {
            let mut bitmap = self.bitmap.lock();
            for block in txn.freed_blocks() {
                bitmap_clear(&mut bitmap, *block as usize);
            }
        }
        for (owner, record) in txn.owner_updates() {
            self.store_owner(*owner, *record);
        }
        self.features.fetch_or(txn.features(), Ordering::AcqRel);
        debug!("commit: {} blocks written, {} freed", txn.dirty_buffers().len(), txn.freed_blocks().len());
        Ok(())
    }

    fn abort(&self, txn: Transaction) {
        let _guard = self.commit_lock.lock();
        self.rollback(txn);
    }
}
