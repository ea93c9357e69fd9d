use std::sync::Arc;
use anyhow::anyhow;
use log::{debug, warn};
use crate::eafs_lib::BlockId;
use crate::eafs_lib::buffer::{scratch_copy, BlockBuffer};
use crate::eafs_lib::codec::{self, Corruption};
use crate::eafs_lib::error::{Result, XattrError};
use crate::eafs_lib::owner::{OwnerId, OwnerRecord};

enum Undo {
    /// Content of an exclusively held block before its first change
    Image { buffer: Arc<BlockBuffer>, image: Box<[u8]> },
    /// Reference count change applied to a possibly shared block
    Refcount { buffer: Arc<BlockBuffer>, delta: i64 },
}

/// Drops a freed block from the sharing cache
pub type Evict = Arc<dyn Fn(BlockId) + Send + Sync>;

/// Everything one attribute operation changes.
///
/// Buffers are modified in memory as the operation goes and the changes are
/// recorded here. [`Journal::commit`] makes them durable in one go,
/// [`Journal::abort`] puts memory back to the state before [`Journal::begin`].
///
/// References taken on shared blocks count at once, so concurrent lookups
/// see them. References dropped are only recorded and applied by the commit,
/// with commits and rollbacks serialized. A count some other transaction has
/// acted on is therefore never undone, except a taken reference whose block
/// lost every other holder meanwhile: the rollback frees that block.
pub struct Transaction {
    credits: usize,
    undo: Vec<Undo>,
    dirty: Vec<Arc<BlockBuffer>>,
    allocated: Vec<BlockId>,
    released: Vec<Arc<BlockBuffer>>,
    freed: Vec<BlockId>,
    orphaned: Vec<BlockId>,
    evict: Option<Evict>,
    quota: Vec<(OwnerId, i64)>,
    owners: Vec<(OwnerId, OwnerRecord)>,
    features: u32,
    sync: bool,
}

impl Transaction {
    pub fn new(credits: usize) -> Self {
        Self {
            credits,
            undo: vec![],
            dirty: vec![],
            allocated: vec![],
            released: vec![],
            freed: vec![],
            orphaned: vec![],
            evict: None,
            quota: vec![],
            owners: vec![],
            features: 0,
            sync: false,
        }
    }

    pub fn credits(&self) -> usize { self.credits }

    /// Keep the current image of a block this owner holds exclusively.
    /// `data` is the locked content of `buffer`.
    pub fn get_write_access(&mut self, buffer: &Arc<BlockBuffer>, data: &[u8]) -> Result<()> {
        let imaged = self.undo.iter().any(|u| matches!(u, Undo::Image { buffer: b, .. } if Arc::ptr_eq(b, buffer)));
        if !imaged {
            self.undo.push(Undo::Image { buffer: buffer.clone(), image: scratch_copy(data)? });
        }
        Ok(())
    }

    /// Note a reference count change already made on the locked `buffer`
    pub fn refcount_changed(&mut self, buffer: &Arc<BlockBuffer>, delta: i64) {
        self.undo.push(Undo::Refcount { buffer: buffer.clone(), delta });
    }

    pub fn mark_dirty(&mut self, buffer: &Arc<BlockBuffer>) {
        if self.dirty.iter().any(|b| Arc::ptr_eq(b, buffer)) {
            return;
        }
        self.dirty.push(buffer.clone());
        if self.dirty.len() > self.credits {
            warn!("transaction writes {} blocks, {} reserved", self.dirty.len(), self.credits);
        }
    }

    pub fn allocated(&mut self, block: BlockId) { self.allocated.push(block); }

    /// Drop one reference to `buffer` on commit, freeing the block with the
    /// last one
    pub fn release(&mut self, buffer: &Arc<BlockBuffer>) { self.released.push(buffer.clone()); }

    pub fn set_evict(&mut self, evict: Evict) { self.evict = Some(evict); }

    fn evict(&self, block: BlockId) {
        if let Some(evict) = &self.evict {
            evict(block);
        }
    }

    pub fn quota_changed(&mut self, owner: OwnerId, blocks: i64) { self.quota.push((owner, blocks)); }

    pub fn update_owner(&mut self, owner: OwnerId, record: OwnerRecord) {
        match self.owners.iter_mut().find(|(id, _)| *id == owner) {
            Some((_, r)) => *r = record,
            None => self.owners.push((owner, record)),
        }
    }

    pub fn set_feature(&mut self, feature: u32) { self.features |= feature; }

    /// Flush the device on commit
    pub fn set_sync(&mut self) { self.sync = true; }

    pub fn dirty_buffers(&self) -> &[Arc<BlockBuffer>] { &self.dirty }

    pub fn allocated_blocks(&self) -> &[BlockId] { &self.allocated }

    pub fn freed_blocks(&self) -> &[BlockId] { &self.freed }

    /// Blocks the rollback left without any reference
    pub fn orphaned_blocks(&self) -> &[BlockId] { &self.orphaned }

    pub fn quota_changes(&self) -> &[(OwnerId, i64)] { &self.quota }

    pub fn owner_updates(&self) -> &[(OwnerId, OwnerRecord)] { &self.owners }

    pub fn features(&self) -> u32 { self.features }

    pub fn is_sync(&self) -> bool { self.sync }

    /// Apply the recorded reference drops. Only called with commits
    /// serialized, before the dirty buffers are written.
    pub fn apply_releases(&mut self) -> Result<()> {
        for buffer in std::mem::take(&mut self.released) {
            let block = buffer.block();
            let bad = |c: Corruption| XattrError::from(anyhow!("block {} on release: {}", block, c.0));
            let mut data = buffer.lock();
            let refcount = codec::refcount(&data).map_err(bad)?;
            if refcount <= 1 {
                debug!("block {}: freeing", block);
                // lookups waiting on this buffer must not adopt it
                self.evict(block);
                codec::set_refcount(&mut data, 0).map_err(bad)?;
                self.undo.push(Undo::Refcount { buffer: buffer.clone(), delta: -(refcount as i64) });
                self.freed.push(block);
            } else {
                codec::set_refcount(&mut data, refcount - 1).map_err(bad)?;
                drop(data);
                self.undo.push(Undo::Refcount { buffer: buffer.clone(), delta: -1 });
                self.mark_dirty(&buffer);
                debug!("block {}: refcount now={}", block, refcount - 1);
            }
        }
        Ok(())
    }

    /// Undo every buffer change, newest first
    pub fn rollback_buffers(&mut self) {
        self.released.clear();
        self.freed.clear();
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Image { buffer, image } => {
                    let mut data = buffer.lock();
                    // other owners may have taken references since
                    let refcount = codec::refcount(&data);
                    data.copy_from_slice(&image);
                    if let Ok(refcount) = refcount {
                        codec::set_refcount(&mut data, refcount).ok();
                    }
                }
                Undo::Refcount { buffer, delta } => {
                    let block = buffer.block();
                    let mut data = buffer.lock();
                    if let Ok(refcount) = codec::refcount(&data) {
                        let restored = (refcount as i64 - delta).max(0) as u32;
                        codec::set_refcount(&mut data, restored).ok();
                        if restored == 0 && delta > 0 {
                            // every other holder let go meanwhile
                            self.evict(block);
                            self.orphaned.push(block);
                        }
                    }
                }
            }
        }
    }
}

/// Transaction manager
pub trait Journal: Send + Sync {
    /// Start a transaction expected to touch `credits` blocks
    fn begin(&self, credits: usize) -> Result<Transaction>;
    /// Apply the recorded reference drops and write out everything. On
    /// failure the transaction is aborted.
    fn commit(&self, txn: Transaction) -> Result<()>;
    fn abort(&self, txn: Transaction);
}
