//! Attribute get, set, list and teardown on top of shared blocks.
//!
//! An owner points at no block or at one attribute block. Blocks with equal
//! content are shared between owners through the sharing cache, each owner
//! holding one reference. A block is edited in place only while its
//! reference count is 1. Otherwise the edit goes to a private copy, which
//! is then either matched against an existing block or written to a newly
//! allocated one.
//!
//! Locking: the owner lock is taken first and held for the whole operation.
//! Buffer locks are taken one at a time. The sharing cache lock is taken
//! only briefly, possibly while a buffer lock is held, never the other way.
use std::sync::Arc;
use chrono::Local;
use disk_driver::DiskDriver;
use log::{debug, error};
use parking_lot::RwLockWriteGuard;
use crate::eafs_lib::{BlockId, DeviceId};
use crate::eafs_lib::buffer::{scratch, scratch_copy, BlockBuffer};
use crate::eafs_lib::cache::CacheInsert;
use crate::eafs_lib::codec::{self, BlockMatch, Corruption, Slot};
use crate::eafs_lib::context::XattrContext;
use crate::eafs_lib::desc::*;
use crate::eafs_lib::error::{Result, XattrError};
use crate::eafs_lib::journal::{Journal, Transaction};
use crate::eafs_lib::owner::{Owner, OwnerId, OwnerRecord, OwnerState};
use crate::eafs_lib::volume::{BlockStorage, QuotaAccounting, Volume};

/// Existence requirement of a set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Create or replace; removing an absent attribute succeeds
    Any,
    /// Fail with `AlreadyExists` if the attribute exists
    CreateOnly,
    /// Fail with `NotFound` if the attribute does not exist
    ReplaceOnly,
}

enum Target<'a> {
    /// The owner's block, locked, reference count 1
    InPlace(RwLockWriteGuard<'a, Box<[u8]>>),
    /// Private copy or brand new block
    Scratch(Box<[u8]>),
}

impl<'a> Target<'a> {
    fn data(&mut self) -> &mut [u8] {
        match self {
            Target::InPlace(guard) => &mut guard[..],
            Target::Scratch(data) => &mut data[..],
        }
    }
}

/// Owner changes to apply once the transaction is committed
struct Pending {
    record: OwnerRecord,
    cache_insert: Option<(BlockId, u32)>,
}

pub struct XattrStore {
    ctx: Arc<XattrContext>,
    storage: Arc<dyn BlockStorage>,
    journal: Arc<dyn Journal>,
    quota: Arc<dyn QuotaAccounting>,
}

impl XattrStore {
    pub fn new(ctx: Arc<XattrContext>, storage: Arc<dyn BlockStorage>, journal: Arc<dyn Journal>,
               quota: Arc<dyn QuotaAccounting>) -> Self {
        Self { ctx, storage, journal, quota }
    }

    /// Store whose every collaborator is `volume`
    pub fn on_volume<T: DiskDriver + 'static>(ctx: Arc<XattrContext>, volume: Arc<Volume<T>>) -> Self {
        Self::new(ctx, volume.clone(), volume.clone(), volume)
    }

    pub fn context(&self) -> &Arc<XattrContext> { &self.ctx }

    pub fn device(&self) -> DeviceId { self.storage.device() }

    fn corrupt(&self, owner: OwnerId, block: BlockId) -> impl Fn(Corruption) -> XattrError + '_ {
        move |c| {
            let e = XattrError::CorruptBlock { owner, block, reason: c.0 };
            self.ctx.report_corruption(&e);
            e
        }
    }

    /// Transaction whose frees also leave the sharing cache
    fn begin(&self) -> Result<Transaction> {
        let mut txn = self.journal.begin(XATTR_TRANS_BLOCKS)?;
        let (ctx, device) = (self.ctx.clone(), self.device());
        txn.set_evict(Arc::new(move |block| {
            ctx.cache().remove(device, block);
        }));
        Ok(txn)
    }

    fn cache_insert(&self, block: BlockId, hash: u32) {
        if hash == 0 {
            return;
        }
        match self.ctx.cache().insert(self.device(), block, hash) {
            CacheInsert::Inserted => debug!("block {}: inserting [{:x}]", block, hash),
            CacheInsert::AlreadyCached => debug!("block {}: already in cache", block),
        }
    }

    /// Copy the value of one attribute into `buf`, or only report its size
    /// when `buf` is `None`.
    pub fn get(&self, owner: &Owner, name_index: u8, name: &str, buf: Option<&mut [u8]>) -> Result<usize> {
        let name = name.as_bytes();
        if name.len() > XATTR_NAME_MAX {
            return Err(XattrError::Range);
        }
        let state = owner.read();
        let block = state.xattr_block;
        debug!("get owner={} name={}.{} block={}", owner.id(), name_index, String::from_utf8_lossy(name), block);
        if block == 0 {
            return Err(XattrError::NotFound);
        }
        let buffer = self.storage.read_buffer(block)?;
        let data = buffer.read();
        let header = codec::check_header(&data).map_err(self.corrupt(owner.id(), block))?;
        let value = match codec::find(&data, name_index, name).map_err(self.corrupt(owner.id(), block))? {
            Some(entry) => Some(entry.value(&data).map_err(self.corrupt(owner.id(), block))?),
            None => None,
        };
        self.cache_insert(block, header.h_hash.get());
        let value = value.ok_or(XattrError::NotFound)?;
        if let Some(buf) = buf {
            if value.len() > buf.len() {
                return Err(XattrError::Range);
            }
            buf[..value.len()].copy_from_slice(value);
        }
        Ok(value.len())
    }

    /// Names of all attributes, each as `prefix name \0`. With `buf` set to
    /// `None` only the size is returned.
    pub fn list(&self, owner: &Owner, buf: Option<&mut [u8]>) -> Result<usize> {
        let state = owner.read();
        let block = state.xattr_block;
        debug!("list owner={} block={}", owner.id(), block);
        if block == 0 {
            return Ok(0);
        }
        let buffer = self.storage.read_buffer(block)?;
        let data = buffer.read();
        let header = codec::check_header(&data).map_err(self.corrupt(owner.id(), block))?;
        let mut names = vec![];
        for entry in codec::entries(&data) {
            let entry = entry.map_err(self.corrupt(owner.id(), block))?;
            if let Some(handler) = self.ctx.handlers().get(entry.name_index()) {
                names.extend(handler.list(self.ctx.options(), entry.name(&data)));
            }
        }
        self.cache_insert(block, header.h_hash.get());
        if let Some(buf) = buf {
            if names.len() > buf.len() {
                return Err(XattrError::Range);
            }
            buf[..names.len()].copy_from_slice(&names);
        }
        Ok(names.len())
    }

    /// Create, replace or, with `value` set to `None`, remove an attribute
    pub fn set(&self, owner: &Owner, name_index: u8, name: &str, value: Option<&[u8]>, mode: SetMode) -> Result<()> {
        debug!("set owner={} name={}.{} value_len={:?}", owner.id(), name_index, name, value.map(|v| v.len()));
        if self.storage.is_read_only() {
            return Err(XattrError::ReadOnly);
        }
        let mut state = owner.write();
        let mut txn = self.begin()?;
        let pending = match self.set_handle(&mut txn, owner.id(), &state, name_index, name.as_bytes(), value, mode) {
            Ok(pending) => pending,
            Err(e) => {
                self.journal.abort(txn);
                return Err(e);
            }
        };
        self.journal.commit(txn)?;
        if let Some(pending) = pending {
            state.xattr_block = pending.record.xattr_block;
            state.ctime = pending.record.ctime;
            if let Some((block, hash)) = pending.cache_insert {
                self.cache_insert(block, hash);
            }
        }
        Ok(())
    }

    /// Remove an attribute that must exist
    pub fn remove(&self, owner: &Owner, name_index: u8, name: &str) -> Result<()> {
        self.set(owner, name_index, name, None, SetMode::ReplaceOnly)
    }

    fn set_handle(&self, txn: &mut Transaction, owner: OwnerId, state: &OwnerState, name_index: u8,
                  name: &[u8], value: Option<&[u8]>, mode: SetMode) -> Result<Option<Pending>> {
        if state.is_immutable() {
            return Err(XattrError::PermissionDenied);
        }
        let block_size = self.storage.block_size();
        if name.len() > XATTR_NAME_MAX || value.map_or(0, |v| v.len()) > block_size {
            return Err(XattrError::Range);
        }
        let old = state.xattr_block;

        let old_buffer = if old != 0 { Some(self.storage.read_buffer(old)?) } else { None };
        let slot = match &old_buffer {
            Some(buffer) => {
                let data = buffer.read();
                codec::check_header(&data).map_err(self.corrupt(owner, old))?;
                // checks every value in the block, the found one included
                codec::locate(&data, name_index, name).map_err(self.corrupt(owner, old))?
            }
            None => Slot::empty(block_size),
        };

        match (slot.found.is_some(), mode) {
            (false, SetMode::ReplaceOnly) => return Err(XattrError::NotFound),
            (true, SetMode::CreateOnly) => return Err(XattrError::AlreadyExists),
            (false, _) if value.is_none() => return Ok(None),
            _ => {}
        }

        let mut free = slot.free();
        if let Some(found) = slot.found {
            if found.has_block_value() {
                free += xattr_size(found.value_size());
            }
            free += xattr_len(name.len());
        }
        if let Some(value) = value {
            if free < xattr_len(name.len()) + xattr_size(value.len()) {
                return Err(XattrError::NoSpace);
            }
        }

        let mut target = match &old_buffer {
            Some(buffer) => {
                let data = buffer.lock();
                let refcount = codec::refcount(&data).map_err(self.corrupt(owner, old))?;
                if refcount == 1 {
                    debug!("block {}: modifying in-place", old);
                    self.ctx.cache().remove(self.device(), old);
                    txn.get_write_access(buffer, &data)?;
                    Target::InPlace(data)
                } else {
                    drop(data);
                    debug!("block {}: cloning, refcount {}", old, refcount);
                    let mut copy = buffer.snapshot()?;
                    codec::set_refcount(&mut copy, 1).map_err(self.corrupt(owner, old))?;
                    Target::Scratch(copy)
                }
            }
            None => {
                let mut fresh = scratch(block_size)?;
                codec::init_block(&mut fresh);
                Target::Scratch(fresh)
            }
        };

        let data = target.data();
        let here = codec::apply(data, &slot, name_index, name, value).map_err(self.corrupt(owner, old))?;
        let empty = codec::is_empty(data);
        let mut hash = 0;
        if !empty {
            codec::rehash(data, here).map_err(self.corrupt(owner, old))?;
            codec::layout(data).map_err(self.corrupt(owner, old))?;
            hash = codec::block_hash(data).map_err(self.corrupt(owner, old))?;
        }

        let mut cache_insert = None;
        let new_buffer = if empty {
            drop(target);
            None
        } else {
            match target {
                Target::InPlace(guard) => {
                    let content = scratch_copy(&guard)?;
                    drop(guard);
                    match self.cache_find(txn, owner, &content, hash, 0)? {
                        Some(found) => Some(found),
                        None => {
                            // keep this block
                            let buffer = old_buffer.clone().ok_or(XattrError::InvalidArgument)?;
                            txn.mark_dirty(&buffer);
                            cache_insert = Some((old, hash));
                            Some(buffer)
                        }
                    }
                }
                Target::Scratch(content) => match self.cache_find(txn, owner, &content, hash, old)? {
                    Some(found) => Some(found),
                    None => {
                        self.quota.charge_block(txn, owner)?;
                        let goal = self.storage.group_first_block(state.block_group);
                        let block = self.storage.allocate(txn, goal)?;
                        debug!("creating block {}", block);
                        let buffer = self.storage.new_buffer(block)?;
                        buffer.lock().copy_from_slice(&content);
                        txn.mark_dirty(&buffer);
                        txn.set_feature(EXT2_FEATURE_COMPAT_EXT_ATTR);
                        cache_insert = Some((block, hash));
                        Some(buffer)
                    }
                },
            }
        };

        let new = new_buffer.as_ref().map_or(0, |b| b.block());
        let record = OwnerRecord { xattr_block: new, ctime: Local::now() };
        txn.update_owner(owner, record);
        if state.is_sync() {
            txn.set_sync();
        }
        if let Some(buffer) = &old_buffer {
            if new != old {
                self.release_block(txn, owner, buffer)?;
            }
        }
        Ok(Some(Pending { record, cache_insert }))
    }

    /// Find a cached block equal to `content` and take a reference to it.
    /// `old` is the owner's current block, which is kept as is if it matches.
    fn cache_find(&self, txn: &mut Transaction, owner: OwnerId, content: &[u8], hash: u32,
                  old: BlockId) -> Result<Option<Arc<BlockBuffer>>> {
        if hash == 0 {
            return Ok(None);
        }
        let device = self.device();
        debug!("looking for cached blocks [{:x}]", hash);
        for block in self.ctx.cache().lookup(device, hash) {
            let buffer = match self.storage.read_buffer(block) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("block {} read error: {}", block, e);
                    continue;
                }
            };
            let mut data = buffer.lock();
            // freed or rewritten since the lookup
            if self.ctx.cache().hash_of(device, block) != Some(hash) {
                continue;
            }
            let refcount = match codec::refcount(&data) {
                Ok(refcount) => refcount,
                Err(_) => continue,
            };
            if refcount == 0 || refcount > XATTR_REFCOUNT_MAX {
                debug!("block {}: refcount {} not shareable", block, refcount);
                continue;
            }
            match codec::compare(content, &data) {
                Ok(BlockMatch::Equal) => {}
                Ok(BlockMatch::Differ) => continue,
                Err(c) => {
                    self.ctx.report_corruption(&XattrError::CorruptBlock { owner, block, reason: c.0 });
                    continue;
                }
            }
            if block == old {
                debug!("block {}: keeping this block", block);
                drop(data);
                return Ok(Some(buffer));
            }
            self.quota.charge_block(txn, owner)?;
            codec::set_refcount(&mut data, refcount + 1).map_err(self.corrupt(owner, block))?;
            txn.refcount_changed(&buffer, 1);
            txn.mark_dirty(&buffer);
            debug!("block {}: reusing block, refcount now={}", block, refcount + 1);
            drop(data);
            return Ok(Some(buffer));
        }
        Ok(None)
    }

    /// Drop the owner's reference to `buffer` on commit, the last one frees
    /// the block
    fn release_block(&self, txn: &mut Transaction, owner: OwnerId, buffer: &Arc<BlockBuffer>) -> Result<()> {
        let block = buffer.block();
        let refcount = codec::refcount(&buffer.read()).map_err(self.corrupt(owner, block))?;
        debug!("block {}: releasing, refcount {}", block, refcount);
        txn.release(buffer);
        self.quota.release_block(txn, owner);
        Ok(())
    }

    /// Release every attribute resource of an owner about to be destroyed
    pub fn delete_all(&self, owner: &mut Owner) -> Result<()> {
        let id = owner.id();
        let state = owner.state_mut();
        let block = state.xattr_block;
        if block == 0 {
            return Ok(());
        }
        debug!("delete_all owner={} block={}", id, block);
        let mut txn = self.begin()?;
        if let Err(e) = self.delete_all_handle(&mut txn, id, block) {
            self.journal.abort(txn);
            return Err(e);
        }
        txn.update_owner(id, OwnerRecord { xattr_block: 0, ctime: state.ctime });
        self.journal.commit(txn)?;
        state.xattr_block = 0;
        Ok(())
    }

    fn delete_all_handle(&self, txn: &mut Transaction, owner: OwnerId, block: BlockId) -> Result<()> {
        let buffer = self.storage.read_buffer(block).map_err(|e| {
            error!("owner {}: block {} read error: {}", owner, block, e);
            e
        })?;
        codec::check_header(&buffer.read()).map_err(self.corrupt(owner, block))?;
        self.release_block(txn, owner, &buffer)
    }

    /// Get by full name, such as `user.comment`
    pub fn getxattr(&self, owner: &Owner, full_name: &str, buf: Option<&mut [u8]>) -> Result<usize> {
        let (handler, name) = self.ctx.handlers().resolve(full_name).ok_or(XattrError::NotSupported)?;
        handler.get(self, owner, name, buf)
    }

    /// Set by full name. An empty value is stored as such.
    pub fn setxattr(&self, owner: &Owner, full_name: &str, value: &[u8], mode: SetMode) -> Result<()> {
        let (handler, name) = self.ctx.handlers().resolve(full_name).ok_or(XattrError::NotSupported)?;
        handler.set(self, owner, name, Some(value), mode)
    }

    pub fn listxattr(&self, owner: &Owner, buf: Option<&mut [u8]>) -> Result<usize> {
        self.list(owner, buf)
    }

    pub fn removexattr(&self, owner: &Owner, full_name: &str) -> Result<()> {
        let (handler, name) = self.ctx.handlers().resolve(full_name).ok_or(XattrError::NotSupported)?;
        handler.set(self, owner, name, None, SetMode::ReplaceOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eafs_lib::context::MountOptions;
    use crate::eafs_lib::volume::{OwnerStore, VolumeConfig};
    use disk_driver::memory::MemoryDiskDriver;
    use anyhow::Result;

    const USER: u8 = 1;

    fn store() -> Result<(XattrStore, Arc<Volume<MemoryDiskDriver>>)> {
        let ctx = XattrContext::init(MountOptions::default())?;
        let volume = Arc::new(Volume::new(MemoryDiskDriver::new(), VolumeConfig::default())?);
        Ok((XattrStore::on_volume(ctx, volume.clone()), volume))
    }

    fn value(store: &XattrStore, owner: &Owner, name: &str) -> Result<Vec<u8>> {
        let size = store.get(owner, USER, name, None)?;
        let mut buf = vec![0 as u8; size];
        store.get(owner, USER, name, Some(&mut buf))?;
        Ok(buf)
    }

    fn refcount(volume: &Volume<MemoryDiskDriver>, block: BlockId) -> Result<u32> {
        let buffer = volume.read_buffer(block)?;
        let data = buffer.read();
        codec::refcount(&data).map_err(|c| anyhow::anyhow!("{:?}", c))
    }

    #[test]
    fn set_get_remove() -> Result<()> {
        let (store, volume) = store()?;
        let owner = Owner::new(1, 0);
        store.set(&owner, USER, "foo", Some(b"bar"), SetMode::Any)?;
        assert_eq!(value(&store, &owner, "foo")?, b"bar");
        assert!(volume.has_feature(EXT2_FEATURE_COMPAT_EXT_ATTR));
        assert_eq!(volume.load_owner(1).map(|r| r.xattr_block), Some(owner.xattr_block()));
        assert!(matches!(store.set(&owner, USER, "foo", Some(b"bazz"), SetMode::CreateOnly),
            Err(XattrError::AlreadyExists)));
        store.remove(&owner, USER, "foo")?;
        assert!(matches!(store.get(&owner, USER, "foo", None), Err(XattrError::NotFound)));
        // the last attribute took the block with it
        assert_eq!(owner.xattr_block(), 0);
        assert_eq!(volume.quota_usage(1), 0);
        Ok(())
    }

    #[test]
    fn in_place_edit_keeps_block() -> Result<()> {
        let (store, volume) = store()?;
        let owner = Owner::new(1, 0);
        store.set(&owner, USER, "a", Some(b"1"), SetMode::Any)?;
        let block = owner.xattr_block();
        store.set(&owner, USER, "b", Some(b"2"), SetMode::Any)?;
        store.set(&owner, USER, "a", Some(b"11111"), SetMode::ReplaceOnly)?;
        assert_eq!(owner.xattr_block(), block);
        assert_eq!(refcount(&volume, block)?, 1);
        assert_eq!(value(&store, &owner, "a")?, b"11111");
        assert_eq!(value(&store, &owner, "b")?, b"2");
        assert_eq!(volume.quota_usage(1), 1);
        Ok(())
    }

    #[test]
    fn shared_block_is_cloned() -> Result<()> {
        let (store, volume) = store()?;
        let a = Owner::new(1, 0);
        let b = Owner::new(2, 0);
        store.set(&a, USER, "k", Some(b"v"), SetMode::Any)?;
        store.set(&b, USER, "k", Some(b"v"), SetMode::Any)?;
        let shared = a.xattr_block();
        assert_eq!(b.xattr_block(), shared);
        assert_eq!(refcount(&volume, shared)?, 2);

        store.set(&b, USER, "k", Some(b"w"), SetMode::Any)?;
        assert_ne!(b.xattr_block(), shared);
        assert_eq!(refcount(&volume, shared)?, 1);
        assert_eq!(value(&store, &a, "k")?, b"v");
        assert_eq!(value(&store, &b, "k")?, b"w");

        // back to the shared content, the copy is freed
        let copy = b.xattr_block();
        store.set(&b, USER, "k", Some(b"v"), SetMode::Any)?;
        assert_eq!(b.xattr_block(), shared);
        assert!(!volume.is_allocated(copy));
        assert_eq!(refcount(&volume, shared)?, 2);
        Ok(())
    }

    #[test]
    fn no_op_removal() -> Result<()> {
        let (store, _volume) = store()?;
        let owner = Owner::new(1, 0);
        store.set(&owner, USER, "gone", None, SetMode::Any)?;
        assert!(matches!(store.remove(&owner, USER, "gone"), Err(XattrError::NotFound)));
        assert_eq!(owner.xattr_block(), 0);
        Ok(())
    }

    #[test]
    fn argument_checks() -> Result<()> {
        let (store, _volume) = store()?;
        let owner = Owner::new(1, 0);
        let long = "n".repeat(XATTR_NAME_MAX + 1);
        assert!(matches!(store.set(&owner, USER, &long, Some(b"x"), SetMode::Any), Err(XattrError::Range)));
        assert!(matches!(store.get(&owner, USER, &long, None), Err(XattrError::Range)));
        let big = vec![0 as u8; 0x401];
        assert!(matches!(store.set(&owner, USER, "x", Some(&big), SetMode::Any), Err(XattrError::Range)));
        let fits_not = vec![0 as u8; 0x400 - 36];
        assert!(matches!(store.set(&owner, USER, "x", Some(&fits_not), SetMode::Any), Err(XattrError::NoSpace)));
        let fits = vec![7 as u8; 0x400 - 36 - 20];
        store.set(&owner, USER, "x", Some(&fits), SetMode::Any)?;
        assert_eq!(value(&store, &owner, "x")?, fits);
        Ok(())
    }

    #[test]
    fn delete_all_releases() -> Result<()> {
        let (store, volume) = store()?;
        let mut a = Owner::new(1, 0);
        let mut b = Owner::new(2, 0);
        store.set(&a, USER, "k", Some(b"v"), SetMode::Any)?;
        store.set(&b, USER, "k", Some(b"v"), SetMode::Any)?;
        let block = a.xattr_block();
        store.delete_all(&mut a)?;
        assert_eq!(a.xattr_block(), 0);
        assert_eq!(refcount(&volume, block)?, 1);
        assert!(store.context().cache().contains(volume.config().device, block));
        store.delete_all(&mut b)?;
        assert!(!volume.is_allocated(block));
        assert!(!store.context().cache().contains(volume.config().device, block));
        assert_eq!(volume.quota_usage(1) + volume.quota_usage(2), 0);
        Ok(())
    }
}
