//! Content addressed index of attribute blocks.
//!
//! Maps a block hash to the blocks that carried it when they were inserted.
//! Candidates may collide, callers confirm a match with
//! [`codec::compare`](crate::eafs_lib::codec::compare).
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use log::debug;
use parking_lot::{Mutex, RwLock};
use crate::eafs_lib::{BlockId, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsert {
    Inserted,
    /// The block was already indexed under this hash
    AlreadyCached,
}

#[derive(Debug, Default)]
struct DeviceIndex {
    by_block: HashMap<BlockId, u32>,
    by_hash: HashMap<u32, BTreeSet<BlockId>>,
}

impl DeviceIndex {
    fn remove(&mut self, block: BlockId) -> Option<u32> {
        let hash = self.by_block.remove(&block)?;
        if let Some(set) = self.by_hash.get_mut(&hash) {
            set.remove(&block);
            if set.is_empty() {
                self.by_hash.remove(&hash);
            }
        }
        Some(hash)
    }
}

/// Sharing cache. Each device has its own index behind its own lock, so
/// flushing one device never waits on lookups of another.
#[derive(Debug, Default)]
pub struct SharingCache {
    devices: RwLock<HashMap<DeviceId, Arc<Mutex<DeviceIndex>>>>,
}

impl SharingCache {
    pub fn new() -> Self { Default::default() }

    fn device(&self, device: DeviceId) -> Option<Arc<Mutex<DeviceIndex>>> {
        self.devices.read().get(&device).cloned()
    }

    fn device_or_create(&self, device: DeviceId) -> Arc<Mutex<DeviceIndex>> {
        if let Some(index) = self.device(device) {
            return index;
        }
        self.devices.write().entry(device).or_default().clone()
    }

    /// Index `block` under `hash`. A block indexed under another hash is moved.
    pub fn insert(&self, device: DeviceId, block: BlockId, hash: u32) -> CacheInsert {
        let index = self.device_or_create(device);
        let mut index = index.lock();
        match index.by_block.get(&block).copied() {
            Some(old) if old == hash => return CacheInsert::AlreadyCached,
            Some(_) => { index.remove(block); }
            None => {}
        }
        index.by_block.insert(block, hash);
        index.by_hash.entry(hash).or_default().insert(block);
        CacheInsert::Inserted
    }

    /// Forget a block, returns whether it was indexed
    pub fn remove(&self, device: DeviceId, block: BlockId) -> bool {
        match self.device(device) {
            Some(index) => index.lock().remove(block).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, device: DeviceId, block: BlockId) -> bool {
        self.device(device).map_or(false, |index| index.lock().by_block.contains_key(&block))
    }

    /// Hash a block is indexed under
    pub fn hash_of(&self, device: DeviceId, block: BlockId) -> Option<u32> {
        self.device(device).and_then(|index| index.lock().by_block.get(&block).copied())
    }

    /// Candidates for `hash`, fetched one at a time. Blocks removed while
    /// iterating are not returned; blocks added behind the cursor are.
    pub fn lookup(&self, device: DeviceId, hash: u32) -> Candidates<'_> {
        Candidates { cache: self, device, hash, last: None }
    }

    /// Drop everything indexed for one device, returns the number of blocks
    pub fn flush_device(&self, device: DeviceId) -> usize {
        let removed = self.devices.write().remove(&device);
        let count = removed.map_or(0, |index| index.lock().by_block.len());
        debug!("cache flush device {}: {} blocks", device, count);
        count
    }

    /// Drop everything, returns the number of blocks
    pub fn clear(&self) -> usize {
        let devices: Vec<_> = self.devices.write().drain().collect();
        devices.iter().map(|(_, index)| index.lock().by_block.len()).sum()
    }

    pub fn len(&self) -> usize {
        let devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.iter().map(|index| index.lock().by_block.len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Cursor over the candidates of one hash
pub struct Candidates<'a> {
    cache: &'a SharingCache,
    device: DeviceId,
    hash: u32,
    last: Option<BlockId>,
}

impl<'a> Iterator for Candidates<'a> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        let index = self.cache.device(self.device)?;
        let index = index.lock();
        let set = index.by_hash.get(&self.hash)?;
        let next = match self.last {
            None => set.iter().next(),
            Some(last) => set.range((Excluded(last), Unbounded)).next(),
        }.copied();
        self.last = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn insert_lookup_remove() {
        let cache = SharingCache::new();
        assert_eq!(cache.insert(0, 10, 0xabc), CacheInsert::Inserted);
        assert_eq!(cache.insert(0, 10, 0xabc), CacheInsert::AlreadyCached);
        assert_eq!(cache.insert(0, 11, 0xabc), CacheInsert::Inserted);
        assert_eq!(cache.insert(0, 12, 0x123), CacheInsert::Inserted);
        assert_eq!(cache.lookup(0, 0xabc).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(cache.lookup(1, 0xabc).count(), 0);
        assert!(cache.remove(0, 10));
        assert!(!cache.remove(0, 10));
        assert_eq!(cache.lookup(0, 0xabc).collect::<Vec<_>>(), vec![11]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn rehash_moves_block() {
        let cache = SharingCache::new();
        cache.insert(0, 10, 1);
        assert_eq!(cache.insert(0, 10, 2), CacheInsert::Inserted);
        assert_eq!(cache.lookup(0, 1).count(), 0);
        assert_eq!(cache.hash_of(0, 10), Some(2));
    }

    #[test]
    fn cursor_sees_concurrent_removal() {
        let cache = SharingCache::new();
        for b in 1..=3 {
            cache.insert(0, b, 7);
        }
        let mut cursor = cache.lookup(0, 7);
        assert_eq!(cursor.next(), Some(1));
        cache.remove(0, 2);
        assert_eq!(cursor.next(), Some(3));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn flush_one_device() {
        let cache = SharingCache::new();
        cache.insert(0, 10, 1);
        cache.insert(1, 10, 1);
        cache.insert(1, 11, 1);
        assert_eq!(cache.flush_device(1), 2);
        assert!(cache.contains(0, 10));
        assert!(!cache.contains(1, 10));
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_inserts() {
        let cache = Arc::new(SharingCache::new());
        let handles: Vec<_> = (0..4).map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for b in 0..100 {
                    cache.insert(t % 2, t * 1000 + b, b % 7);
                }
            })
        }).collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
        assert_eq!(cache.lookup(0, 3).count(), 2 * 14);
    }
}
