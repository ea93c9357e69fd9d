use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::eafs_lib::BlockId;
use crate::eafs_lib::error::Result;

/// In-memory image of one attribute block.
///
/// There is exactly one buffer per block number, so the buffer lock is the
/// lock of the block. Content and reference count change only under the
/// exclusive lock, readers share it. A thread never holds two buffer locks at
/// once.
#[derive(Debug)]
pub struct BlockBuffer {
    block: BlockId,
    data: RwLock<Box<[u8]>>,
}

impl BlockBuffer {
    pub fn new(block: BlockId, data: Box<[u8]>) -> Self {
        Self { block, data: RwLock::new(data) }
    }

    pub fn block(&self) -> BlockId { self.block }

    /// Exclusive access, for edits and reference count changes
    pub fn lock(&self) -> RwLockWriteGuard<'_, Box<[u8]>> { self.data.write() }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> { self.data.read() }

    /// Private copy of the current content
    pub fn snapshot(&self) -> Result<Box<[u8]>> {
        scratch_copy(&self.read())
    }
}

/// Zeroed block sized scratch buffer, allocation failure is reported
pub fn scratch(len: usize) -> Result<Box<[u8]>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, 0);
    Ok(v.into_boxed_slice())
}

pub fn scratch_copy(src: &[u8]) -> Result<Box<[u8]>> {
    let mut v = Vec::new();
    v.try_reserve_exact(src.len())?;
    v.extend_from_slice(src);
    Ok(v.into_boxed_slice())
}
