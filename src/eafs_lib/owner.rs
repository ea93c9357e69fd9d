use chrono::{DateTime, Local};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::eafs_lib::BlockId;
use crate::eafs_lib::desc::*;

pub type OwnerId = u64;

/// Attribute related part of an owner (an inode, in filesystem terms)
#[derive(Debug, Clone)]
pub struct OwnerState {
    /// Attribute block, 0 when the owner has no attributes
    pub xattr_block: BlockId,
    pub ctime: DateTime<Local>,
    pub flags: u32,
    /// Block group the owner lives in, fresh blocks are allocated near it
    pub block_group: u32,
}

impl OwnerState {
    pub fn is_immutable(&self) -> bool {
        self.flags & (EXT2_IMMUTABLE_FL | EXT2_APPEND_FL) != 0
    }

    pub fn is_sync(&self) -> bool {
        self.flags & EXT2_SYNC_FL != 0
    }
}

/// Persistent part of an owner, written by transaction commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerRecord {
    pub xattr_block: BlockId,
    pub ctime: DateTime<Local>,
}

/// One attribute owner.
///
/// The state lock serializes attribute changes of this owner: lookups take
/// it shared, mutations exclusive for their whole duration.
#[derive(Debug)]
pub struct Owner {
    id: OwnerId,
    state: RwLock<OwnerState>,
}

impl Owner {
    pub fn new(id: OwnerId, block_group: u32) -> Self {
        Self {
            id,
            state: RwLock::new(OwnerState {
                xattr_block: 0,
                ctime: Local::now(),
                flags: 0,
                block_group,
            }),
        }
    }

    /// Rebuild an owner from what the owner store holds
    pub fn from_record(id: OwnerId, block_group: u32, record: &OwnerRecord) -> Self {
        let owner = Self::new(id, block_group);
        {
            let mut state = owner.state.write();
            state.xattr_block = record.xattr_block;
            state.ctime = record.ctime;
        }
        owner
    }

    pub fn id(&self) -> OwnerId { self.id }

    pub fn read(&self) -> RwLockReadGuard<'_, OwnerState> { self.state.read() }

    pub fn write(&self) -> RwLockWriteGuard<'_, OwnerState> { self.state.write() }

    /// Direct access for an owner nobody else can reach any more
    pub fn state_mut(&mut self) -> &mut OwnerState { self.state.get_mut() }

    pub fn xattr_block(&self) -> BlockId { self.state.read().xattr_block }

    pub fn set_flags(&self, flags: u32) { self.state.write().flags = flags; }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let owner = Owner::new(12, 0);
        assert!(!owner.read().is_immutable());
        owner.set_flags(EXT2_APPEND_FL);
        assert!(owner.read().is_immutable());
        owner.set_flags(EXT2_SYNC_FL);
        assert!(owner.read().is_sync() && !owner.read().is_immutable());
    }

    #[test]
    fn from_record() {
        let record = OwnerRecord { xattr_block: 77, ctime: Local::now() };
        let mut owner = Owner::from_record(3, 1, &record);
        assert_eq!(owner.xattr_block(), 77);
        owner.state_mut().xattr_block = 0;
        assert_eq!(owner.xattr_block(), 0);
        assert_eq!(owner.read().block_group, 1);
    }
}
