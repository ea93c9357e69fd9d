//! On-disk format of extended attribute blocks.
//!
//! ```text
//!   +------------------+
//!   | header           |
//!   | entry 1          | |
//!   | entry 2          | | growing downwards
//!   | entry 3          | v
//!   | four null bytes  |
//!   | . . .            |
//!   | value 1          | ^
//!   | value 3          | | growing upwards
//!   | value 2          | |
//!   +------------------+
//! ```
//!
//! Entry descriptors are variable in size, aligned to [`XATTR_PAD`] and sorted
//! by (name index, name length, name). Values are aligned to the end of the
//! block in no specific order, padded to [`XATTR_PAD`], with no gaps between
//! them. All multi-byte fields are little endian.
use std::mem::size_of;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/* Magic value in attribute blocks */
pub const XATTR_MAGIC: u32 = 0xEA020000;

/* Maximum number of references to one attribute block */
pub const XATTR_REFCOUNT_MAX: u32 = 1024;

/* Number of attribute name indices a handler may be registered for */
pub const XATTR_INDEX_MAX: usize = 10;

/* Longest attribute name, without prefix */
pub const XATTR_NAME_MAX: usize = 255;

/* Journal credits of one attribute transaction */
pub const XATTR_TRANS_BLOCKS: usize = 6;

pub const XATTR_PAD_BITS: usize = 2;
pub const XATTR_PAD: usize = 1usize << XATTR_PAD_BITS;
pub const XATTR_ROUND: usize = XATTR_PAD - 1;

/// Block header, at offset 0 of every attribute block
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct XattrHeader {
    pub h_magic: U32<LittleEndian>,    /* magic number for identification */
    pub h_refcount: U32<LittleEndian>, /* reference count */
    pub h_blocks: U32<LittleEndian>,   /* number of disk blocks used */
    pub h_hash: U32<LittleEndian>,     /* hash value of all attributes */
    pub h_reserved: [U32<LittleEndian>; 4], /* zero right now */
}

/// Attribute descriptor, followed by `e_name_len` name bytes
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct XattrEntry {
    pub e_name_len: u8,                   /* length of name */
    pub e_name_index: u8,                 /* attribute name index */
    pub e_value_offs: U16<LittleEndian>,  /* offset in disk block of value */
    pub e_value_block: U32<LittleEndian>, /* disk block attribute is stored on (n/i) */
    pub e_value_size: U32<LittleEndian>,  /* size of attribute value */
    pub e_hash: U32<LittleEndian>,        /* hash value of name and value */
}

pub const XATTR_HEADER_SIZE: usize = size_of::<XattrHeader>();
pub const XATTR_ENTRY_SIZE: usize = size_of::<XattrEntry>();
/// The zeroed word terminating the entry list
pub const XATTR_LAST_ENTRY_SIZE: usize = size_of::<u32>();

/// Bytes taken by an entry descriptor with a name of `name_len`
pub const fn xattr_len(name_len: usize) -> usize {
    (name_len + XATTR_ROUND + XATTR_ENTRY_SIZE) & !XATTR_ROUND
}

/// Bytes taken by a value of `size` in the value region
pub const fn xattr_size(size: usize) -> usize {
    (size + XATTR_ROUND) & !XATTR_ROUND
}

impl XattrHeader {
    /// Header of a block that has just been created for one owner
    pub fn new() -> Self {
        let mut header = Self::new_zeroed();
        header.h_magic.set(XATTR_MAGIC);
        header.h_refcount.set(1);
        header.h_blocks.set(1);
        header
    }

    pub fn magic_matched(&self) -> bool {
        self.h_magic.get() == XATTR_MAGIC && self.h_blocks.get() == 1
    }
}

impl XattrEntry {
    pub fn new(name_index: u8, name_len: u8) -> Self {
        let mut entry = Self::new_zeroed();
        entry.e_name_index = name_index;
        entry.e_name_len = name_len;
        entry
    }
}

/// Attribute name index, stored in `e_name_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NameIndex {
    User = 1,
    PosixAclAccess = 2,
    PosixAclDefault = 3,
    Trusted = 4,
    Lustre = 5,
    Security = 6,
}

/*
 * Owner flags
 */
pub const EXT2_SYNC_FL: u32 = 0x00000008      /* Synchronous updates */;
pub const EXT2_IMMUTABLE_FL: u32 = 0x00000010 /* Immutable file */;
pub const EXT2_APPEND_FL: u32 = 0x00000020    /* writes to file may only append */;

/*
 * Compat feature set on a volume once an attribute block exists
 */
pub const EXT2_FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn struct_sizes() {
        assert_eq!(XATTR_HEADER_SIZE, 32);
        assert_eq!(XATTR_ENTRY_SIZE, 16);
    }

    #[test]
    fn padded_sizes() {
        assert_eq!(xattr_len(0), 16);
        assert_eq!(xattr_len(1), 20);
        assert_eq!(xattr_len(4), 20);
        assert_eq!(xattr_len(5), 24);
        assert_eq!(xattr_size(0), 0);
        assert_eq!(xattr_size(3), 4);
        assert_eq!(xattr_size(4), 4);
        assert_eq!(xattr_size(9), 12);
    }

    #[test]
    fn header_layout() -> Result<()> {
        let header = XattrHeader::new();
        let bytes = header.as_bytes();
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x02, 0xEA]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        let back = XattrHeader::read_from(bytes).ok_or_else(|| anyhow::anyhow!("short header"))?;
        assert!(back.magic_matched());
        Ok(())
    }

    #[test]
    fn name_index_conversion() {
        assert_eq!(NameIndex::try_from(6u8).ok(), Some(NameIndex::Security));
        assert!(NameIndex::try_from(0u8).is_err());
        assert_eq!(u8::from(NameIndex::Trusted), 4);
    }
}
