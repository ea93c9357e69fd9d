use libc::c_int;
use thiserror::Error;
use crate::eafs_lib::BlockId;
use crate::eafs_lib::owner::OwnerId;

pub type Result<T, E = XattrError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum XattrError {
    #[error("attribute not found")]
    NotFound,
    #[error("attribute already exists")]
    AlreadyExists,
    #[error("no space left in attribute block")]
    NoSpace,
    #[error("owner {owner}: bad attribute block {block}: {reason}")]
    CorruptBlock { owner: OwnerId, block: BlockId, reason: &'static str },
    #[error("i/o failure: {0:#}")]
    Io(anyhow::Error),
    #[error("out of memory")]
    OutOfMemory,
    #[error("read-only volume")]
    ReadOnly,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("disk quota exceeded")]
    QuotaExceeded,
    #[error("result out of range")]
    Range,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NotSupported,
}

impl XattrError {
    /// errno reported to file-level callers
    pub fn errno(&self) -> c_int {
        match self {
            XattrError::NotFound => libc::ENODATA,
            XattrError::AlreadyExists => libc::EEXIST,
            XattrError::NoSpace => libc::ENOSPC,
            XattrError::CorruptBlock { .. } | XattrError::Io(_) => libc::EIO,
            XattrError::OutOfMemory => libc::ENOMEM,
            XattrError::ReadOnly => libc::EROFS,
            XattrError::PermissionDenied => libc::EPERM,
            XattrError::QuotaExceeded => libc::EDQUOT,
            XattrError::Range => libc::ERANGE,
            XattrError::InvalidArgument => libc::EINVAL,
            XattrError::NotSupported => libc::EOPNOTSUPP,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, XattrError::CorruptBlock { .. })
    }
}

impl From<anyhow::Error> for XattrError {
    fn from(e: anyhow::Error) -> Self {
        XattrError::Io(e)
    }
}

impl From<std::collections::TryReserveError> for XattrError {
    fn from(_: std::collections::TryReserveError) -> Self {
        XattrError::OutOfMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn errno_mapping() {
        assert_eq!(XattrError::NotFound.errno(), libc::ENODATA);
        assert_eq!(XattrError::CorruptBlock { owner: 3, block: 9, reason: "bad magic" }.errno(), libc::EIO);
        assert_eq!(XattrError::from(anyhow!("disk gone")).errno(), libc::EIO);
        assert_eq!(XattrError::QuotaExceeded.errno(), libc::EDQUOT);
    }

    #[test]
    fn corrupt_message() {
        let e = XattrError::CorruptBlock { owner: 12, block: 40, reason: "entry past end of block" };
        assert_eq!(e.to_string(), "owner 12: bad attribute block 40: entry past end of block");
        assert!(e.is_corruption());
    }
}
