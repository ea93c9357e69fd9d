/// Extended attribute block store
pub use disk_driver;

pub mod utils;
pub mod desc;
pub mod error;
pub mod codec;
pub mod buffer;
pub mod cache;
pub mod journal;
pub mod volume;
pub mod owner;
pub mod handler;
pub mod context;
pub mod xattr;
pub mod shell;

/// Filesystem block number, 0 means no block
pub type BlockId = u32;
/// Volume identifier used to partition the sharing cache
pub type DeviceId = u32;

pub use error::{Result, XattrError};
pub use owner::{Owner, OwnerId};
pub use context::{MountOptions, XattrContext};
pub use volume::{Volume, VolumeConfig};
pub use xattr::{SetMode, XattrStore};
