//! Extended attribute blocks, shared between owners with equal attribute sets
pub mod eafs_lib;

pub use eafs_lib::{
    MountOptions, Owner, OwnerId, Result, SetMode, Volume, VolumeConfig, XattrContext, XattrError, XattrStore,
};
