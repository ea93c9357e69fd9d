//! Attribute namespaces.
//!
//! A full attribute name such as `user.mime_type` is split into a handler,
//! chosen by prefix, and the bare name stored in the block under the
//! handler's name index.
use std::sync::Arc;
use log::debug;
use parking_lot::RwLock;
use crate::eafs_lib::context::MountOptions;
use crate::eafs_lib::desc::*;
use crate::eafs_lib::error::{Result, XattrError};
use crate::eafs_lib::owner::Owner;
use crate::eafs_lib::xattr::{SetMode, XattrStore};

pub trait XattrHandler: Send + Sync {
    fn prefix(&self) -> &'static str;

    fn name_index(&self) -> u8;

    /// Bytes a listing shows for `name`, empty to hide it
    fn list(&self, _options: &MountOptions, name: &[u8]) -> Vec<u8> {
        let prefix = self.prefix().as_bytes();
        let mut out = Vec::with_capacity(prefix.len() + name.len() + 1);
        out.extend_from_slice(prefix);
        out.extend_from_slice(name);
        out.push(0);
        out
    }

    fn get(&self, store: &XattrStore, owner: &Owner, name: &str, buf: Option<&mut [u8]>) -> Result<usize> {
        if name.is_empty() {
            return Err(XattrError::InvalidArgument);
        }
        store.get(owner, self.name_index(), name, buf)
    }

    fn set(&self, store: &XattrStore, owner: &Owner, name: &str, value: Option<&[u8]>, mode: SetMode) -> Result<()> {
        if name.is_empty() {
            return Err(XattrError::InvalidArgument);
        }
        store.set(owner, self.name_index(), name, value, mode)
    }
}

/// `user.` namespace, subject to the `user_xattr` mount option
pub struct UserHandler;

impl XattrHandler for UserHandler {
    fn prefix(&self) -> &'static str { "user." }

    fn name_index(&self) -> u8 { NameIndex::User.into() }

    fn list(&self, options: &MountOptions, name: &[u8]) -> Vec<u8> {
        if !options.user_xattr {
            return vec![];
        }
        let mut out = b"user.".to_vec();
        out.extend_from_slice(name);
        out.push(0);
        out
    }

    fn get(&self, store: &XattrStore, owner: &Owner, name: &str, buf: Option<&mut [u8]>) -> Result<usize> {
        if name.is_empty() {
            return Err(XattrError::InvalidArgument);
        }
        if !store.context().options().user_xattr {
            return Err(XattrError::NotSupported);
        }
        store.get(owner, self.name_index(), name, buf)
    }

    fn set(&self, store: &XattrStore, owner: &Owner, name: &str, value: Option<&[u8]>, mode: SetMode) -> Result<()> {
        if name.is_empty() {
            return Err(XattrError::InvalidArgument);
        }
        if !store.context().options().user_xattr {
            return Err(XattrError::NotSupported);
        }
        store.set(owner, self.name_index(), name, value, mode)
    }
}

/// `trusted.` namespace
pub struct TrustedHandler;

impl XattrHandler for TrustedHandler {
    fn prefix(&self) -> &'static str { "trusted." }

    fn name_index(&self) -> u8 { NameIndex::Trusted.into() }
}

/// `security.` namespace
pub struct SecurityHandler;

impl XattrHandler for SecurityHandler {
    fn prefix(&self) -> &'static str { "security." }

    fn name_index(&self) -> u8 { NameIndex::Security.into() }
}

/// Handlers by name index, 1 to [`XATTR_INDEX_MAX`]
pub struct HandlerRegistry {
    slots: RwLock<[Option<Arc<dyn XattrHandler>>; XATTR_INDEX_MAX]>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { slots: RwLock::new(Default::default()) }
    }

    fn slot(index: u8) -> Result<usize> {
        match index as usize {
            i @ 1..=XATTR_INDEX_MAX => Ok(i - 1),
            _ => Err(XattrError::InvalidArgument),
        }
    }

    pub fn register(&self, handler: Arc<dyn XattrHandler>) -> Result<()> {
        let slot = Self::slot(handler.name_index())?;
        let mut slots = self.slots.write();
        if slots[slot].is_some() {
            return Err(XattrError::InvalidArgument);
        }
        debug!("register xattr handler {} at index {}", handler.prefix(), handler.name_index());
        slots[slot] = Some(handler);
        Ok(())
    }

    pub fn unregister(&self, index: u8) -> Option<Arc<dyn XattrHandler>> {
        let slot = Self::slot(index).ok()?;
        self.slots.write()[slot].take()
    }

    pub fn get(&self, index: u8) -> Option<Arc<dyn XattrHandler>> {
        let slot = Self::slot(index).ok()?;
        self.slots.read()[slot].clone()
    }

    /// Handler with the longest prefix of `full_name`, and the rest of the name
    pub fn resolve<'n>(&self, full_name: &'n str) -> Option<(Arc<dyn XattrHandler>, &'n str)> {
        let slots = self.slots.read();
        slots.iter()
            .flatten()
            .filter(|h| full_name.starts_with(h.prefix()))
            .max_by_key(|h| h.prefix().len())
            .map(|h| (h.clone(), &full_name[h.prefix().len()..]))
    }

    pub fn clear(&self) {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct Fake(u8, &'static str);

    impl XattrHandler for Fake {
        fn prefix(&self) -> &'static str { self.1 }
        fn name_index(&self) -> u8 { self.0 }
    }

    #[test]
    fn registration_bounds() -> Result<()> {
        let registry = HandlerRegistry::new();
        assert!(matches!(registry.register(Arc::new(Fake(0, "zero."))), Err(XattrError::InvalidArgument)));
        assert!(matches!(registry.register(Arc::new(Fake(11, "big."))), Err(XattrError::InvalidArgument)));
        registry.register(Arc::new(Fake(10, "ten.")))?;
        registry.register(Arc::new(UserHandler))?;
        assert!(matches!(registry.register(Arc::new(Fake(1, "again."))), Err(XattrError::InvalidArgument)));
        assert_eq!(registry.len(), 2);
        assert!(registry.unregister(11).is_none());
        assert!(registry.unregister(10).is_some());
        assert!(registry.get(10).is_none());
        assert_eq!(registry.get(1).map(|h| h.prefix()), Some("user."));
        Ok(())
    }

    #[test]
    fn longest_prefix_wins() -> Result<()> {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Fake(7, "sys.")))?;
        registry.register(Arc::new(Fake(8, "sys.admin.")))?;
        let (h, rest) = registry.resolve("sys.admin.key").ok_or_else(|| anyhow::anyhow!("unresolved"))?;
        assert_eq!((h.name_index(), rest), (8, "key"));
        let (h, rest) = registry.resolve("sys.other").ok_or_else(|| anyhow::anyhow!("unresolved"))?;
        assert_eq!((h.name_index(), rest), (7, "other"));
        assert!(registry.resolve("nope.x").is_none());
        registry.clear();
        assert!(registry.resolve("sys.other").is_none());
        Ok(())
    }

    #[test]
    fn list_format() {
        let on = MountOptions { user_xattr: true };
        let off = MountOptions { user_xattr: false };
        assert_eq!(UserHandler.list(&on, b"foo"), b"user.foo\0".to_vec());
        assert!(UserHandler.list(&off, b"foo").is_empty());
        assert_eq!(SecurityHandler.list(&off, b"selinux"), b"security.selinux\0".to_vec());
    }
}
