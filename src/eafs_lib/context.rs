use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{error, info};
use crate::eafs_lib::DeviceId;
use crate::eafs_lib::cache::SharingCache;
use crate::eafs_lib::error::{Result, XattrError};
use crate::eafs_lib::handler::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Allow the `user.` namespace
    pub user_xattr: bool,
}

impl Default for MountOptions {
    fn default() -> Self { Self { user_xattr: true } }
}

/// State shared by every attribute store of a process: the sharing cache,
/// the namespace handlers and the mount options.
pub struct XattrContext {
    cache: SharingCache,
    handlers: HandlerRegistry,
    options: MountOptions,
    corruption_reports: AtomicU64,
}

impl XattrContext {
    /// Create a context with the standard namespaces registered
    pub fn init(options: MountOptions) -> Result<Arc<Self>> {
        let ctx = Self {
            cache: SharingCache::new(),
            handlers: HandlerRegistry::new(),
            options,
            corruption_reports: AtomicU64::new(0),
        };
        ctx.handlers.register(Arc::new(UserHandler))?;
        ctx.handlers.register(Arc::new(TrustedHandler))?;
        ctx.handlers.register(Arc::new(SecurityHandler))?;
        info!("xattr context up, user_xattr {}", if options.user_xattr { "on" } else { "off" });
        Ok(Arc::new(ctx))
    }

    pub fn cache(&self) -> &SharingCache { &self.cache }

    pub fn handlers(&self) -> &HandlerRegistry { &self.handlers }

    pub fn options(&self) -> &MountOptions { &self.options }

    /// Log damage found on disk. Nothing is repaired.
    pub fn report_corruption(&self, e: &XattrError) {
        if e.is_corruption() {
            error!("{}", e);
            self.corruption_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn corruption_reports(&self) -> u64 {
        self.corruption_reports.load(Ordering::Relaxed)
    }

    /// A device goes away, forget its blocks
    pub fn put_device(&self, device: DeviceId) {
        let count = self.cache.flush_device(device);
        info!("device {} detached, {} cached blocks dropped", device, count);
    }

    pub fn shutdown(&self) {
        let count = self.cache.clear();
        self.handlers.clear();
        info!("xattr context down, {} cached blocks dropped", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn init_registers_namespaces() -> Result<()> {
        let ctx = XattrContext::init(MountOptions::default())?;
        assert_eq!(ctx.handlers().len(), 3);
        let (h, name) = ctx.handlers().resolve("security.selinux").ok_or_else(|| anyhow::anyhow!("unresolved"))?;
        assert_eq!((h.name_index(), name), (6, "selinux"));
        assert!(ctx.handlers().resolve("system.posix_acl_access").is_none());
        Ok(())
    }

    #[test]
    fn corruption_counter() -> Result<()> {
        let ctx = XattrContext::init(MountOptions::default())?;
        ctx.report_corruption(&XattrError::NoSpace);
        ctx.report_corruption(&XattrError::CorruptBlock { owner: 1, block: 2, reason: "bad magic or block count" });
        assert_eq!(ctx.corruption_reports(), 1);
        Ok(())
    }

    #[test]
    fn put_device_and_shutdown() -> Result<()> {
        let ctx = XattrContext::init(MountOptions::default())?;
        ctx.cache().insert(1, 10, 5);
        ctx.cache().insert(2, 10, 5);
        ctx.put_device(1);
        assert!(!ctx.cache().contains(1, 10));
        assert!(ctx.cache().contains(2, 10));
        ctx.shutdown();
        assert!(ctx.cache().is_empty());
        assert_eq!(ctx.handlers().len(), 0);
        Ok(())
    }
}
