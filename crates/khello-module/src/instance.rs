//! `DeviceFacade` — the compositor that wires the device together.
//!
//! Owns the shared buffer, the mappable page and the registration, and
//! routes every `FileOperations` call to the right one. There are no
//! globals: build one facade at startup and share it (`Arc`) with every
//! caller.
//!
//! ```text
//! DeviceFacade<R: DeviceRegistry = LocalRegistry>
//!     read / write  -> SharedBuffer (AccessLock)
//!     poll          -> readiness (lock-free)
//!     mmap          -> MappingSession over Arc<MappablePage>
//! ```

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use khello_core::error::{KhelloError, Result};
use khello_core::{
    kdebug, kerror, kinfo, kwarn, DevNum, DeviceRegistry, FileOperations, Handle, NoopVmOps,
    PollMask, UserDest, UserSource, VmOperations,
};

use crate::config::DeviceConfig;
use crate::local_registry::LocalRegistry;
use crate::mappable_page::MappablePage;
use crate::mapping_session::MappingSession;
use crate::shared_buffer::SharedBuffer;
use crate::tracing_vm_ops::TracingVmOps;

/// The fully-wired device.
pub struct DeviceFacade<R: DeviceRegistry = LocalRegistry> {
    name: String,
    class_name: String,
    dev: DevNum,
    buffer: SharedBuffer,
    /// `None` once shut down.
    page: Option<Arc<MappablePage>>,
    vm_ops: Arc<dyn VmOperations>,
    registry: Arc<R>,
    registered: bool,
    next_handle: AtomicU64,
    open_handles: AtomicUsize,
}

/// Builder for constructing a device.
pub struct DeviceBuilder<R: DeviceRegistry = LocalRegistry> {
    config: DeviceConfig,
    vm_ops: Option<Arc<dyn VmOperations>>,
    registry: Arc<R>,
}

impl DeviceBuilder<LocalRegistry> {
    /// Environment-derived config and a private `LocalRegistry`.
    pub fn new() -> Self {
        Self::from_config(DeviceConfig::from_env())
    }

    pub fn from_config(config: DeviceConfig) -> Self {
        Self {
            config,
            vm_ops: None,
            registry: Arc::new(LocalRegistry::new()),
        }
    }
}

impl Default for DeviceBuilder<LocalRegistry> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeviceRegistry> DeviceBuilder<R> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.device_name = name.into();
        self
    }

    pub fn class_name(mut self, name: impl Into<String>) -> Self {
        self.config.class_name = name.into();
        self
    }

    pub fn page_size(mut self, n: usize) -> Self {
        self.config.page_size = n;
        self
    }

    /// Hooks for session open/close. Overrides `trace_vm`.
    pub fn vm_ops(mut self, ops: Arc<dyn VmOperations>) -> Self {
        self.vm_ops = Some(ops);
        self
    }

    /// Register with `registry` instead of a private `LocalRegistry`.
    pub fn registry<R2: DeviceRegistry>(self, registry: Arc<R2>) -> DeviceBuilder<R2> {
        DeviceBuilder {
            config: self.config,
            vm_ops: self.vm_ops,
            registry,
        }
    }

    /// Build the device.
    ///
    /// 1. Validates config
    /// 2. Creates the shared buffer and its lock
    /// 3. Allocates the mappable page
    /// 4. Registers region, cdev, class and node
    ///
    /// A failure at any step undoes the steps before it in reverse order.
    pub fn build(self) -> Result<DeviceFacade<R>> {
        self.config.validate().map_err(KhelloError::InvalidArgument)?;
        let name = self.config.device_name.clone();
        let class_name = self.config.class_name.clone();
        kinfo!("{}: Init", name);

        let buffer = SharedBuffer::new(name.clone());

        let page = MappablePage::allocate(&name, self.config.page_size).map_err(|e| {
            kerror!("{}: page allocation failed: {}", name, e);
            e
        })?;

        let dev = match register(self.registry.as_ref(), &name, &class_name) {
            Ok(dev) => dev,
            Err(e) => {
                // Nothing has mapped the page yet, so this cannot be refused.
                let _ = page.release();
                return Err(e);
            }
        };

        let vm_ops: Arc<dyn VmOperations> = match self.vm_ops {
            Some(ops) => ops,
            None if self.config.trace_vm => Arc::new(TracingVmOps::new(name.clone())),
            None => Arc::new(NoopVmOps),
        };

        kinfo!("{}: device created", name);
        Ok(DeviceFacade {
            name,
            class_name,
            dev,
            buffer,
            page: Some(page),
            vm_ops,
            registry: self.registry,
            registered: true,
            next_handle: AtomicU64::new(1),
            open_handles: AtomicUsize::new(0),
        })
    }
}

/// Staged registration. On failure, completed stages are undone newest
/// first before the error is returned.
fn register<R: DeviceRegistry + ?Sized>(registry: &R, name: &str, class_name: &str) -> Result<DevNum> {
    let dev = registry.alloc_region(name).map_err(|e| {
        kerror!("{}: request device number failed: {}", name, e);
        e
    })?;
    let mut progress = 0;

    let result = (|| -> Result<()> {
        registry.add_cdev(dev)?;
        progress = 1;
        kinfo!("{}: registered major num {}", name, dev.major);

        registry.create_class(class_name)?;
        progress = 2;
        kinfo!("{}: device class registered", name);

        registry.create_device(class_name, dev, name)?;
        Ok(())
    })();

    if let Err(e) = result {
        kerror!("{}: registration failed: {}", name, e);
        if progress >= 2 {
            registry.destroy_class(class_name);
        }
        if progress >= 1 {
            registry.del_cdev(dev);
        }
        registry.unregister_region(dev);
        return Err(e);
    }
    Ok(dev)
}

fn unregister<R: DeviceRegistry + ?Sized>(registry: &R, dev: DevNum, name: &str, class_name: &str) {
    registry.destroy_device(class_name, dev);
    registry.destroy_class(class_name);
    registry.del_cdev(dev);
    registry.unregister_region(dev);
    kdebug!("{}: unregistered {}", name, dev);
}

impl<R: DeviceRegistry> DeviceFacade<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev_num(&self) -> DevNum {
        self.dev
    }

    /// `/dev/<name>`
    pub fn node_path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// The mappable page, or `None` after shutdown.
    pub fn page(&self) -> Option<&Arc<MappablePage>> {
        self.page.as_ref()
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Relaxed)
    }

    /// Sessions currently mapping the page.
    pub fn open_sessions(&self) -> usize {
        self.page.as_ref().map_or(0, |p| p.open_sessions())
    }

    /// Ordered teardown: node, class, cdev and region, then the page.
    ///
    /// Refused with `PageInUse` while any session is open; the device is
    /// left fully intact in that case. Calling it again after success is
    /// a no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        let open = self.open_sessions();
        if open > 0 {
            kwarn!("{}: shutdown refused, {} mapping(s) still open", self.name, open);
            return Err(KhelloError::PageInUse(open));
        }

        if self.registered {
            unregister(self.registry.as_ref(), self.dev, &self.name, &self.class_name);
            self.registered = false;
        }
        if let Some(page) = self.page.take() {
            if let Err((page, e)) = page.release() {
                self.page = Some(page);
                return Err(e);
            }
        }
        kinfo!("{}: Cleanup and exit", self.name);
        Ok(())
    }
}

impl<R: DeviceRegistry> FileOperations for DeviceFacade<R> {
    type Mapping = MappingSession;

    fn open(&self) -> Handle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.open_handles.fetch_add(1, Ordering::Relaxed);
        kdebug!("{}: open, handle {}", self.name, id);
        Handle::new(id)
    }

    fn release(&self, handle: Handle) {
        let counted = self
            .open_handles
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if !counted {
            kwarn!("{}: release of handle {} with no open handles", self.name, handle.id());
            return;
        }
        kdebug!("{}: release, handle {}", self.name, handle.id());
    }

    fn read<D: UserDest + ?Sized>(&self, _handle: &Handle, dst: &mut D, requested_len: usize) -> Result<usize> {
        self.buffer.read(dst, requested_len)
    }

    fn write<S: UserSource + ?Sized>(&self, _handle: &Handle, src: &S, requested_len: usize) -> Result<usize> {
        self.buffer.write(src, requested_len)
    }

    fn poll(&self, _handle: &Handle) -> PollMask {
        self.buffer.poll()
    }

    fn mmap(
        &self,
        _handle: &Handle,
        requested_size: usize,
        hint: Option<NonZeroUsize>,
    ) -> Result<MappingSession> {
        let page = self.page.as_ref().ok_or(KhelloError::Os(libc::ENODEV))?;
        MappingSession::request(page, requested_size, hint, Arc::clone(&self.vm_ops))
    }
}

/// Best-effort teardown. Open sessions keep the page memory alive through
/// their own references, so dropping the device never frees memory a
/// session can still reach.
impl<R: DeviceRegistry> Drop for DeviceFacade<R> {
    fn drop(&mut self) {
        if self.registered {
            unregister(self.registry.as_ref(), self.dev, &self.name, &self.class_name);
            self.registered = false;
        }
        if let Some(page) = self.page.take() {
            let open = page.open_sessions();
            if open > 0 {
                kwarn!("{}: dropped with {} mapping(s) open, page outlives device", self.name, open);
            }
            drop(page);
            kinfo!("{}: Cleanup and exit", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khello_core::kprint::{set_log_level, LogLevel};
    use crate::mappable_page::live_pages;
    use khello_core::{system_page_size, RegistrationStage, SessionState};
    use std::thread;

    fn builder(name: &str) -> DeviceBuilder<LocalRegistry> {
        set_log_level(LogLevel::Off);
        DeviceBuilder::from_config(DeviceConfig::defaults().device_name(name))
    }

    #[test]
    fn test_build_registers_node() {
        let dev = builder("khello").build().unwrap();
        assert_eq!(dev.node_path(), "/dev/khello");
        assert_eq!(dev.registry().node("/dev/khello"), Some(dev.dev_num()));
        assert!(dev.registry().class_exists("khello_class"));
    }

    #[test]
    fn test_hello_scenario() {
        let dev = builder("khello").build().unwrap();
        let h = dev.open();

        assert_eq!(dev.write(&h, &b"hello"[..], 5).unwrap(), 5);
        let mut out = [0u8; 32];
        assert_eq!(dev.read(&h, &mut out[..], 32).unwrap(), 5);
        assert_eq!(&out[..5], b"hello");

        let long = b"0123456789012345678901234567890123456789";
        assert_eq!(dev.write(&h, &long[..], long.len()).unwrap(), 31);
        let snap = dev.buffer().snapshot();
        assert_eq!(snap.as_bytes(), &long[..31]);
        assert_eq!(snap.raw()[31], 0);

        dev.release(h);
        assert_eq!(dev.open_handles(), 0);
    }

    #[test]
    fn test_poll_through_facade() {
        let dev = builder("khello").build().unwrap();
        let h = dev.open();
        assert_eq!(dev.poll(&h), PollMask::WRITABLE);
        dev.write(&h, &b"x"[..], 1).unwrap();
        assert_eq!(dev.poll(&h), PollMask::READABLE | PollMask::WRITABLE);
    }

    #[test]
    fn test_mmap_size_limits() {
        let dev = builder("khello").build().unwrap();
        let h = dev.open();
        let ps = system_page_size();

        let s = dev.mmap(&h, ps, None).unwrap();
        assert_eq!(s.state(), SessionState::Open);

        let err = dev.mmap(&h, ps * 2, None).unwrap_err();
        assert_eq!(err, KhelloError::SizeExceeded { requested: ps * 2, limit: ps });
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn test_mmap_is_independent_of_buffer() {
        let dev = builder("khello").build().unwrap();
        let h = dev.open();
        dev.write(&h, &b"buffer"[..], 6).unwrap();

        let s = dev.mmap(&h, 32, None).unwrap();
        let mut raw = [0xffu8; 6];
        s.read_at(0, &mut raw).unwrap();
        assert_eq!(raw, [0u8; 6]);

        s.write_at(0, b"haha\0").unwrap();
        assert_eq!(dev.buffer().snapshot().as_bytes(), b"buffer");

        let mut view = [0u8; 4];
        dev.page().unwrap().read_at(0, &mut view).unwrap();
        assert_eq!(&view, b"haha");
    }

    #[test]
    fn test_shutdown_refused_while_mapped() {
        let mut dev = builder("khello").build().unwrap();
        let h = dev.open();
        let mut s = dev.mmap(&h, 64, None).unwrap();

        assert_eq!(dev.shutdown(), Err(KhelloError::PageInUse(1)));
        assert!(dev.page().is_some());
        assert!(!dev.registry().is_empty());

        s.close().unwrap();
        dev.shutdown().unwrap();
        assert!(dev.page().is_none());
        assert!(dev.registry().is_empty());
        assert_eq!(dev.mmap(&h, 64, None).unwrap_err(), KhelloError::Os(libc::ENODEV));

        dev.shutdown().unwrap();
    }

    #[test]
    fn test_drop_with_open_session_keeps_memory() {
        let dev = builder("khello").build().unwrap();
        let h = dev.open();
        let s = dev.mmap(&h, 64, None).unwrap();
        drop(dev);

        s.write_at(0, b"alive").unwrap();
        let mut out = [0u8; 5];
        s.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"alive");
    }

    #[test]
    fn test_registration_failure_unwinds_every_stage() {
        set_log_level(LogLevel::Off);
        let live = live_pages();
        for stage in [
            RegistrationStage::Region,
            RegistrationStage::Cdev,
            RegistrationStage::Class,
            RegistrationStage::Device,
        ] {
            let registry = Arc::new(LocalRegistry::failing_at(stage, libc::EBUSY));
            let result = builder("khello").registry(Arc::clone(&registry)).build();

            match result {
                Err(KhelloError::RegistrationFault { stage: s, errno }) => {
                    assert_eq!(s, stage);
                    assert_eq!(errno, libc::EBUSY);
                }
                Err(e) => panic!("unexpected error: {}", e),
                Ok(_) => panic!("build succeeded with failing {}", stage),
            }
            assert!(registry.is_empty(), "leaked registration after {} failure", stage);
            assert_eq!(live_pages(), live, "page leaked after {} failure", stage);
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_allocation_failure_registers_nothing() {
        set_log_level(LogLevel::Off);
        let live = live_pages();
        let registry = Arc::new(LocalRegistry::new());
        // Passes validation but cannot fit in any address space.
        let result = builder("khello")
            .page_size(1 << 62)
            .registry(Arc::clone(&registry))
            .build();

        assert!(matches!(result, Err(KhelloError::AllocationFault(_))));
        assert!(registry.is_empty());
        assert_eq!(live_pages(), live);
    }

    #[test]
    fn test_shutdown_frees_page() {
        let live = live_pages();
        let mut dev = builder("khello").build().unwrap();
        assert_eq!(live_pages(), live + 1);
        dev.shutdown().unwrap();
        assert_eq!(live_pages(), live);
    }

    #[test]
    fn test_release_of_unknown_handle_does_not_wrap() {
        let dev = builder("khello").build().unwrap();
        dev.release(Handle::new(999));
        assert_eq!(dev.open_handles(), 0);

        let h = dev.open();
        assert_eq!(dev.open_handles(), 1);
        dev.release(h);
        assert_eq!(dev.open_handles(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = builder("khello").page_size(1000).build().err();
        assert!(matches!(err, Some(KhelloError::InvalidArgument(_))));
    }

    #[test]
    fn test_shared_registry_rejects_duplicate_class() {
        set_log_level(LogLevel::Off);
        let registry = Arc::new(LocalRegistry::new());
        let first = builder("khello").registry(Arc::clone(&registry)).build().unwrap();
        let second = builder("khello2").registry(Arc::clone(&registry)).build();
        assert!(matches!(
            second,
            Err(KhelloError::RegistrationFault { stage: RegistrationStage::Class, .. })
        ));
        assert_eq!(registry.region_count(), 1);
        drop(first);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_trace_vm_counts_sessions() {
        let ops = Arc::new(TracingVmOps::new("khello"));
        let dev = builder("khello").vm_ops(ops.clone()).build().unwrap();
        let h = dev.open();
        {
            let _a = dev.mmap(&h, 16, None).unwrap();
            let _b = dev.mmap(&h, 16, None).unwrap();
            assert_eq!(dev.open_sessions(), 2);
        }
        assert_eq!(ops.opened(), 2);
        assert_eq!(ops.closed(), 2);
        assert_eq!(dev.open_sessions(), 0);
    }

    #[test]
    fn test_concurrent_writers_from_many_handles() {
        let dev = Arc::new(builder("khello").build().unwrap());
        let mut handles = vec![];
        for byte in [b'a', b'b'] {
            let dev = Arc::clone(&dev);
            handles.push(thread::spawn(move || {
                let h = dev.open();
                let payload = [byte; 4];
                for _ in 0..1000 {
                    dev.write(&h, &payload[..], 4).unwrap();
                    let _ = dev.poll(&h);
                }
                dev.release(h);
            }));
        }
        for t in handles {
            t.join().unwrap();
        }

        let h = dev.open();
        let mut out = [0u8; 32];
        assert_eq!(dev.read(&h, &mut out[..], 32).unwrap(), 4);
        assert!(&out[..4] == b"aaaa" || &out[..4] == b"bbbb");
    }
}
