//! `MappingSession` — one caller mapping of the device page.
//!
//! ```text
//! Requested --establish--> Open --close/drop--> Closed
//!     |
//!     +-- rejected (SizeExceeded / InvalidArgument / AllocationFault):
//!         no session is returned
//! ```
//!
//! Establishing maps the page's shared memory object into a fresh range
//! of the caller's address space, so the range aliases the same physical
//! page as the device view and every other session. Closing unmaps that
//! range. Neither step frees the page: the session only holds an `Arc`
//! to it, and the device decides when the page goes away.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use khello_core::error::{KhelloError, Result};
use khello_core::{kdebug, kwarn, SessionState, VmAreaInfo, VmOperations};

use crate::mappable_page::{check_range, copy_in, copy_out, MappablePage};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct MappingSession {
    id: u64,
    page: Arc<MappablePage>,
    /// Caller range. `None` until established and after close.
    addr: Option<NonNull<c_void>>,
    len: usize,
    state: SessionState,
    vm_ops: Arc<dyn VmOperations>,
}

// Safety: the caller range is owned by the session and unmapped exactly
// once, and only through `&mut self`. Access through it is byte-wide atomic.
unsafe impl Send for MappingSession {}
unsafe impl Sync for MappingSession {}

impl MappingSession {
    /// Validate a map request and establish the mapping.
    ///
    /// `hint` is a preferred start address; the kernel may place the range
    /// elsewhere.
    pub fn request(
        page: &Arc<MappablePage>,
        requested_size: usize,
        hint: Option<NonZeroUsize>,
        vm_ops: Arc<dyn VmOperations>,
    ) -> Result<Self> {
        let limit = page.size();
        if requested_size > limit {
            kdebug!("{}: map of {} bytes rejected, page is {}", page.name(), requested_size, limit);
            return Err(KhelloError::SizeExceeded { requested: requested_size, limit });
        }
        let len = NonZeroUsize::new(requested_size)
            .ok_or(KhelloError::InvalidArgument("zero-length mapping"))?;

        let mut session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            page: Arc::clone(page),
            addr: None,
            len: len.get(),
            state: SessionState::Requested,
            vm_ops,
        };
        session.establish(hint, len)?;
        Ok(session)
    }

    fn establish(&mut self, hint: Option<NonZeroUsize>, len: NonZeroUsize) -> Result<()> {
        debug_assert_eq!(self.state, SessionState::Requested);

        let addr = unsafe {
            mmap(
                hint,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.page.as_ref(),
                0,
            )
        }
        .map_err(|e| KhelloError::AllocationFault(e as i32))?;

        self.addr = Some(addr);
        self.state = SessionState::Open;
        let open = self.page.session_opened();
        kdebug!(
            "{}: session {} open at {:#x}, {} open",
            self.page.name(),
            self.id,
            addr.as_ptr() as usize,
            open
        );
        self.vm_ops.on_open(&self.info());
        Ok(())
    }

    /// Tear down the caller range. A no-op unless `Open`.
    pub fn close(&mut self) -> Result<()> {
        if self.state != SessionState::Open {
            return Ok(());
        }
        let Some(addr) = self.addr else {
            return Ok(());
        };

        let info = self.info();
        unsafe { munmap(addr, self.len) }.map_err(|e| KhelloError::Os(e as i32))?;

        self.addr = None;
        self.state = SessionState::Closed;
        let open = self.page.session_closed();
        kdebug!("{}: session {} closed, {} open", self.page.name(), self.id, open);
        self.vm_ops.on_close(&info);
        Ok(())
    }

    /// Copy out of the caller range.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let base = self.open_addr()?;
        check_range(offset, dst.len(), self.len)?;
        unsafe { copy_out((base.as_ptr() as *const u8).add(offset), dst) };
        Ok(())
    }

    /// Store into the caller range. Visible through every view of the page.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let base = self.open_addr()?;
        check_range(offset, src.len(), self.len)?;
        unsafe { copy_in((base.as_ptr() as *mut u8).add(offset), src) };
        Ok(())
    }

    fn open_addr(&self) -> Result<NonNull<c_void>> {
        match (self.state, self.addr) {
            (SessionState::Open, Some(addr)) => Ok(addr),
            _ => Err(KhelloError::SessionClosed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start of the caller range, or `None` when not mapped.
    pub fn addr(&self) -> Option<usize> {
        self.addr.map(|a| a.as_ptr() as usize)
    }

    /// Requested length. The mapping itself covers the whole page.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn page(&self) -> &Arc<MappablePage> {
        &self.page
    }

    pub fn info(&self) -> VmAreaInfo {
        VmAreaInfo {
            session_id: self.id,
            start: self.addr().unwrap_or(0),
            len: self.len,
            backing: self.page.base(),
        }
    }
}

impl std::fmt::Debug for MappingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingSession")
            .field("id", &self.id)
            .field("addr", &self.addr().map(|a| format!("{:#x}", a)))
            .field("len", &self.len)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for MappingSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            kwarn!("{}: session {} close on drop failed: {}", self.page.name(), self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracing_vm_ops::TracingVmOps;
    use khello_core::kprint::{set_log_level, LogLevel};
    use khello_core::{system_page_size, NoopVmOps};

    fn page() -> Arc<MappablePage> {
        set_log_level(LogLevel::Off);
        MappablePage::allocate("khello-test", system_page_size()).unwrap()
    }

    fn noop() -> Arc<dyn VmOperations> {
        Arc::new(NoopVmOps)
    }

    #[test]
    fn test_exactly_one_page_is_accepted() {
        let p = page();
        let s = MappingSession::request(&p, p.size(), None, noop()).unwrap();
        assert_eq!(s.state(), SessionState::Open);
        assert_eq!(s.len(), p.size());
        assert_eq!(p.open_sessions(), 1);
    }

    #[test]
    fn test_one_byte_over_is_rejected() {
        let p = page();
        let err = MappingSession::request(&p, p.size() + 1, None, noop()).unwrap_err();
        assert_eq!(err, KhelloError::SizeExceeded { requested: p.size() + 1, limit: p.size() });
        assert_eq!(p.open_sessions(), 0);
    }

    #[test]
    fn test_zero_length_is_invalid() {
        let p = page();
        let err = MappingSession::request(&p, 0, None, noop()).unwrap_err();
        assert!(matches!(err, KhelloError::InvalidArgument(_)));
    }

    #[test]
    fn test_session_aliases_device_page() {
        let p = page();
        let s = MappingSession::request(&p, 32, None, noop()).unwrap();
        assert_ne!(s.addr(), Some(p.base()));

        s.write_at(0, b"haha\0").unwrap();
        let mut out = [0u8; 5];
        p.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"haha\0");

        p.write_at(8, b"kern").unwrap();
        let mut out = [0u8; 4];
        s.read_at(8, &mut out).unwrap();
        assert_eq!(&out, b"kern");
    }

    #[test]
    fn test_two_sessions_share_content() {
        let p = page();
        let a = MappingSession::request(&p, p.size(), None, noop()).unwrap();
        let b = MappingSession::request(&p, p.size(), None, noop()).unwrap();
        assert_eq!(p.open_sessions(), 2);

        a.write_at(100, b"shared").unwrap();
        let mut out = [0u8; 6];
        b.read_at(100, &mut out).unwrap();
        assert_eq!(&out, b"shared");
    }

    #[test]
    fn test_session_bounds_use_requested_len() {
        let p = page();
        let s = MappingSession::request(&p, 32, None, noop()).unwrap();
        assert!(s.write_at(31, b"x").is_ok());
        assert!(matches!(s.write_at(32, b"x"), Err(KhelloError::OutOfRange { .. })));
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let p = page();
        let mut s = MappingSession::request(&p, 64, None, noop()).unwrap();
        s.close().unwrap();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.addr(), None);
        assert_eq!(p.open_sessions(), 0);

        s.close().unwrap();
        assert_eq!(p.open_sessions(), 0);
        assert_eq!(s.write_at(0, b"x"), Err(KhelloError::SessionClosed));
    }

    #[test]
    fn test_drop_closes_and_keeps_page_alive() {
        let p = page();
        let s = MappingSession::request(&p, 64, None, noop()).unwrap();
        assert_eq!(Arc::strong_count(&p), 2);
        drop(s);
        assert_eq!(p.open_sessions(), 0);
        assert_eq!(Arc::strong_count(&p), 1);
    }

    #[test]
    fn test_session_outlives_device_reference() {
        let p = page();
        let s = MappingSession::request(&p, 16, None, noop()).unwrap();
        drop(p);
        s.write_at(0, b"still mapped").unwrap();
        let mut out = [0u8; 12];
        s.page().read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"still mapped");
    }

    #[test]
    fn test_one_session_written_from_two_threads() {
        let p = page();
        let s = Arc::new(MappingSession::request(&p, 256, None, noop()).unwrap());
        let mut workers = vec![];
        for byte in [b'a', b'b'] {
            let s = Arc::clone(&s);
            workers.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    s.write_at(0, &[byte; 256]).unwrap();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }

        let mut out = [0u8; 256];
        p.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == b'a' || b == b'b'));
    }

    #[test]
    fn test_callbacks_fire_once_each() {
        let p = page();
        let ops = Arc::new(TracingVmOps::new("khello-test"));
        let mut s = MappingSession::request(&p, 64, None, ops.clone()).unwrap();
        assert_eq!(ops.opened(), 1);
        assert_eq!(ops.closed(), 0);

        s.close().unwrap();
        drop(s);
        assert_eq!(ops.opened(), 1);
        assert_eq!(ops.closed(), 1);
    }
}
