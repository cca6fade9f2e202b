//! `MappablePage` — the one page the device lets callers map.
//!
//! Backed by an anonymous shared memory object (`memfd`) sized to one page.
//! The device keeps its own `MAP_SHARED` view at `base()`; every session
//! maps the same object again, so all views alias one physical page and a
//! store through any of them is visible through the rest without a copy.
//!
//! The page is independent of the 32-byte buffer and is not guarded by the
//! access lock. `read_at`/`write_at` move bytes through `AtomicU8` with
//! relaxed ordering: concurrent stores to the same range may interleave
//! byte by byte, but never race. Ordering between callers is theirs to
//! arrange.
//!
//! Lifetime: sessions hold an `Arc` to the page, and the backing memory is
//! unmapped only when the last `Arc` drops. `release()` additionally
//! refuses while any session is open and hands the reference back.

use std::ffi::{c_void, CString};
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use khello_core::error::{KhelloError, Result};
use khello_core::{kdebug, kinfo, kwarn, system_page_size};

pub struct MappablePage {
    /// Log prefix (device name).
    name: String,
    /// The shared memory object every view maps.
    file: File,
    /// Device-side view.
    base: NonNull<c_void>,
    size: NonZeroUsize,
    /// Sessions currently in `Open`.
    open_sessions: AtomicUsize,
}

// Safety: `base` points at a MAP_SHARED mapping owned by this struct and
// valid until Drop. Every access through it is a byte-wide atomic.
unsafe impl Send for MappablePage {}
unsafe impl Sync for MappablePage {}

/// Outcome of `MappablePage::release`. A refused release returns the
/// caller's reference alongside the error.
pub type ReleaseResult = std::result::Result<(), (Arc<MappablePage>, KhelloError)>;

#[cfg(test)]
thread_local! {
    static LIVE_PAGES: std::cell::Cell<isize> = const { std::cell::Cell::new(0) };
}

/// Pages allocated minus pages freed on the calling thread.
#[cfg(test)]
pub(crate) fn live_pages() -> isize {
    LIVE_PAGES.with(|n| n.get())
}

/// Copy `dst.len()` bytes starting at `src`.
///
/// # Safety
///
/// `src..src + dst.len()` must lie inside a live mapping.
pub(crate) unsafe fn copy_out(src: *const u8, dst: &mut [u8]) {
    for (i, b) in dst.iter_mut().enumerate() {
        *b = (*(src.add(i) as *const AtomicU8)).load(Ordering::Relaxed);
    }
}

/// Copy `src` to memory starting at `dst`.
///
/// # Safety
///
/// `dst..dst + src.len()` must lie inside a live writable mapping.
pub(crate) unsafe fn copy_in(dst: *mut u8, src: &[u8]) {
    for (i, &b) in src.iter().enumerate() {
        (*(dst.add(i) as *const AtomicU8)).store(b, Ordering::Relaxed);
    }
}

/// Bounds check shared by the page and its sessions.
pub(crate) fn check_range(offset: usize, len: usize, limit: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(KhelloError::OutOfRange { offset, len, limit }),
    }
}

impl MappablePage {
    /// Allocate one page of `page_size` bytes, zero-filled.
    ///
    /// `page_size` must be a power of two and a multiple of the system
    /// page size. Anything acquired before a failure is released before
    /// the `AllocationFault` is returned.
    pub fn allocate(name: &str, page_size: usize) -> Result<Arc<Self>> {
        let sys = system_page_size();
        if !page_size.is_power_of_two() || page_size % sys != 0 {
            return Err(KhelloError::InvalidArgument(
                "page size must be a power-of-two multiple of the system page size",
            ));
        }
        let size = NonZeroUsize::new(page_size)
            .ok_or(KhelloError::InvalidArgument("page size must be non-zero"))?;

        let cname = CString::new(format!("{}-page", name))
            .map_err(|_| KhelloError::InvalidArgument("device name contains NUL"))?;

        let fd = memfd_create(cname.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| KhelloError::AllocationFault(e as i32))?;
        let file = File::from(fd);

        // On error `file` drops here and closes the fd.
        file.set_len(page_size as u64)
            .map_err(|e| KhelloError::AllocationFault(e.raw_os_error().unwrap_or(libc::ENOMEM)))?;

        let base = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| KhelloError::AllocationFault(e as i32))?;

        kinfo!("{}: page allocated, {} bytes at {:#x}", name, page_size, base.as_ptr() as usize);
        #[cfg(test)]
        LIVE_PAGES.with(|n| n.set(n.get() + 1));

        Ok(Arc::new(Self {
            name: name.to_string(),
            file,
            base,
            size,
            open_sessions: AtomicUsize::new(0),
        }))
    }

    /// Give up the caller's reference.
    ///
    /// Refused with `PageInUse(n)` while `n` sessions are open; the
    /// reference comes back with the error so the caller can retry.
    pub fn release(self: Arc<Self>) -> ReleaseResult {
        let open = self.open_sessions();
        if open > 0 {
            kwarn!("{}: page release refused, {} session(s) open", self.name, open);
            return Err((self, KhelloError::PageInUse(open)));
        }
        kdebug!("{}: page released ({} other reference(s))", self.name, Arc::strong_count(&self) - 1);
        Ok(())
    }

    /// Device-side base address.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.get()
    }

    #[inline]
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Copy out of the device-side view.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(offset, dst.len(), self.size())?;
        unsafe { copy_out((self.base.as_ptr() as *const u8).add(offset), dst) };
        Ok(())
    }

    /// Copy into the device-side view.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        check_range(offset, src.len(), self.size())?;
        unsafe { copy_in((self.base.as_ptr() as *mut u8).add(offset), src) };
        Ok(())
    }

    pub(crate) fn session_opened(&self) -> usize {
        self.open_sessions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn session_closed(&self) -> usize {
        let prev = self.open_sessions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl AsFd for MappablePage {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for MappablePage {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl std::fmt::Debug for MappablePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappablePage")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}

impl Drop for MappablePage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.size.get()) } {
            kwarn!("{}: munmap of device view failed: {}", self.name, e);
        }
        kdebug!("{}: page freed", self.name);
        #[cfg(test)]
        LIVE_PAGES.with(|n| n.set(n.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khello_core::kprint::{set_log_level, LogLevel};

    fn page() -> Arc<MappablePage> {
        set_log_level(LogLevel::Off);
        MappablePage::allocate("khello-test", system_page_size()).unwrap()
    }

    #[test]
    fn test_allocate_is_page_aligned_and_zeroed() {
        let p = page();
        assert_eq!(p.base() % system_page_size(), 0);
        assert_eq!(p.size(), system_page_size());

        let mut out = vec![0xffu8; p.size()];
        p.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejects_odd_page_size() {
        set_log_level(LogLevel::Off);
        let err = MappablePage::allocate("khello-test", 1000).unwrap_err();
        assert!(matches!(err, KhelloError::InvalidArgument(_)));
        assert!(MappablePage::allocate("khello-test", 0).is_err());
    }

    #[test]
    fn test_read_write_at() {
        let p = page();
        p.write_at(5, b"mama").unwrap();
        let mut out = [0u8; 4];
        p.read_at(5, &mut out).unwrap();
        assert_eq!(&out, b"mama");
    }

    #[test]
    fn test_out_of_range() {
        let p = page();
        let size = p.size();
        let err = p.write_at(size - 1, b"ab").unwrap_err();
        assert_eq!(err, KhelloError::OutOfRange { offset: size - 1, len: 2, limit: size });
        assert!(p.read_at(usize::MAX, &mut [0u8; 1]).is_err());
    }

    #[test]
    fn test_release_refused_while_open() {
        let p = page();
        p.session_opened();
        let (back, err) = Arc::clone(&p).release().unwrap_err();
        assert_eq!(err, KhelloError::PageInUse(1));
        assert!(Arc::ptr_eq(&back, &p));
        drop(back);
        p.session_closed();
        assert!(p.release().is_ok());
    }

    #[test]
    fn test_refused_release_keeps_reference() {
        let p = page();
        p.session_opened();
        let held = Arc::clone(&p);
        let before = Arc::strong_count(&p);

        let held = match held.release() {
            Err((page, KhelloError::PageInUse(1))) => page,
            other => panic!("unexpected: {:?}", other.map_err(|(_, e)| e)),
        };
        assert_eq!(Arc::strong_count(&p), before);
        held.write_at(0, b"still here").unwrap();

        p.session_closed();
        assert!(held.release().is_ok());
        assert_eq!(Arc::strong_count(&p), 1);
    }

    #[test]
    fn test_drop_frees_page() {
        set_log_level(LogLevel::Off);
        let before = live_pages();
        let p = MappablePage::allocate("khello-test", system_page_size()).unwrap();
        assert_eq!(live_pages(), before + 1);
        assert!(p.release().is_ok());
        assert_eq!(live_pages(), before);
    }

    #[test]
    fn test_concurrent_writers_share_page() {
        let p = page();
        let size = p.size();
        let mut workers = vec![];
        for byte in [b'x', b'y'] {
            let p = Arc::clone(&p);
            workers.push(std::thread::spawn(move || {
                let fill = vec![byte; size];
                for _ in 0..50 {
                    p.write_at(0, &fill).unwrap();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }

        let mut out = vec![0u8; size];
        p.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == b'x' || b == b'y'));
    }
}
