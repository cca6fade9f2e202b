//! File operations abstraction.
//!
//! `FileOperations` is what the registration/dispatch layer calls into:
//! one method per external call, each with an open `Handle`.
//!
//! # Implementors
//!
//! - `DeviceFacade` (khello-module): the shared 32-byte buffer plus one
//!   mappable page.

use std::num::NonZeroUsize;

use crate::error::Result;
use crate::poll::PollMask;
use crate::user_copy::{UserDest, UserSource};

/// An open file on the device.
///
/// Not `Clone`: each `open()` yields exactly one handle and `release()`
/// consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    id: u64,
}

impl Handle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Device entry points.
///
/// **Contract:**
/// - `open()` and `release()` never fail.
/// - `read()` and `write()` may block on the device's access lock.
/// - `poll()` and `mmap()` never block on that lock.
/// - Errors are reported to the immediate caller and never retried.
pub trait FileOperations: Send + Sync {
    /// Live mapping returned by `mmap`.
    type Mapping;

    fn open(&self) -> Handle;

    fn release(&self, handle: Handle);

    /// Copy the stored bytes to `dst`. Returns the stored length.
    ///
    /// `requested_len` is informational; the device always transfers its
    /// own current length.
    fn read<D: UserDest + ?Sized>(&self, handle: &Handle, dst: &mut D, requested_len: usize) -> Result<usize>;

    /// Store up to `requested_len` bytes from `src`. Returns bytes stored.
    fn write<S: UserSource + ?Sized>(&self, handle: &Handle, src: &S, requested_len: usize) -> Result<usize>;

    fn poll(&self, handle: &Handle) -> PollMask;

    /// Map the device page into a fresh caller range.
    fn mmap(
        &self,
        handle: &Handle,
        requested_size: usize,
        hint: Option<NonZeroUsize>,
    ) -> Result<Self::Mapping>;
}
