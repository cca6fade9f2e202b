//! `SharedBuffer` — the device's 32-byte exchange buffer.
//!
//! One `ByteBuffer` behind an `AccessLock`. Every read and write holds the
//! lock for the whole copy, so a reader sees either all of a write or none
//! of it. The stored length is mirrored into an atomic that `poll` reads
//! without the lock.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use khello_core::constants::{BUF_CAPACITY, MAX_PAYLOAD};
use khello_core::error::{KhelloError, Result};
use khello_core::{kerror, kinfo, AccessLock, PollMask, UserDest, UserSource};

use crate::readiness;

/// Fixed-capacity byte store.
///
/// Invariant: `length < BUF_CAPACITY` and `data[length] == 0`.
#[derive(Clone, PartialEq, Eq)]
pub struct ByteBuffer {
    data: [u8; BUF_CAPACITY],
    length: usize,
}

impl ByteBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; BUF_CAPACITY],
            length: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Stored payload, without the terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Payload plus terminator, as a C reader would see it.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data[..=self.length]
    }

    /// Raw capacity-sized view, including bytes past the terminator.
    pub fn raw(&self) -> &[u8; BUF_CAPACITY] {
        &self.data
    }

    fn store(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let n = payload.len();
        self.data[..n].copy_from_slice(payload);
        self.data[n] = 0;
        self.length = n;
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("length", &self.length)
            .field("data", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

/// The guarded buffer shared by every open handle.
pub struct SharedBuffer {
    /// Log prefix (device name).
    name: String,
    inner: AccessLock<ByteBuffer>,
    /// Lock-free copy of `inner.length` for `poll`.
    length: AtomicUsize,
}

impl SharedBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: AccessLock::new(ByteBuffer::new()),
            length: AtomicUsize::new(0),
        }
    }

    /// Store `min(requested_len, 31)` bytes from `src`, null-terminated.
    ///
    /// If the caller source cannot supply that many bytes the write is
    /// aborted, the buffer keeps its previous content and a
    /// `TransferFault` is returned.
    pub fn write<S: UserSource + ?Sized>(&self, src: &S, requested_len: usize) -> Result<usize> {
        let actual = requested_len.min(MAX_PAYLOAD);
        let available = src.user_len();
        if available < actual {
            kerror!("{}: failed to receive {} bytes", self.name, actual - available);
            return Err(KhelloError::TransferFault {
                copied: available,
                missing: actual - available,
            });
        }
        let mut scratch = [0u8; MAX_PAYLOAD];

        let mut buf = self.inner.lock();
        let residual = src.copy_from_user(&mut scratch[..actual]);
        if residual != 0 {
            kerror!("{}: failed to receive {} bytes", self.name, residual);
            return Err(KhelloError::TransferFault {
                copied: actual - residual,
                missing: residual,
            });
        }
        buf.store(&scratch[..actual]);
        self.length.store(actual, Ordering::Release);
        kinfo!(
            "{}: Received from user:{}",
            self.name,
            String::from_utf8_lossy(buf.as_bytes())
        );
        Ok(actual)
    }

    /// Transfer the stored bytes to `dst` and return the stored length.
    ///
    /// `requested_len` does not limit the transfer: the device always
    /// sends its own current length. A destination too small for that is
    /// a `TransferFault`.
    pub fn read<D: UserDest + ?Sized>(&self, dst: &mut D, requested_len: usize) -> Result<usize> {
        let buf = self.inner.lock();
        let length = buf.len();
        let residual = dst.copy_to_user(buf.as_bytes());
        if residual != 0 {
            kerror!("{}: failed to send {} bytes", self.name, residual);
            return Err(KhelloError::TransferFault {
                copied: length - residual,
                missing: residual,
            });
        }
        if requested_len < length {
            kinfo!("{}: sent {} bytes (caller asked for {})", self.name, length, requested_len);
        } else {
            kinfo!("{}: sent {} bytes", self.name, length);
        }
        Ok(length)
    }

    /// Advisory readiness. Never takes the access lock.
    pub fn poll(&self) -> PollMask {
        readiness::evaluate(self.length.load(Ordering::Acquire), self.inner.is_busy())
    }

    /// Copy of the current content, taken under the lock.
    pub fn snapshot(&self) -> ByteBuffer {
        self.inner.lock().clone()
    }

    /// Stored length, read lock-free.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .finish()
    }
}
