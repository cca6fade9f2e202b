//! Readiness bitmask returned by `poll`.
//!
//! Bits are the `poll(2)` ones so a dispatch layer can hand `bits()`
//! straight back to a caller's `pollfd.revents`.

bitflags::bitflags! {
    /// Conditions that held at the instant `poll` looked.
    ///
    /// A snapshot, not a promise: by the time the caller acts the device
    /// may have changed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollMask: u32 {
        /// Stored length is non-zero.
        const READABLE = libc::POLLIN as u32;
        /// Nobody holds the access lock.
        const WRITABLE = libc::POLLOUT as u32;
    }
}

impl PollMask {
    /// Build a mask from the two independent conditions.
    pub fn from_state(readable: bool, writable: bool) -> Self {
        let mut mask = PollMask::empty();
        mask.set(PollMask::READABLE, readable);
        mask.set(PollMask::WRITABLE, writable);
        mask
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(PollMask::READABLE)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(PollMask::WRITABLE)
    }
}
