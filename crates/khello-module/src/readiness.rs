//! Readiness evaluation for `poll`.
//!
//! A pure function of the stored length and the lock's busy flag. Callers
//! read both from atomics without taking the access lock, so the result
//! is advisory only: it is not a synchronization primitive and may be
//! stale the moment it is returned.

use khello_core::PollMask;

/// `readable = length > 0`, `writable = !busy`, reported together.
#[inline]
pub fn evaluate(length: usize, busy: bool) -> PollMask {
    PollMask::from_state(length > 0, !busy)
}
