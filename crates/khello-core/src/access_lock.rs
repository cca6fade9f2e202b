//! Mutex with an observable busy flag
//!
//! `AccessLock` guards the device buffer. Its lock word doubles as the
//! `busy` flag that `poll` reads without acquiring anything: while any
//! guard is alive, `is_busy()` reports true.
//!
//! Contended callers spin briefly, then yield their OS thread until the
//! holder releases. There is no timeout and no ordering among waiters.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spins before a contended `lock()` starts yielding the thread.
const SPIN_LIMIT: u32 = 64;

/// Exclusive lock whose held state is readable lock-free
///
/// # Example
///
/// ```ignore
/// let lock = AccessLock::new([0u8; 32]);
/// {
///     let mut data = lock.lock();
///     data[0] = b'h';
///     assert!(lock.is_busy());
/// }
/// assert!(!lock.is_busy());
/// ```
pub struct AccessLock<T> {
    /// Lock state, also the busy flag
    busy: AtomicBool,

    /// Protected data
    data: UnsafeCell<T>,
}

// Safety: AccessLock provides exclusive access to T
unsafe impl<T: Send> Send for AccessLock<T> {}
unsafe impl<T: Send> Sync for AccessLock<T> {}

impl<T> AccessLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, blocking the calling thread while contended
    pub fn lock(&self) -> AccessGuard<'_, T> {
        if self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return AccessGuard { lock: self };
        }

        self.lock_slow()
    }

    fn lock_slow(&self) -> AccessGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if self.busy
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return AccessGuard { lock: self };
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> Option<AccessGuard<'_, T>> {
        if self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(AccessGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether some holder is inside the guarded region.
    ///
    /// Advisory: the answer may be stale by the time the caller acts on it.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for AccessLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for AccessLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("AccessLock")
                .field("data", &*guard)
                .finish(),
            None => f.debug_struct("AccessLock")
                .field("data", &"<busy>")
                .finish(),
        }
    }
}

/// Guard that releases the lock when dropped
pub struct AccessGuard<'a, T> {
    lock: &'a AccessLock<T>,
}

impl<'a, T> Deref for AccessGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for AccessGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for AccessGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_lock() {
        let lock = AccessLock::new(0);

        {
            let mut guard = lock.lock();
            *guard = 42;
        }

        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_busy_tracks_guard() {
        let lock = AccessLock::new(());
        assert!(!lock.is_busy());

        let guard = lock.lock();
        assert!(lock.is_busy());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(!lock.is_busy());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_concurrent() {
        let lock = Arc::new(AccessLock::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = lock.lock();
                    *guard += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_into_inner() {
        let lock = AccessLock::new(42);
        assert_eq!(lock.into_inner(), 42);
    }
}
