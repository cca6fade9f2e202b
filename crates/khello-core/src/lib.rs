//! # khello-core — Trait definitions for khello
//!
//! This crate defines the seams of the khello shared-buffer device.
//! Each trait models one boundary between the device and the world
//! around it. Default implementations live in `khello-module`.
//!
//! ## Modules
//!
//! - `fops` - File operations dispatched per open handle
//! - `vm` - Mapping session lifecycle callbacks
//! - `registry` - Device number / class / node registration
//! - `user_copy` - Copies to and from caller memory
//! - `poll` - Readiness bitmask
//! - `access_lock` - Mutex with an observable busy flag
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod access_lock;
pub mod env;
pub mod error;
pub mod fops;
pub mod kprint;
pub mod poll;
pub mod registry;
pub mod user_copy;
pub mod vm;

// Re-exports for convenience
pub use access_lock::{AccessGuard, AccessLock};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
pub use error::{KhelloError, Result};
pub use fops::{FileOperations, Handle};
pub use poll::PollMask;
pub use registry::{DevNum, DeviceRegistry, RegistrationStage};
pub use user_copy::{UserDest, UserSource};
pub use vm::{NoopVmOps, SessionState, VmAreaInfo, VmOperations};

/// Constants for the device layout
pub mod constants {
    /// Capacity of the shared byte buffer, including the terminating null.
    pub const BUF_CAPACITY: usize = 32;

    /// Largest payload a single write can store.
    pub const MAX_PAYLOAD: usize = BUF_CAPACITY - 1;

    /// Page size assumed when the platform cannot be asked.
    pub const FALLBACK_PAGE_SIZE: usize = 4096;

    /// Default device node name (`/dev/khello`).
    pub const DEVICE_NAME: &str = "khello";

    /// Default device class name.
    pub const CLASS_NAME: &str = "khello_class";
}

/// System page size in bytes.
pub fn system_page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if ret > 0 {
                ret as usize
            } else {
                constants::FALLBACK_PAGE_SIZE
            }
        } else {
            constants::FALLBACK_PAGE_SIZE
        }
    }
}
