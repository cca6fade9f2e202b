//! Mapping session lifecycle hooks.
//!
//! A `VmOperations` implementation is attached to every session the device
//! hands out. The hooks observe; they hold no state the session depends on.
//!
//! # Implementors
//!
//! - `NoopVmOps` (default): does nothing.
//! - `TracingVmOps` (khello-module): logs each open and close.

use std::fmt;

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Requested => write!(f, "requested"),
            SessionState::Open => write!(f, "open"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// What a hook gets to see about the caller range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmAreaInfo {
    pub session_id: u64,
    /// First address of the caller range.
    pub start: usize,
    /// Length of the caller range in bytes.
    pub len: usize,
    /// Physical-page stand-in: the device-side base address.
    pub backing: usize,
}

/// Callbacks invoked as a session opens and closes.
pub trait VmOperations: Send + Sync {
    fn on_open(&self, _area: &VmAreaInfo) {}

    fn on_close(&self, _area: &VmAreaInfo) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVmOps;

impl VmOperations for NoopVmOps {}
