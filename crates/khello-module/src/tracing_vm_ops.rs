//! `TracingVmOps` — `VmOperations` that logs each session open and close.
//!
//! Diagnostics only. The counters let a caller check that every open was
//! matched by a close.

use std::sync::atomic::{AtomicUsize, Ordering};

use khello_core::{kinfo, VmAreaInfo, VmOperations};

pub struct TracingVmOps {
    name: String,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl TracingVmOps {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }
}

impl VmOperations for TracingVmOps {
    fn on_open(&self, area: &VmAreaInfo) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        kinfo!(
            "{}: VMA open, virt {:#x}, phys {:#x}, len {}",
            self.name,
            area.start,
            area.backing,
            area.len
        );
    }

    fn on_close(&self, area: &VmAreaInfo) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        kinfo!("{}: VMA close, virt {:#x}", self.name, area.start);
    }
}
