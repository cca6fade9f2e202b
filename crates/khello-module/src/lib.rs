//! # khello-module — Default implementations
//!
//! This crate provides the default implementation for every khello trait
//! and the `DeviceFacade` that wires them into one device.
//!
//! ## Default stack
//!
//! | Seam             | Default Impl     | Notes                              |
//! |------------------|------------------|------------------------------------|
//! | FileOperations   | DeviceFacade     | composition root                   |
//! | (buffer)         | SharedBuffer     | 32 bytes behind an `AccessLock`    |
//! | (readiness)      | readiness        | lock-free snapshot                 |
//! | (page)           | MappablePage     | memfd-backed, refcounted           |
//! | (mapping)        | MappingSession   | MAP_SHARED alias of the page       |
//! | VmOperations     | NoopVmOps        | TracingVmOps logs open/close       |
//! | DeviceRegistry   | LocalRegistry    | in-process node table              |
//!
//! `DemandFaulter` resolves page faults on demand. It is not wired into
//! `mmap`; sessions are populated eagerly.

pub mod config;
pub mod demand_fault;
pub mod instance;
pub mod local_registry;
pub mod mappable_page;
pub mod mapping_session;
pub mod readiness;
pub mod shared_buffer;
pub mod tracing_vm_ops;

pub use config::DeviceConfig;
pub use demand_fault::{DemandFaulter, FaultedPage};
pub use instance::{DeviceBuilder, DeviceFacade};
pub use local_registry::LocalRegistry;
pub use mappable_page::MappablePage;
pub use mapping_session::MappingSession;
pub use shared_buffer::{ByteBuffer, SharedBuffer};
pub use tracing_vm_ops::TracingVmOps;
