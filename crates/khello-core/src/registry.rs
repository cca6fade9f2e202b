//! Device registration abstraction.
//!
//! The host side that gives the device a number, a class and a node name.
//! Registration is staged; each stage has an inverse, and a failed setup
//! must undo completed stages in reverse order:
//!
//! ```text
//! alloc_region -> add_cdev -> create_class -> create_device
//! unregister_region <- del_cdev <- destroy_class <- destroy_device
//! ```
//!
//! # Implementors
//!
//! - `LocalRegistry` (khello-module): in-process node table.

use std::fmt;

use crate::error::Result;

/// Major/minor device number pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// One step of device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStage {
    Region,
    Cdev,
    Class,
    Device,
}

impl fmt::Display for RegistrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStage::Region => write!(f, "device number region"),
            RegistrationStage::Cdev => write!(f, "character device"),
            RegistrationStage::Class => write!(f, "device class"),
            RegistrationStage::Device => write!(f, "device node"),
        }
    }
}

/// Registers the device with its host.
///
/// **Contract:**
/// - Every successful forward stage is undone by exactly one inverse call.
/// - Inverse calls never fail.
/// - Failures are `KhelloError::RegistrationFault` naming the stage.
pub trait DeviceRegistry: Send + Sync {
    /// Reserve a device number for `name`.
    fn alloc_region(&self, name: &str) -> Result<DevNum>;

    fn unregister_region(&self, dev: DevNum);

    /// Attach the character device to its number.
    fn add_cdev(&self, dev: DevNum) -> Result<()>;

    fn del_cdev(&self, dev: DevNum);

    fn create_class(&self, class_name: &str) -> Result<()>;

    fn destroy_class(&self, class_name: &str);

    /// Publish the node (`/dev/<name>`).
    fn create_device(&self, class_name: &str, dev: DevNum, name: &str) -> Result<()>;

    fn destroy_device(&self, class_name: &str, dev: DevNum);
}
