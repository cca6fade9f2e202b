//! Device configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use khello_module::config::DeviceConfig;
//!
//! let config = DeviceConfig::from_env()
//!     .device_name("khello0")
//!     .trace_vm(true);
//! ```

use khello_core::constants::{CLASS_NAME, DEVICE_NAME};
use khello_core::env::{env_get, env_get_bool, env_get_str};
use khello_core::system_page_size;

/// Device configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Node name under `/dev`, also the log prefix
    pub device_name: String,
    /// Device class name
    pub class_name: String,
    /// Size of the mappable page
    pub page_size: usize,
    /// Log every session open and close
    pub trace_vm: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DeviceConfig {
    /// Library defaults, ignoring the environment.
    pub fn defaults() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            class_name: CLASS_NAME.to_string(),
            page_size: system_page_size(),
            trace_vm: false,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `KHELLO_DEVICE_NAME` - Node name (default `khello`)
    /// - `KHELLO_CLASS_NAME` - Class name (default `khello_class`)
    /// - `KHELLO_PAGE_SIZE` - Mappable page size in bytes
    /// - `KHELLO_TRACE_VM` - Log session open/close (0/1)
    pub fn from_env() -> Self {
        let d = Self::defaults();
        Self {
            device_name: env_get_str("KHELLO_DEVICE_NAME", &d.device_name),
            class_name: env_get_str("KHELLO_CLASS_NAME", &d.class_name),
            page_size: env_get("KHELLO_PAGE_SIZE", d.page_size),
            trace_vm: env_get_bool("KHELLO_TRACE_VM", d.trace_vm),
        }
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = name.into();
        self
    }

    pub fn page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    pub fn trace_vm(mut self, enable: bool) -> Self {
        self.trace_vm = enable;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.device_name.is_empty() {
            return Err("device_name must not be empty");
        }
        if self.device_name.contains('/') || self.device_name.contains('\0') {
            return Err("device_name must not contain '/' or NUL");
        }
        if self.class_name.is_empty() {
            return Err("class_name must not be empty");
        }
        if !self.page_size.is_power_of_two() {
            return Err("page_size must be a power of two");
        }
        if self.page_size % system_page_size() != 0 {
            return Err("page_size must be a multiple of the system page size");
        }
        Ok(())
    }
}
