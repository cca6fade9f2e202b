//! `LocalRegistry` — default `DeviceRegistry` implementation.
//!
//! An in-process table of device numbers, character devices, classes and
//! `/dev` nodes. Majors are handed out from a counter starting at
//! `FIRST_DYNAMIC_MAJOR`. A failure can be injected at any stage to
//! exercise the device's unwinding path.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use khello_core::error::{KhelloError, Result};
use khello_core::{kdebug, DevNum, DeviceRegistry, RegistrationStage};

/// First major number handed out, as the kernel's dynamic range does.
const FIRST_DYNAMIC_MAJOR: u32 = 234;

#[derive(Default)]
struct RegistryState {
    next_major: u32,
    regions: HashMap<u32, String>,
    cdevs: HashSet<DevNum>,
    classes: HashSet<String>,
    /// `/dev/<name>` -> (class, dev)
    nodes: HashMap<String, (String, DevNum)>,
}

pub struct LocalRegistry {
    state: Mutex<RegistryState>,
    fail_at: Option<(RegistrationStage, i32)>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_major: FIRST_DYNAMIC_MAJOR,
                ..Default::default()
            }),
            fail_at: None,
        }
    }

    /// A registry whose `stage` always fails with `errno`.
    pub fn failing_at(stage: RegistrationStage, errno: i32) -> Self {
        Self {
            fail_at: Some((stage, errno)),
            ..Self::new()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, stage: RegistrationStage) -> Result<()> {
        match self.fail_at {
            Some((s, errno)) if s == stage => Err(KhelloError::RegistrationFault { stage, errno }),
            _ => Ok(()),
        }
    }

    /// Device number published at `path` (e.g. `/dev/khello`).
    pub fn node(&self, path: &str) -> Option<DevNum> {
        self.state().nodes.get(path).map(|(_, dev)| *dev)
    }

    pub fn class_exists(&self, class_name: &str) -> bool {
        self.state().classes.contains(class_name)
    }

    pub fn region_count(&self) -> usize {
        self.state().regions.len()
    }

    /// True when nothing is registered at any stage.
    pub fn is_empty(&self) -> bool {
        let s = self.state();
        s.regions.is_empty() && s.cdevs.is_empty() && s.classes.is_empty() && s.nodes.is_empty()
    }
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry for LocalRegistry {
    fn alloc_region(&self, name: &str) -> Result<DevNum> {
        self.check(RegistrationStage::Region)?;
        let mut s = self.state();
        let major = s.next_major;
        s.next_major += 1;
        s.regions.insert(major, name.to_string());
        kdebug!("registry: region {} -> major {}", name, major);
        Ok(DevNum { major, minor: 0 })
    }

    fn unregister_region(&self, dev: DevNum) {
        self.state().regions.remove(&dev.major);
    }

    fn add_cdev(&self, dev: DevNum) -> Result<()> {
        self.check(RegistrationStage::Cdev)?;
        let mut s = self.state();
        if !s.regions.contains_key(&dev.major) {
            return Err(KhelloError::RegistrationFault {
                stage: RegistrationStage::Cdev,
                errno: libc::ENXIO,
            });
        }
        s.cdevs.insert(dev);
        Ok(())
    }

    fn del_cdev(&self, dev: DevNum) {
        self.state().cdevs.remove(&dev);
    }

    fn create_class(&self, class_name: &str) -> Result<()> {
        self.check(RegistrationStage::Class)?;
        if !self.state().classes.insert(class_name.to_string()) {
            return Err(KhelloError::RegistrationFault {
                stage: RegistrationStage::Class,
                errno: libc::EEXIST,
            });
        }
        Ok(())
    }

    fn destroy_class(&self, class_name: &str) {
        self.state().classes.remove(class_name);
    }

    fn create_device(&self, class_name: &str, dev: DevNum, name: &str) -> Result<()> {
        self.check(RegistrationStage::Device)?;
        let mut s = self.state();
        if !s.classes.contains(class_name) {
            return Err(KhelloError::RegistrationFault {
                stage: RegistrationStage::Device,
                errno: libc::ENOENT,
            });
        }
        let path = format!("/dev/{}", name);
        if s.nodes.contains_key(&path) {
            return Err(KhelloError::RegistrationFault {
                stage: RegistrationStage::Device,
                errno: libc::EEXIST,
            });
        }
        s.nodes.insert(path, (class_name.to_string(), dev));
        Ok(())
    }

    fn destroy_device(&self, class_name: &str, dev: DevNum) {
        self.state()
            .nodes
            .retain(|_, (class, d)| !(class.as_str() == class_name && *d == dev));
    }
}
