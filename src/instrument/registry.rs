//! Named device registry.
//!
//! Devices are registered once at startup under a unique name and any number
//! of labels ("flyers", "motors", "baseline"). Plans look them up by name or
//! collect every device carrying a label. Registration order is preserved so
//! `findall` results are deterministic.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{FlyingDevice, Motor, Readable};

/// Type-erased handle to a registered device.
#[derive(Clone)]
pub enum DeviceHandle {
    Flyer(Arc<dyn FlyingDevice>),
    Motor(Arc<dyn Motor>),
    Signal(Arc<dyn Readable>),
}

impl DeviceHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceHandle::Flyer(_) => "flyer",
            DeviceHandle::Motor(_) => "motor",
            DeviceHandle::Signal(_) => "signal",
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle::{}", self.kind())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    labels: Vec<String>,
    device: DeviceHandle,
}

#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Names must be unique.
    pub fn register(&self, name: &str, labels: &[&str], device: DeviceHandle) -> AppResult<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|entry| entry.name == name) {
            return Err(DaqError::Configuration(format!(
                "device '{name}' is already registered"
            )));
        }
        debug!(device = name, kind = device.kind(), ?labels, "Registered device");
        entries.push(Entry {
            name: name.to_string(),
            labels: labels.iter().map(|label| label.to_string()).collect(),
            device,
        });
        Ok(())
    }

    pub fn find(&self, name: &str) -> AppResult<DeviceHandle> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.device.clone())
            .ok_or_else(|| DaqError::ComponentNotFound(format!("no device named '{name}'")))
    }

    /// Every device carrying `label`, in registration order.
    pub fn findall(&self, label: &str) -> AppResult<Vec<DeviceHandle>> {
        let found: Vec<DeviceHandle> = self
            .entries
            .read()
            .iter()
            .filter(|entry| entry.labels.iter().any(|l| l == label))
            .map(|entry| entry.device.clone())
            .collect();
        if found.is_empty() {
            return Err(DaqError::ComponentNotFound(format!(
                "Could not find components matching label: {label}"
            )));
        }
        Ok(found)
    }

    /// Signals carrying `label`; devices of other kinds are skipped.
    pub fn findall_signals(&self, label: &str) -> AppResult<Vec<Arc<dyn Readable>>> {
        Ok(self
            .findall(label)?
            .into_iter()
            .filter_map(|device| match device {
                DeviceHandle::Signal(signal) => Some(signal),
                _ => None,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
