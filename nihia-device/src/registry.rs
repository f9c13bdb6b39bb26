//! Attached-device tracking
//!
//! Fed by DEVICE_STATE notifications on global connections; queried when a
//! caller wants "the" unit of a type without knowing its serial.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use nihia_transport::DeviceTypeId;
use parking_lot::Mutex;
use tracing::debug;

/// Map of device type to the serials currently attached
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    attached: Mutex<HashMap<DeviceTypeId, BTreeSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_attached(&self, device_type: DeviceTypeId, serial: &str) {
        let mut attached = self.attached.lock();
        if attached
            .entry(device_type)
            .or_default()
            .insert(serial.to_string())
        {
            debug!("Attached {} serial {:?}", device_type, serial);
        }
    }

    /// Forget a serial; the type's entry goes away with its last serial
    pub fn mark_detached(&self, device_type: DeviceTypeId, serial: &str) {
        let mut attached = self.attached.lock();
        if let Some(serials) = attached.get_mut(&device_type) {
            if serials.remove(serial) {
                debug!("Detached {} serial {:?}", device_type, serial);
            }
            if serials.is_empty() {
                attached.remove(&device_type);
            }
        }
    }

    /// The serial of the only attached unit of this type, if exactly one is attached
    pub fn unique_serial(&self, device_type: DeviceTypeId) -> Option<String> {
        let attached = self.attached.lock();
        match attached.get(&device_type) {
            Some(serials) if serials.len() == 1 => serials.iter().next().cloned(),
            _ => None,
        }
    }

    /// Snapshot of attached serials for a type, sorted
    pub fn serials(&self, device_type: DeviceTypeId) -> Vec<String> {
        self.attached
            .lock()
            .get(&device_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Types with at least one attached unit, sorted
    pub fn device_types(&self) -> Vec<DeviceTypeId> {
        let mut types: Vec<_> = self.attached.lock().keys().copied().collect();
        types.sort();
        types
    }
}

static DEVICE_REGISTRY: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();

/// Process-wide registry, created on first use
pub fn device_registry() -> Arc<DeviceRegistry> {
    DEVICE_REGISTRY
        .get_or_init(|| Arc::new(DeviceRegistry::new()))
        .clone()
}
