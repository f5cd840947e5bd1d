//! Cache coordination for devices with a live session

use std::collections::HashSet;
use std::sync::RwLock;

/// Told when devices gain or lose a live session so cached state can be
/// loaded and dropped.
pub trait DeviceCache: Send + Sync {
    fn add_device(&self, device_id: i64);
    fn remove_device(&self, device_id: i64);
}

/// In-process hot set; add is idempotent
pub struct HotDeviceSet {
    devices: RwLock<HashSet<i64>>,
}

impl HotDeviceSet {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashSet::new()),
        }
    }

    pub fn contains(&self, device_id: i64) -> bool {
        self.devices
            .read()
            .expect("hot set poisoned")
            .contains(&device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().expect("hot set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HotDeviceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCache for HotDeviceSet {
    fn add_device(&self, device_id: i64) {
        self.devices
            .write()
            .expect("hot set poisoned")
            .insert(device_id);
        tracing::debug!(device_id, "Device cached");
    }

    fn remove_device(&self, device_id: i64) {
        self.devices
            .write()
            .expect("hot set poisoned")
            .remove(&device_id);
        tracing::debug!(device_id, "Device dropped from cache");
    }
}
