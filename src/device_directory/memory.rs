//! In-memory directory used by tests and single-node tooling

use super::{DeviceDirectory, DeviceState};
use crate::error::{Error, Result};
use crate::models::{Device, DeviceStatus};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;

/// HashMap-backed [`DeviceDirectory`]
pub struct InMemoryDeviceDirectory {
    devices: RwLock<HashMap<i64, Device>>,
    by_unique: RwLock<HashMap<String, i64>>,
    states: RwLock<HashMap<i64, DeviceState>>,
    next_id: AtomicI64,
    /// When set, identity lookups fail, mimicking a broken storage backend
    fail_lookups: AtomicBool,
}

impl InMemoryDeviceDirectory {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            by_unique: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            fail_lookups: AtomicBool::new(false),
        }
    }

    /// Insert a pre-built device record
    pub async fn put(&self, device: Device) {
        self.by_unique
            .write()
            .await
            .insert(device.unique_id.clone(), device.id);
        self.devices.write().await.insert(device.id, device);
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    fn check_healthy(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            Err(Error::Internal("storage backend unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryDeviceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for InMemoryDeviceDirectory {
    async fn by_id(&self, device_id: i64) -> Result<Option<Device>> {
        self.check_healthy()?;
        Ok(self.devices.read().await.get(&device_id).cloned())
    }

    async fn by_unique_id(&self, unique_id: &str) -> Result<Option<Device>> {
        self.check_healthy()?;
        let id = self.by_unique.read().await.get(unique_id).copied();
        match id {
            Some(id) => Ok(self.devices.read().await.get(&id).cloned()),
            None => Ok(None),
        }
    }

    async fn register_unknown(&self, unique_id: &str) -> Result<Device> {
        self.check_healthy()?;
        let device = Device {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: unique_id.to_string(),
            unique_id: unique_id.to_string(),
            status: DeviceStatus::Offline,
            disabled: false,
            last_update: None,
            group_id: None,
            attributes: Map::new(),
        };
        self.put(device.clone()).await;
        tracing::info!(
            device_id = device.id,
            unique_id = %unique_id,
            "Auto-registered unknown device"
        );
        Ok(device)
    }

    async fn all(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn save_status(&self, device: &Device) -> Result<()> {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&device.id) {
            Some(stored) => {
                stored.status = device.status;
                stored.last_update = device.last_update;
                Ok(())
            }
            None => Err(Error::NotFound(format!("Device {} not found", device.id))),
        }
    }

    async fn device_state(&self, device_id: i64) -> DeviceState {
        self.states
            .read()
            .await
            .get(&device_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn put_device_state(&self, device_id: i64, state: DeviceState) {
        self.states.write().await.insert(device_id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: i64, unique_id: &str) -> Device {
        Device {
            id,
            name: format!("tracker-{id}"),
            unique_id: unique_id.to_string(),
            status: DeviceStatus::Offline,
            disabled: false,
            last_update: None,
            group_id: None,
            attributes: Map::new(),
        }
    }

    #[tokio::test]
    async fn resolves_by_both_keys() {
        let directory = InMemoryDeviceDirectory::new();
        directory.put(device(42, "imei-1")).await;

        assert_eq!(directory.by_id(42).await.unwrap().unwrap().id, 42);
        assert_eq!(
            directory.by_unique_id("imei-1").await.unwrap().unwrap().id,
            42
        );
        assert!(directory.by_unique_id("imei-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn register_unknown_assigns_fresh_ids() {
        let directory = InMemoryDeviceDirectory::new();
        let a = directory.register_unknown("imei-a").await.unwrap();
        let b = directory.register_unknown("imei-b").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(
            directory.by_unique_id("imei-b").await.unwrap().unwrap().id,
            b.id
        );
    }

    #[tokio::test]
    async fn fault_toggle_breaks_lookups() {
        let directory = InMemoryDeviceDirectory::new();
        directory.put(device(1, "imei-1")).await;
        directory.set_fail_lookups(true);
        assert!(directory.by_unique_id("imei-1").await.is_err());
        directory.set_fail_lookups(false);
        assert!(directory.by_unique_id("imei-1").await.is_ok());
    }

    #[tokio::test]
    async fn attribute_lookup_falls_back_to_default() {
        let directory = InMemoryDeviceDirectory::new();
        let mut d = device(7, "imei-7");
        d.attributes
            .insert("speedLimit".to_string(), serde_json::json!(90.0));
        directory.put(d).await;

        assert_eq!(directory.attribute_f64(7, "speedLimit", 0.0).await, 90.0);
        assert_eq!(directory.attribute_f64(7, "missing", 5.0).await, 5.0);
        assert_eq!(directory.attribute_f64(99, "speedLimit", 0.0).await, 0.0);
    }
}
