//! DeviceDirectory - device identity and persistence
//!
//! ## Responsibilities
//!
//! - Resolve unique identifiers to device records
//! - Optional auto-registration of unknown identifiers
//! - Status persistence and per-device evaluator state
//!
//! Lookups are fallible; the session core logs failures and treats the
//! identifier as unrecognized rather than propagating storage errors to
//! protocol workers.

mod memory;
mod repository;

pub use memory::InMemoryDeviceDirectory;
pub use repository::MySqlDeviceDirectory;

use crate::error::Result;
use crate::models::{Device, Position};
use serde_json::Value;

/// Per-device scratch state consumed by the motion/overspeed evaluators
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Last confirmed motion flag
    pub motion_state: Option<bool>,
    /// Position that armed a pending motion flip, cleared on confirmation
    pub motion_position: Option<Position>,
    /// Whether the current overspeed streak has already been signalled
    pub overspeed_state: Option<bool>,
    /// Position that armed a pending overspeed event
    pub overspeed_position: Option<Position>,
}

/// Device identity oracle and status store
#[async_trait::async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn by_id(&self, device_id: i64) -> Result<Option<Device>>;

    async fn by_unique_id(&self, unique_id: &str) -> Result<Option<Device>>;

    /// Create a device record for an unrecognized identifier. Callers gate
    /// this behind the register-unknown policy.
    async fn register_unknown(&self, unique_id: &str) -> Result<Device>;

    async fn all(&self) -> Result<Vec<Device>>;

    /// Persist `status` and `last_update` of the given device
    async fn save_status(&self, device: &Device) -> Result<()>;

    async fn device_state(&self, device_id: i64) -> DeviceState;

    async fn put_device_state(&self, device_id: i64, state: DeviceState);

    /// Numeric device attribute with fallback
    async fn attribute_f64(&self, device_id: i64, key: &str, default: f64) -> f64 {
        match self.by_id(device_id).await {
            Ok(Some(device)) => device
                .attributes
                .get(key)
                .and_then(Value::as_f64)
                .unwrap_or(default),
            _ => default,
        }
    }

    /// Boolean device attribute with fallback
    async fn attribute_bool(&self, device_id: i64, key: &str, default: bool) -> bool {
        match self.by_id(device_id).await {
            Ok(Some(device)) => device
                .attributes
                .get(key)
                .and_then(Value::as_bool)
                .unwrap_or(default),
            _ => default,
        }
    }
}
