//! MySQL-backed device directory

use super::{DeviceDirectory, DeviceState};
use crate::error::{Error, Result};
use crate::models::{Device, DeviceStatus};
use chrono::{DateTime, Utc};
use serde_json::Map;
use sqlx::MySqlPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Device SELECT columns
const DEVICE_COLUMNS: &str = "id, name, unique_id, status, disabled, last_update, group_id, attributes";

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    name: String,
    unique_id: String,
    status: Option<String>,
    disabled: bool,
    last_update: Option<DateTime<Utc>>,
    group_id: Option<i64>,
    attributes: Option<String>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id,
            name: row.name,
            unique_id: row.unique_id,
            status: row
                .status
                .as_deref()
                .map(DeviceStatus::parse)
                .unwrap_or_default(),
            disabled: row.disabled,
            last_update: row.last_update,
            group_id: row.group_id,
            attributes: row
                .attributes
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Map<_, _>>(raw).ok())
                .unwrap_or_default(),
        }
    }
}

/// MySQL [`DeviceDirectory`]. Device records live in the `devices` table;
/// evaluator state is kept in memory alongside the pool.
pub struct MySqlDeviceDirectory {
    pool: MySqlPool,
    states: RwLock<HashMap<i64, DeviceState>>,
}

impl MySqlDeviceDirectory {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            states: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for MySqlDeviceDirectory {
    async fn by_id(&self, device_id: i64) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS);
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Device::from))
    }

    async fn by_unique_id(&self, unique_id: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {} FROM devices WHERE unique_id = ?", DEVICE_COLUMNS);
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Device::from))
    }

    async fn register_unknown(&self, unique_id: &str) -> Result<Device> {
        let result = sqlx::query(
            "INSERT INTO devices (name, unique_id, status, disabled, attributes) \
             VALUES (?, ?, 'offline', FALSE, '{}')",
        )
        .bind(unique_id)
        .bind(unique_id)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_id() as i64;
        tracing::info!(device_id = id, unique_id = %unique_id, "Auto-registered unknown device");

        self.by_id(id)
            .await?
            .ok_or_else(|| Error::Internal(format!("Registered device {} vanished", id)))
    }

    async fn all(&self) -> Result<Vec<Device>> {
        let query = format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS);
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn save_status(&self, device: &Device) -> Result<()> {
        sqlx::query("UPDATE devices SET status = ?, last_update = ? WHERE id = ?")
            .bind(device.status.as_str())
            .bind(device.last_update)
            .bind(device.id)
            .execute(&self.pool)
            .await?;
        Ok(())
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
