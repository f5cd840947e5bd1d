//! Device visibility oracle
//!
//! Fan-out filtering consumes visibility as plain membership: which users
//! may see a device. Evaluation of roles or group inheritance happens
//! upstream of the link table.

use std::collections::{HashMap, HashSet};

use sqlx::MySqlPool;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait PermissionResolver: Send + Sync {
    /// All users permitted to see the device
    async fn device_users(&self, device_id: i64) -> HashSet<i64>;

    /// Whether a single user may see the device
    async fn check_device(&self, user_id: i64, device_id: i64) -> bool {
        self.device_users(device_id).await.contains(&user_id)
    }
}

/// Resolver over the `user_devices` link table
pub struct MySqlPermissionResolver {
    pool: MySqlPool,
}

impl MySqlPermissionResolver {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PermissionResolver for MySqlPermissionResolver {
    async fn device_users(&self, device_id: i64) -> HashSet<i64> {
        let users: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM user_devices WHERE device_id = ?")
                .bind(device_id)
                .fetch_all(&self.pool)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(device_id, error = %e, "Device user lookup failed");
                    Vec::new()
                });
        users.into_iter().collect()
    }
}

/// In-memory resolver for tests and tooling
pub struct InMemoryPermissionResolver {
    grants: RwLock<HashMap<i64, HashSet<i64>>>,
}

impl InMemoryPermissionResolver {
    pub fn new() -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
        }
    }

    pub async fn grant(&self, user_id: i64, device_id: i64) {
        self.grants
            .write()
            .await
            .entry(device_id)
            .or_default()
            .insert(user_id);
    }
}

impl Default for InMemoryPermissionResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PermissionResolver for InMemoryPermissionResolver {
    async fn device_users(&self, device_id: i64) -> HashSet<i64> {
        self.grants
            .read()
            .await
            .get(&device_id)
            .cloned()
            .unwrap_or_default()
    }
}
