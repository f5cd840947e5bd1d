//! Group storage backends

use crate::error::{Error, Result};
use crate::models::Group;
use sqlx::MySqlPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait GroupRepository: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<Group>>;

    /// Insert and return the assigned id
    async fn insert(&self, group: &Group) -> Result<i64>;

    async fn update(&self, group: &Group) -> Result<()>;
}

/// MySQL repository over the `groups` table
pub struct MySqlGroupRepository {
    pool: MySqlPool,
}

impl MySqlGroupRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: i64,
    name: String,
    group_id: Option<i64>,
}

#[async_trait::async_trait]
impl GroupRepository for MySqlGroupRepository {
    async fn fetch_all(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query_as::<_, GroupRow>("SELECT id, name, group_id FROM `groups`")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Group {
                id: row.id,
                name: row.name,
                group_id: row.group_id,
            })
            .collect())
    }

    async fn insert(&self, group: &Group) -> Result<i64> {
        let result = sqlx::query("INSERT INTO `groups` (name, group_id) VALUES (?, ?)")
            .bind(&group.name)
            .bind(group.group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn update(&self, group: &Group) -> Result<()> {
        let result = sqlx::query("UPDATE `groups` SET name = ?, group_id = ? WHERE id = ?")
            .bind(&group.name)
            .bind(group.group_id)
            .bind(group.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Group {} not found", group.id)));
        }
        Ok(())
    }
}

/// In-memory repository for tests and tooling
pub struct InMemoryGroupRepository {
    groups: RwLock<HashMap<i64, Group>>,
    next_id: AtomicI64,
}

impl InMemoryGroupRepository {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Seed a group without going through the service (cold-start data)
    pub async fn seed(&self, group: Group) {
        let mut groups = self.groups.write().await;
        if group.id >= self.next_id.load(Ordering::SeqCst) {
            self.next_id.store(group.id + 1, Ordering::SeqCst);
        }
        groups.insert(group.id, group);
    }
}

impl Default for InMemoryGroupRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GroupRepository for InMemoryGroupRepository {
    async fn fetch_all(&self) -> Result<Vec<Group>> {
        Ok(self.groups.read().await.values().cloned().collect())
    }

    async fn insert(&self, group: &Group) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = group.clone();
        stored.id = id;
        self.groups.write().await.insert(id, stored);
        Ok(id)
    }

    async fn update(&self, group: &Group) -> Result<()> {
        let mut groups = self.groups.write().await;
        if !groups.contains_key(&group.id) {
            return Err(Error::NotFound(format!("Group {} not found", group.id)));
        }
        groups.insert(group.id, group.clone());
        Ok(())
    }
}
