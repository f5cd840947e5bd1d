//! Listener registry and update fan-out
//!
//! Listeners are owned by their sessions (WebSocket handlers and the
//! like); the registry keeps only weak references and relies on the
//! owner's remove call at shutdown. A registration leaked past its
//! owner's lifetime is a caller bug; dead entries are skipped during
//! delivery and pruned on the next write.

use crate::error::Result;
use crate::models::{Device, Event, Position};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Subscriber callbacks. Implementations must not block and must not
/// mutate the registry from inside a callback; delivery runs under the
/// registry's shared lock.
pub trait UpdateListener: Send + Sync {
    fn on_keepalive(&self) -> Result<()>;
    fn on_update_device(&self, device: &Device) -> Result<()>;
    fn on_update_position(&self, position: &Position) -> Result<()>;
    fn on_update_event(&self, event: &Event) -> Result<()>;
}

/// Per-user listener sets
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<i64, Vec<Weak<dyn UpdateListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent on pointer identity: re-adding a registered listener
    /// leaves a single entry.
    pub async fn add(&self, user_id: i64, listener: &Arc<dyn UpdateListener>) {
        let mut map = self.listeners.write().await;
        let entry = map.entry(user_id).or_default();
        entry.retain(|weak| weak.strong_count() > 0);
        let already = entry.iter().any(|weak| {
            weak.upgrade()
                .map_or(false, |held| Arc::ptr_eq(&held, listener))
        });
        if !already {
            entry.push(Arc::downgrade(listener));
        }
    }

    /// Removing an unknown listener or user is a no-op
    pub async fn remove(&self, user_id: i64, listener: &Arc<dyn UpdateListener>) {
        let mut map = self.listeners.write().await;
        if let Some(entry) = map.get_mut(&user_id) {
            entry.retain(|weak| match weak.upgrade() {
                Some(held) => !Arc::ptr_eq(&held, listener),
                None => false,
            });
            if entry.is_empty() {
                map.remove(&user_id);
            }
        }
    }

    /// Deliver to one user's listeners. A failing listener is logged and
    /// does not stop delivery to the rest.
    pub async fn notify_user<F>(&self, user_id: i64, deliver: F)
    where
        F: Fn(&dyn UpdateListener) -> Result<()>,
    {
        let map = self.listeners.read().await;
        let Some(entry) = map.get(&user_id) else {
            return;
        };
        for weak in entry {
            if let Some(listener) = weak.upgrade() {
                if let Err(e) = deliver(listener.as_ref()) {
                    tracing::warn!(user_id, error = %e, "Listener delivery failed");
                }
            }
        }
    }

    /// Deliver to every registered listener across all users
    pub async fn notify_all<F>(&self, deliver: F)
    where
        F: Fn(&dyn UpdateListener) -> Result<()>,
    {
        let map = self.listeners.read().await;
        for (user_id, entry) in map.iter() {
            for weak in entry {
                if let Some(listener) = weak.upgrade() {
                    if let Err(e) = deliver(listener.as_ref()) {
                        tracing::warn!(user_id = *user_id, error = %e, "Listener delivery failed");
                    }
                }
            }
        }
    }

    /// Live listener count for a user
    pub async fn count_for(&self, user_id: i64) -> usize {
        self.listeners
            .read()
            .await
            .get(&user_id)
            .map(|entry| entry.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub async fn clear(&self) {
        self.listeners.write().await.clear();
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
