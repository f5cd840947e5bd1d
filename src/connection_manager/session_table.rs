//! Dual-indexed registry of live device sessions
//!
//! Both indexes live behind one mutex: every mutation is a single critical
//! section, so the by-device and by-endpoint views can never be observed
//! disagreeing. Storage I/O never happens under this lock.

use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Opaque transport channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

/// Transport channel together with the remote address it reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub id: ChannelId,
    pub remote_addr: SocketAddr,
}

impl Channel {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.id, self.remote_addr)
    }
}

/// Transport-layer identity. Two endpoints are equal iff both the channel
/// and the remote address are equal; datagram transports share one channel
/// across many remotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    channel: ChannelId,
    remote_addr: SocketAddr,
}

impl Endpoint {
    pub fn new(channel: ChannelId, remote_addr: SocketAddr) -> Self {
        Self {
            channel,
            remote_addr,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Binding of a device identity to a live endpoint, created on first
/// successful identification and immutable apart from decoder scratch
/// attributes.
pub struct DeviceSession {
    device_id: i64,
    unique_id: String,
    protocol: String,
    endpoint: Endpoint,
    attributes: StdMutex<HashMap<String, Value>>,
}

impl DeviceSession {
    pub fn new(device_id: i64, unique_id: &str, protocol: &str, endpoint: Endpoint) -> Self {
        Self {
            device_id,
            unique_id: unique_id.to_string(),
            protocol: protocol.to_string(),
            endpoint,
            attributes: StdMutex::new(HashMap::new()),
        }
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Per-protocol decoder scratch value
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes
            .lock()
            .expect("session attributes poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_attribute(&self, key: &str, value: Value) {
        self.attributes
            .lock()
            .expect("session attributes poisoned")
            .insert(key.to_string(), value);
    }
}

#[derive(Default)]
struct Indexes {
    by_device: HashMap<i64, Arc<DeviceSession>>,
    by_endpoint: HashMap<Endpoint, HashMap<String, Arc<DeviceSession>>>,
}

impl Indexes {
    /// Drop `unique_id` from an endpoint submap, removing the endpoint key
    /// when the submap empties. Absent submaps are left alone.
    fn remove_from_endpoint(&mut self, endpoint: Endpoint, unique_id: &str) {
        if let Some(sessions) = self.by_endpoint.get_mut(&endpoint) {
            sessions.remove(unique_id);
            if sessions.is_empty() {
                self.by_endpoint.remove(&endpoint);
            }
        }
    }
}

/// The session registry. At most one session per device; one endpoint may
/// carry several logical devices when a protocol multiplexes.
pub struct SessionTable {
    indexes: Mutex<Indexes>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
        }
    }

    pub async fn by_device(&self, device_id: i64) -> Option<Arc<DeviceSession>> {
        self.indexes.lock().await.by_device.get(&device_id).cloned()
    }

    /// Probe an endpoint for the first matching candidate identifier
    pub async fn find_on_endpoint(
        &self,
        endpoint: Endpoint,
        unique_ids: &[&str],
    ) -> Option<Arc<DeviceSession>> {
        let indexes = self.indexes.lock().await;
        let sessions = indexes.by_endpoint.get(&endpoint)?;
        unique_ids
            .iter()
            .find_map(|unique_id| sessions.get(*unique_id).cloned())
    }

    /// Arbitrary session on the endpoint. Only meaningful for endpoints
    /// known to carry a single device.
    pub async fn any_on_endpoint(&self, endpoint: Endpoint) -> Option<Arc<DeviceSession>> {
        let indexes = self.indexes.lock().await;
        indexes
            .by_endpoint
            .get(&endpoint)?
            .values()
            .next()
            .cloned()
    }

    /// Insert a session, evicting any prior session for the same device
    /// from both indexes in the same critical section.
    pub async fn insert(&self, session: Arc<DeviceSession>) {
        let mut indexes = self.indexes.lock().await;
        if let Some(old) = indexes.by_device.remove(&session.device_id()) {
            indexes.remove_from_endpoint(old.endpoint(), old.unique_id());
        }
        indexes
            .by_endpoint
            .entry(session.endpoint())
            .or_default()
            .insert(session.unique_id().to_string(), Arc::clone(&session));
        indexes.by_device.insert(session.device_id(), session);
    }

    /// Drain every session bound to the endpoint. Idempotent: a second
    /// call returns nothing.
    pub async fn evict_endpoint(&self, endpoint: Endpoint) -> Vec<Arc<DeviceSession>> {
        let mut indexes = self.indexes.lock().await;
        let Some(sessions) = indexes.by_endpoint.remove(&endpoint) else {
            return Vec::new();
        };
        let sessions: Vec<_> = sessions.into_values().collect();
        for session in &sessions {
            indexes.by_device.remove(&session.device_id());
        }
        sessions
    }

    /// Surgically remove one device, leaving other sessions on its
    /// endpoint bound.
    pub async fn evict_device(&self, device_id: i64) -> Option<Arc<DeviceSession>> {
        let mut indexes = self.indexes.lock().await;
        let session = indexes.by_device.remove(&device_id)?;
        indexes.remove_from_endpoint(session.endpoint(), session.unique_id());
        Some(session)
    }

    pub async fn active_count(&self) -> usize {
        self.indexes.lock().await.by_device.len()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.indexes.lock().await.by_endpoint.len()
    }

    pub async fn clear(&self) {
        let mut indexes = self.indexes.lock().await;
        indexes.by_device.clear();
        indexes.by_endpoint.clear();
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
