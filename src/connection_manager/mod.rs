//! ConnectionManager - device sessions, liveness, update fan-out
//!
//! ## Responsibilities
//!
//! - Bind protocol announcements to persistent device identities
//! - Keep the online/offline/unknown state machine, with timeout decay
//! - Fan device/position/event/keepalive updates out to subscribed users
//! - Tear sessions down when transport channels close
//!
//! Collaborators (identity, permissions, notifications, cache) are
//! supplied at construction. Inbound protocol workers, timer callbacks
//! and subscription producers all enter concurrently; the session table
//! and the listener registry have their own locks, and status
//! transitions serialize on a single gate so each device observes a
//! total order of its transitions.

mod device_cache;
mod fanout;
mod session_table;

pub use device_cache::{DeviceCache, HotDeviceSet};
pub use fanout::{ListenerRegistry, UpdateListener};
pub use session_table::{Channel, ChannelId, DeviceSession, Endpoint, SessionTable};

use crate::decay_timer::{self, DecayTimeout};
use crate::device_directory::DeviceDirectory;
use crate::models::{Device, DeviceStatus, Event, EventType, Position};
use crate::permissions::PermissionResolver;
use crate::status_events::{MotionEvaluator, NotificationSink, OverspeedEvaluator};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Connection manager tuning, read from configuration at startup
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long a device stays online with no traffic
    pub device_timeout: Duration,
    /// Evaluate motion/overspeed state when a device leaves online
    pub update_device_state: bool,
    /// Auto-register unknown unique ids
    pub register_unknown: bool,
}

/// External collaborators, injected at construction
pub struct Collaborators {
    pub directory: Arc<dyn DeviceDirectory>,
    pub permissions: Arc<dyn PermissionResolver>,
    pub notifications: Arc<dyn NotificationSink>,
    pub device_cache: Arc<dyn DeviceCache>,
}

/// ConnectionManager instance
pub struct ConnectionManager {
    /// Handed to decay timeouts so a firing callback can re-enter the
    /// manager without keeping it alive past shutdown
    self_ref: Weak<ConnectionManager>,
    settings: ConnectionSettings,
    collaborators: Collaborators,
    sessions: SessionTable,
    /// Armed online-decay timeouts; a timeout exists iff the device's
    /// latest recorded status is online
    timeouts: Mutex<HashMap<i64, DecayTimeout>>,
    listeners: ListenerRegistry,
    /// Serializes status transitions so every transition emits its event
    /// and the persisted order matches the observed order
    transition_gate: Mutex<()>,
    motion: MotionEvaluator,
    overspeed: OverspeedEvaluator,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        collaborators: Collaborators,
        motion: MotionEvaluator,
        overspeed: OverspeedEvaluator,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            settings,
            collaborators,
            sessions: SessionTable::new(),
            timeouts: Mutex::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
            transition_gate: Mutex::new(()),
            motion,
            overspeed,
        })
    }

    /// Session currently bound to the device, if any
    pub async fn session(&self, device_id: i64) -> Option<Arc<DeviceSession>> {
        self.sessions.by_device(device_id).await
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.active_count().await
    }

    /// Resolve a session from a protocol announcement.
    ///
    /// Candidates are probed in order against the endpoint's existing
    /// sessions; with no candidates, any session already on the endpoint
    /// is returned (single-device endpoints only). Otherwise the first
    /// resolvable identifier wins, the prior session for that device is
    /// evicted from both indexes, and the cache coordinator is told the
    /// device is live. Unknown or disabled devices yield `None`.
    pub async fn bind(
        &self,
        protocol: &str,
        channel: ChannelId,
        remote_addr: SocketAddr,
        unique_ids: &[&str],
    ) -> Option<Arc<DeviceSession>> {
        let endpoint = Endpoint::new(channel, remote_addr);

        if unique_ids.is_empty() {
            return self.sessions.any_on_endpoint(endpoint).await;
        }
        if let Some(session) = self.sessions.find_on_endpoint(endpoint, unique_ids).await {
            return Some(session);
        }

        // Identity resolution happens outside the session-table lock;
        // oracle failures are absorbed and treated as unrecognized.
        let mut device = None;
        for unique_id in unique_ids {
            match self.collaborators.directory.by_unique_id(unique_id).await {
                Ok(Some(found)) => {
                    device = Some(found);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(unique_id = %unique_id, error = %e, "Find device error");
                    break;
                }
            }
        }

        if device.is_none() && self.settings.register_unknown {
            match self
                .collaborators
                .directory
                .register_unknown(unique_ids[0])
                .await
            {
                Ok(registered) => device = Some(registered),
                Err(e) => {
                    tracing::warn!(unique_id = %unique_ids[0], error = %e, "Register device error")
                }
            }
        }

        match device {
            Some(device) if !device.disabled => {
                let session = Arc::new(DeviceSession::new(
                    device.id,
                    &device.unique_id,
                    protocol,
                    endpoint,
                ));
                self.sessions.insert(Arc::clone(&session)).await;
                self.collaborators.device_cache.add_device(device.id);
                tracing::info!(
                    device_id = device.id,
                    unique_id = %device.unique_id,
                    protocol = %protocol,
                    remote = %remote_addr,
                    "Device session bound"
                );
                Some(session)
            }
            Some(device) => {
                tracing::warn!(
                    device_id = device.id,
                    unique_ids = %unique_ids.join(" "),
                    remote = %remote_addr,
                    "Disabled device"
                );
                None
            }
            None => {
                tracing::warn!(
                    unique_ids = %unique_ids.join(" "),
                    remote = %remote_addr,
                    "Unknown device"
                );
                None
            }
        }
    }

    /// Transport close hook. Evicts every session on the channel's
    /// endpoint and transitions those devices offline. Idempotent: a
    /// second call for the same endpoint is a no-op.
    pub async fn device_disconnected(&self, channel: Channel) {
        let sessions = self.sessions.evict_endpoint(channel.endpoint()).await;
        for session in sessions {
            self.update_status(session.device_id(), DeviceStatus::Offline, None)
                .await;
            self.collaborators
                .device_cache
                .remove_device(session.device_id());
            tracing::info!(
                device_id = session.device_id(),
                remote = %channel.remote_addr,
                "Device session closed"
            );
        }
    }

    /// Online-decay path: the device went silent, demote it to unknown
    /// and drop its session without touching the channel (which may still
    /// carry other devices).
    pub fn device_unknown(
        &self,
        device_id: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.update_status(device_id, DeviceStatus::Unknown, None)
                .await;
            if self.sessions.evict_device(device_id).await.is_some() {
                tracing::info!(device_id, "Silent device session dropped");
            }
            self.collaborators.device_cache.remove_device(device_id);
        })
    }

    /// Drive the device-status state machine.
    ///
    /// On an actual change one synthetic event is emitted, with the
    /// motion/overspeed evaluators merged in when the device leaves
    /// online and the policy is enabled. The decay timeout is re-armed
    /// for online and cancelled otherwise; event emission precedes
    /// persistence, persistence precedes fan-out. Persistence failures
    /// are logged and the in-memory transition stands.
    pub async fn update_status(
        &self,
        device_id: i64,
        status: DeviceStatus,
        time: Option<DateTime<Utc>>,
    ) {
        let _gate = self.transition_gate.lock().await;

        let mut device = match self.collaborators.directory.by_id(device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "Find device error");
                return;
            }
        };

        let old_status = device.status;
        device.status = status;

        if status != old_status {
            let mut events: Vec<(Event, Option<Position>)> = Vec::new();
            let event_type = match status {
                DeviceStatus::Online => EventType::DeviceOnline,
                DeviceStatus::Offline => EventType::DeviceOffline,
                DeviceStatus::Unknown => EventType::DeviceUnknown,
            };
            if status != DeviceStatus::Online && self.settings.update_device_state {
                events.extend(self.update_device_state(device_id).await);
            }
            events.push((Event::new(event_type, device_id), None));
            self.collaborators.notifications.publish(events).await;
            tracing::debug!(
                device_id,
                from = old_status.as_str(),
                to = status.as_str(),
                "Device status changed"
            );
        }

        // Cancel-and-rearm is one critical section so a timeout can never
        // survive a transition out of online, and a firing callback that
        // raced the cancel observes the flag and backs off.
        {
            let mut timeouts = self.timeouts.lock().await;
            if let Some(timeout) = timeouts.remove(&device_id) {
                timeout.cancel();
            }
            if status == DeviceStatus::Online {
                let manager = Weak::clone(&self.self_ref);
                timeouts.insert(
                    device_id,
                    decay_timer::schedule(self.settings.device_timeout, move |handle| {
                        Box::pin(async move {
                            if handle.is_cancelled() {
                                return;
                            }
                            if let Some(manager) = manager.upgrade() {
                                manager.device_unknown(device_id).await;
                            }
                        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
                    }),
                );
            }
        }

        if let Some(time) = time {
            device.last_update = Some(time);
        }

        if let Err(e) = self.collaborators.directory.save_status(&device).await {
            tracing::warn!(device_id, error = %e, "Update device status error");
        }

        self.update_device(&device).await;
    }

    /// Run the motion and overspeed evaluators against the device's
    /// stored state, returning whatever events they confirm.
    pub async fn update_device_state(&self, device_id: i64) -> Vec<(Event, Option<Position>)> {
        let directory = &self.collaborators.directory;
        let mut state = directory.device_state(device_id).await;
        let now = Utc::now();

        let mut events = Vec::new();
        if let Some(event) = self.motion.update_motion_state(&mut state, now) {
            events.push(event);
        }
        let speed_limit = directory.attribute_f64(device_id, "speedLimit", 0.0).await;
        if let Some(event) = self
            .overspeed
            .update_overspeed_state(&mut state, speed_limit, now)
        {
            events.push(event);
        }
        directory.put_device_state(device_id, state).await;
        events
    }

    pub async fn add_listener(&self, user_id: i64, listener: &Arc<dyn UpdateListener>) {
        self.listeners.add(user_id, listener).await;
    }

    pub async fn remove_listener(&self, user_id: i64, listener: &Arc<dyn UpdateListener>) {
        self.listeners.remove(user_id, listener).await;
    }

    /// Keepalive to every registered listener across all users
    pub async fn send_keepalive(&self) {
        self.listeners.notify_all(|l| l.on_keepalive()).await;
    }

    /// Push a device record to every user permitted to see it
    pub async fn update_device(&self, device: &Device) {
        for user_id in self.collaborators.permissions.device_users(device.id).await {
            self.listeners
                .notify_user(user_id, |l| l.on_update_device(device))
                .await;
        }
    }

    /// Push a position to every user permitted to see its device
    pub async fn update_position(&self, position: &Position) {
        for user_id in self
            .collaborators
            .permissions
            .device_users(position.device_id)
            .await
        {
            self.listeners
                .notify_user(user_id, |l| l.on_update_position(position))
                .await;
        }
    }

    /// Push an event to one user's listeners
    pub async fn update_event(&self, user_id: i64, event: &Event) {
        self.listeners
            .notify_user(user_id, |l| l.on_update_event(event))
            .await;
    }

    /// Stop the timer wheel and clear all session state. Armed timeouts
    /// are dropped silently.
    pub async fn shutdown(&self) {
        let mut timeouts = self.timeouts.lock().await;
        for (_, timeout) in timeouts.drain() {
            timeout.abort();
        }
        drop(timeouts);
        self.sessions.clear().await;
        self.listeners.clear().await;
        tracing::info!("Connection manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_directory::{DeviceState, InMemoryDeviceDirectory};
    use crate::error::Result;
    use crate::permissions::InMemoryPermissionResolver;
    use crate::status_events::EventBroadcaster;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROTOCOL: &str = "demo";

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    fn channel(id: u64, port: u16) -> Channel {
        Channel {
            id: ChannelId(id),
            remote_addr: addr(port),
        }
    }

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

    fn position(device_id: i64) -> Position {
        Position {
            id: 1,
            device_id,
            fix_time: Utc::now(),
            latitude: 35.6,
            longitude: 139.7,
            altitude: 10.0,
            speed: 3.0,
            course: 90.0,
            valid: true,
            attributes: Map::new(),
        }
    }

    struct RecordingSink {
        batches: Mutex<Vec<Vec<(Event, Option<Position>)>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
            }
        }

        async fn event_types(&self) -> Vec<EventType> {
            self.batches
                .lock()
                .await
                .iter()
                .flatten()
                .map(|(event, _)| event.event_type)
                .collect()
        }

        async fn batch_count(&self) -> usize {
            self.batches.lock().await.len()
        }
    }

    #[async_trait::async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish(&self, events: Vec<(Event, Option<Position>)>) {
            self.batches.lock().await.push(events);
        }
    }

    #[derive(Default)]
    struct CountingListener {
        keepalives: AtomicUsize,
        devices: AtomicUsize,
        positions: AtomicUsize,
        events: AtomicUsize,
    }

    impl UpdateListener for CountingListener {
        fn on_keepalive(&self) -> Result<()> {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_update_device(&self, _device: &Device) -> Result<()> {
            self.devices.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_update_position(&self, _position: &Position) -> Result<()> {
            self.positions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_update_event(&self, _event: &Event) -> Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        directory: Arc<InMemoryDeviceDirectory>,
        permissions: Arc<InMemoryPermissionResolver>,
        sink: Arc<RecordingSink>,
        hot: Arc<HotDeviceSet>,
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            device_timeout: Duration::from_secs(600),
            update_device_state: false,
            register_unknown: false,
        }
    }

    fn harness(settings: ConnectionSettings) -> Harness {
        let directory = Arc::new(InMemoryDeviceDirectory::new());
        let permissions = Arc::new(InMemoryPermissionResolver::new());
        let sink = Arc::new(RecordingSink::new());
        let hot = Arc::new(HotDeviceSet::new());
        let manager = ConnectionManager::new(
            settings,
            Collaborators {
                directory: directory.clone(),
                permissions: permissions.clone(),
                notifications: sink.clone(),
                device_cache: hot.clone(),
            },
            MotionEvaluator::default(),
            OverspeedEvaluator::default(),
        );
        Harness {
            manager,
            directory,
            permissions,
            sink,
            hot,
        }
    }

    #[tokio::test]
    async fn first_connect_binds_and_caches() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        let session = h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();

        assert_eq!(session.device_id(), 42);
        assert_eq!(session.unique_id(), "imei-1");
        assert_eq!(session.protocol(), PROTOCOL);
        assert!(h.manager.session(42).await.is_some());
        assert!(h.hot.contains(42));
        assert_eq!(h.manager.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn probe_returns_the_existing_session_unchanged() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        let first = h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        let second = h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn zero_candidates_pick_any_session_on_the_endpoint() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        assert!(h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &[])
            .await
            .is_none());

        h.manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        let found = h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &[])
            .await
            .unwrap();
        assert_eq!(found.device_id(), 42);
    }

    #[tokio::test]
    async fn candidates_resolve_in_order_through_the_directory() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        let session = h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["alias-x", "imei-1"])
            .await
            .unwrap();
        assert_eq!(session.device_id(), 42);
        assert_eq!(session.unique_id(), "imei-1");
    }

    #[tokio::test]
    async fn rebind_on_a_new_endpoint_evicts_the_old_binding() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        h.manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        let rebound = h
            .manager
            .bind(PROTOCOL, ChannelId(2), addr(5002), &["imei-1"])
            .await
            .unwrap();

        assert_eq!(h.manager.active_sessions().await, 1);
        let current = h.manager.session(42).await.unwrap();
        assert!(Arc::ptr_eq(&current, &rebound));
        assert_eq!(current.endpoint().channel(), ChannelId(2));
        // The device is cached exactly once after the swap
        assert!(h.hot.contains(42));
        assert_eq!(h.hot.len(), 1);
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let h = harness(settings());
        assert!(h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-9"])
            .await
            .is_none());
        assert_eq!(h.manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn register_unknown_policy_creates_the_device() {
        let mut s = settings();
        s.register_unknown = true;
        let h = harness(s);

        let session = h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-new"])
            .await
            .unwrap();
        let created = h
            .directory
            .by_unique_id("imei-new")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.device_id(), created.id);
    }

    #[tokio::test]
    async fn disabled_device_is_rejected() {
        let h = harness(settings());
        let mut d = device(42, "imei-1");
        d.disabled = true;
        h.directory.put(d).await;

        assert!(h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .is_none());
        assert!(!h.hot.contains(42));
    }

    #[tokio::test]
    async fn directory_failure_is_treated_as_unknown() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;
        h.directory.set_fail_lookups(true);

        assert!(h
            .manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn disconnect_restores_the_empty_state() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        h.manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;

        h.manager.device_disconnected(channel(1, 5001)).await;

        assert!(h.manager.session(42).await.is_none());
        assert_eq!(h.manager.active_sessions().await, 0);
        assert!(!h.hot.contains(42));
        let stored = h.directory.by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Offline);
        assert_eq!(
            h.sink.event_types().await,
            vec![EventType::DeviceOnline, EventType::DeviceOffline]
        );
    }

    #[tokio::test]
    async fn disconnect_of_an_unbound_endpoint_is_a_no_op() {
        let h = harness(settings());
        h.manager.device_disconnected(channel(9, 5009)).await;
        assert_eq!(h.sink.batch_count().await, 0);
        assert_eq!(h.manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn silent_decay_only_drops_the_silent_device() {
        let h = harness(settings());
        h.directory.put(device(1, "imei-1")).await;
        h.directory.put(device(2, "imei-2")).await;

        h.manager
            .bind(PROTOCOL, ChannelId(7), addr(5001), &["imei-1"])
            .await
            .unwrap();
        h.manager
            .bind(PROTOCOL, ChannelId(7), addr(5001), &["imei-2"])
            .await
            .unwrap();

        h.manager.device_unknown(1).await;

        assert!(h.manager.session(1).await.is_none());
        assert!(h.manager.session(2).await.is_some());
        assert!(!h.hot.contains(1));
        assert!(h.hot.contains(2));
        let stored = h.directory.by_id(1).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn repeated_transition_emits_a_single_event() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;
        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;

        assert_eq!(h.sink.event_types().await, vec![EventType::DeviceOnline]);
        // The decay timeout is still armed after the refresh
        assert_eq!(h.manager.timeouts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn observation_time_refreshes_last_update() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;
        let t0 = Utc::now();

        h.manager
            .update_status(42, DeviceStatus::Online, Some(t0))
            .await;

        let stored = h.directory.by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.last_update, Some(t0));
    }

    #[tokio::test(start_paused = true)]
    async fn online_decays_to_unknown_after_the_timeout() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        h.manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        h.manager
            .update_status(42, DeviceStatus::Online, Some(Utc::now()))
            .await;

        tokio::time::sleep(Duration::from_secs(601)).await;

        let stored = h.directory.by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Unknown);
        assert!(h.manager.session(42).await.is_none());
        assert!(!h.hot.contains(42));
        assert_eq!(
            h.sink.event_types().await,
            vec![EventType::DeviceOnline, EventType::DeviceUnknown]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timeout_never_demotes_the_device() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;
        h.manager
            .update_status(42, DeviceStatus::Offline, None)
            .await;
        assert!(h.manager.timeouts.lock().await.is_empty());

        tokio::time::sleep(Duration::from_secs(700)).await;

        let stored = h.directory.by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Offline);
        assert_eq!(
            h.sink.event_types().await,
            vec![EventType::DeviceOnline, EventType::DeviceOffline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_online_refresh_rearms_the_decay() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;

        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;
        tokio::time::sleep(Duration::from_secs(400)).await;
        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;
        // 700s after the first arm, 300s after the refresh: still online
        tokio::time::sleep(Duration::from_secs(300)).await;
        let stored = h.directory.by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Online);

        tokio::time::sleep(Duration::from_secs(301)).await;
        let stored = h.directory.by_id(42).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn leaving_online_runs_the_state_evaluators() {
        let mut s = settings();
        s.update_device_state = true;
        let h = harness(s);
        h.directory.put(device(42, "imei-1")).await;

        let mut pending = position(42);
        pending.fix_time = Utc::now() - chrono::Duration::seconds(400);
        h.directory
            .put_device_state(
                42,
                DeviceState {
                    motion_state: Some(true),
                    motion_position: Some(pending),
                    ..Default::default()
                },
            )
            .await;

        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;
        h.manager
            .update_status(42, DeviceStatus::Offline, None)
            .await;

        assert_eq!(
            h.sink.event_types().await,
            vec![
                EventType::DeviceOnline,
                EventType::DeviceStopped,
                EventType::DeviceOffline
            ]
        );
    }

    #[tokio::test]
    async fn position_fanout_respects_device_visibility() {
        let h = harness(settings());
        h.permissions.grant(1, 42).await;

        let listener = Arc::new(CountingListener::default());
        let dynamic: Arc<dyn UpdateListener> = listener.clone();
        h.manager.add_listener(1, &dynamic).await;

        h.manager.update_position(&position(42)).await;
        h.manager.update_position(&position(99)).await;

        assert_eq!(listener.positions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keepalive_reaches_every_user() {
        let h = harness(settings());
        let first = Arc::new(CountingListener::default());
        let second = Arc::new(CountingListener::default());
        let first_dyn: Arc<dyn UpdateListener> = first.clone();
        let second_dyn: Arc<dyn UpdateListener> = second.clone();
        h.manager.add_listener(1, &first_dyn).await;
        h.manager.add_listener(2, &second_dyn).await;

        h.manager.send_keepalive().await;

        assert_eq!(first.keepalives.load(Ordering::SeqCst), 1);
        assert_eq!(second.keepalives.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_push_is_targeted_to_one_user() {
        let h = harness(settings());
        let first = Arc::new(CountingListener::default());
        let second = Arc::new(CountingListener::default());
        let first_dyn: Arc<dyn UpdateListener> = first.clone();
        let second_dyn: Arc<dyn UpdateListener> = second.clone();
        h.manager.add_listener(1, &first_dyn).await;
        h.manager.add_listener(2, &second_dyn).await;

        let event = Event::new(EventType::DeviceOnline, 42);
        h.manager.update_event(1, &event).await;

        assert_eq!(first.events.load(Ordering::SeqCst), 1);
        assert_eq!(second.events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_fanout_reaches_permitted_listeners() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;
        h.permissions.grant(1, 42).await;

        let listener = Arc::new(CountingListener::default());
        let dynamic: Arc<dyn UpdateListener> = listener.clone();
        h.manager.add_listener(1, &dynamic).await;

        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;

        assert_eq!(listener.devices.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcaster_forwards_events_to_permitted_users() {
        let directory = Arc::new(InMemoryDeviceDirectory::new());
        let permissions = Arc::new(InMemoryPermissionResolver::new());
        let broadcaster = Arc::new(EventBroadcaster::new(permissions.clone()));
        let hot = Arc::new(HotDeviceSet::new());
        let manager = ConnectionManager::new(
            settings(),
            Collaborators {
                directory: directory.clone(),
                permissions: permissions.clone(),
                notifications: broadcaster.clone(),
                device_cache: hot,
            },
            MotionEvaluator::default(),
            OverspeedEvaluator::default(),
        );
        broadcaster.attach(&manager);

        directory.put(device(42, "imei-1")).await;
        permissions.grant(1, 42).await;

        let listener = Arc::new(CountingListener::default());
        let dynamic: Arc<dyn UpdateListener> = listener.clone();
        manager.add_listener(1, &dynamic).await;

        manager.update_status(42, DeviceStatus::Online, None).await;

        assert_eq!(listener.events.load(Ordering::SeqCst), 1);
        assert_eq!(listener.devices.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_clears_sessions_and_timeouts() {
        let h = harness(settings());
        h.directory.put(device(42, "imei-1")).await;
        h.manager
            .bind(PROTOCOL, ChannelId(1), addr(5001), &["imei-1"])
            .await
            .unwrap();
        h.manager
            .update_status(42, DeviceStatus::Online, None)
            .await;

        h.manager.shutdown().await;

        assert_eq!(h.manager.active_sessions().await, 0);
        assert!(h.manager.timeouts.lock().await.is_empty());
    }
}
