//! StatusEvents - event delivery and device state evaluators
//!
//! ## Responsibilities
//!
//! - Deliver synthetic events produced by status transitions
//! - Confirm pending motion flips (deviceMoving / deviceStopped)
//! - Confirm pending overspeed streaks (deviceOverspeed)
//!
//! Evaluators run when a device leaves the online state, so a decayed or
//! disconnected device still closes out its trip/overspeed bookkeeping.

use crate::connection_manager::ConnectionManager;
use crate::device_directory::DeviceState;
use crate::models::{Event, EventType, Position};
use crate::permissions::PermissionResolver;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock, Weak};

/// Destination for synthetic events, paired with the position that
/// produced them when one exists.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, events: Vec<(Event, Option<Position>)>);
}

/// Production sink: forwards each event to every user permitted to see
/// the device, through the connection manager's targeted fan-out.
///
/// The manager is attached after construction; the sink keeps only a weak
/// reference so teardown order does not matter.
pub struct EventBroadcaster {
    manager: RwLock<Weak<ConnectionManager>>,
    permissions: Arc<dyn PermissionResolver>,
}

impl EventBroadcaster {
    pub fn new(permissions: Arc<dyn PermissionResolver>) -> Self {
        Self {
            manager: RwLock::new(Weak::new()),
            permissions,
        }
    }

    pub fn attach(&self, manager: &Arc<ConnectionManager>) {
        *self.manager.write().expect("manager slot poisoned") = Arc::downgrade(manager);
    }

    fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.manager.read().expect("manager slot poisoned").upgrade()
    }
}

#[async_trait::async_trait]
impl NotificationSink for EventBroadcaster {
    async fn publish(&self, events: Vec<(Event, Option<Position>)>) {
        let Some(manager) = self.manager() else {
            tracing::debug!("Event fan-out skipped, no manager attached");
            return;
        };
        for (event, _position) in events {
            for user_id in self.permissions.device_users(event.device_id).await {
                manager.update_event(user_id, &event).await;
            }
        }
    }
}

/// Confirms a pending motion flip once it has held long enough
pub struct MotionEvaluator {
    minimal_trip_duration: Duration,
    minimal_parking_duration: Duration,
}

impl MotionEvaluator {
    pub fn new(minimal_trip_duration: Duration, minimal_parking_duration: Duration) -> Self {
        Self {
            minimal_trip_duration,
            minimal_parking_duration,
        }
    }

    /// Emit deviceMoving/deviceStopped when the armed position is old
    /// enough, flipping the recorded state and clearing the pending slot.
    pub fn update_motion_state(
        &self,
        state: &mut DeviceState,
        now: DateTime<Utc>,
    ) -> Option<(Event, Option<Position>)> {
        let motion = state.motion_state?;
        let position = state.motion_position.clone()?;

        let new_motion = !motion;
        let hold = if new_motion {
            self.minimal_trip_duration
        } else {
            self.minimal_parking_duration
        };
        if position.fix_time + hold > now {
            return None;
        }

        let event_type = if new_motion {
            EventType::DeviceMoving
        } else {
            EventType::DeviceStopped
        };
        let event = Event::with_position(event_type, &position);
        state.motion_state = Some(new_motion);
        state.motion_position = None;
        Some((event, Some(position)))
    }
}

impl Default for MotionEvaluator {
    fn default() -> Self {
        Self::new(Duration::seconds(300), Duration::seconds(300))
    }
}

/// Confirms a pending overspeed streak once it has held long enough
pub struct OverspeedEvaluator {
    minimal_duration: Duration,
}

impl OverspeedEvaluator {
    pub fn new(minimal_duration: Duration) -> Self {
        Self { minimal_duration }
    }

    /// Emit deviceOverspeed for an unconfirmed streak older than the
    /// minimal duration. A zero speed limit disables the check.
    pub fn update_overspeed_state(
        &self,
        state: &mut DeviceState,
        speed_limit: f64,
        now: DateTime<Utc>,
    ) -> Option<(Event, Option<Position>)> {
        if state.overspeed_state != Some(false) || speed_limit == 0.0 {
            return None;
        }
        let position = state.overspeed_position.clone()?;
        if position.fix_time + self.minimal_duration > now {
            return None;
        }

        let mut event = Event::with_position(EventType::DeviceOverspeed, &position);
        event
            .attributes
            .insert("speed".to_string(), serde_json::json!(position.speed));
        event
            .attributes
            .insert("speedLimit".to_string(), serde_json::json!(speed_limit));
        state.overspeed_state = Some(true);
        state.overspeed_position = None;
        Some((event, Some(position)))
    }
}

impl Default for OverspeedEvaluator {
    fn default() -> Self {
        Self::new(Duration::seconds(60))
    }
}
