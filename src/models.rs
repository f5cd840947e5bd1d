//! Shared models and types for trackhub
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    /// Went silent while online; demoted by the decay timeout
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => DeviceStatus::Online,
            "unknown" => DeviceStatus::Unknown,
            _ => DeviceStatus::Offline,
        }
    }
}

/// Tracked device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    /// Primary device-supplied identifier (IMEI or similar)
    pub unique_id: String,
    pub status: DeviceStatus,
    pub disabled: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub group_id: Option<i64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Position report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub device_id: i64,
    pub fix_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Speed in knots
    pub speed: f64,
    pub course: f64,
    pub valid: bool,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Event type wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    DeviceOnline,
    DeviceOffline,
    DeviceUnknown,
    DeviceMoving,
    DeviceStopped,
    DeviceOverspeed,
}

/// Synthetic event produced by status transitions and state evaluators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub device_id: i64,
    pub position_id: Option<i64>,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, device_id: i64) -> Self {
        Self {
            event_type,
            device_id,
            position_id: None,
            event_time: Utc::now(),
            attributes: Map::new(),
        }
    }

    pub fn with_position(event_type: EventType, position: &Position) -> Self {
        Self {
            event_type,
            device_id: position.device_id,
            position_id: Some(position.id),
            event_time: position.fix_time,
            attributes: Map::new(),
        }
    }
}

/// Device group; `group_id` points at the parent group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub group_id: Option<i64>,
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
