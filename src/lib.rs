//! trackhub - GPS/telemetry tracking server core
//!
//! ## Architecture (8 Components)
//!
//! 1. ConnectionManager - device session binding, liveness state machine, fan-out
//! 2. DeviceDirectory - device identity resolution and status persistence
//! 3. GroupRegistry - device group hierarchy with cycle guard
//! 4. Permissions - device visibility oracle for fan-out filtering
//! 5. StatusEvents - motion/overspeed evaluators and event delivery
//! 6. DecayTimer - cancellable one-shot online-decay timeouts
//! 7. Ingress - newline-framed TCP tracker endpoint
//! 8. WebAPI - REST endpoints and WebSocket update subscriptions
//!
//! ## Design Principles
//!
//! - The session table is the single in-process authority for which
//!   device is online, on which endpoint
//! - Collaborators are constructor-supplied; no process-wide registry
//! - Storage I/O stays outside the session-table critical sections

pub mod connection_manager;
pub mod decay_timer;
pub mod device_directory;
pub mod error;
pub mod group_registry;
pub mod ingress;
pub mod models;
pub mod permissions;
pub mod state;
pub mod status_events;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
