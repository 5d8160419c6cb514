//! # tagwatch-core
//!
//! Connection and alarm engine for Bluetooth LE anti-lost tags.
//!
//! This crate provides:
//! - Time-boxed discovery sweeps filtered to the tag service
//! - A per-tag link state machine with serialized GATT operations
//! - Bounded automatic reconnection with exponential backoff
//! - Alarm suppression by opt-out, Wi-Fi and quiet hours
//! - Persistent storage for claimed tags
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`engine`] - The task that owns every link, and its handle
//! - [`registry`] - Authoritative table of known tags with a change signal
//! - [`scanner`] - Discovery sweeps feeding the registry
//! - [`connection`] - Connect, discover, ready and recovery per tag
//! - [`dispatcher`] - Characteristic identifiers to handler roles
//! - [`reconnect`] - Retry budget and backoff
//! - [`alarm`] - Alarm-or-silence decisions
//! - [`transport`] - The radio seam and its BlueZ backend
//! - [`store`] - JSON persistence of claimed tags
//! - [`collaborators`] - Verification and audio seams
//! - [`config`] - Engine configuration and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod alarm;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;
pub mod reconnect;
pub mod registry;
pub mod scanner;
pub mod store;
pub mod timer;
pub mod transport;
pub mod types;
pub mod uuids;

// Re-export primary types for convenience
pub use alarm::{AlarmDecision, AlarmPolicy, AlarmSettings, QuietHours, SuppressionReason};
pub use collaborators::{AlarmSink, Collaborators, NoopAlarmSink, NoopVerifier, Verifier};
pub use config::{
    AlarmConfig, ConfigError, ConfigResult, EngineConfig, LinkConfig, QuietHoursConfig,
    ReconnectConfig, ScanConfig,
};
pub use engine::{Engine, EngineHandle, SettingsUpdate};
pub use error::{Result, TagError};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{MockTransport, RecordingAlarmSink, RecordingVerifier};
pub use registry::DeviceRegistry;
pub use store::{default_data_dir, DeviceStore, JsonDeviceStore, MemoryDeviceStore, StoredDevice};
pub use transport::{event_channel, EventReceiver, EventSender, Transport, TransportEvent};
pub use types::{
    Address, AlarmCommand, ConnectionState, DeviceRecord, DisplayState, HealthResponse,
    NetworkMode, VerifyRecord,
};
