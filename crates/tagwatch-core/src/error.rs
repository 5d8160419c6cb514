//! Unified error types for the tagwatch core library.
//!
//! This module provides a unified error type [`TagError`] that covers all failure
//! modes across the engine. Each module also has its own specific error types
//! ([`TransportError`](crate::transport::TransportError),
//! [`StoreError`](crate::store::StoreError), [`ConfigError`](crate::config::ConfigError))
//! for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Never fatal**: Link errors degrade to "device unreachable", never to a crash
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use tagwatch_core::error::{Result, TagError};
//! use tagwatch_core::types::Address;
//!
//! fn require_known(known: bool, address: &Address) -> Result<()> {
//!     if !known {
//!         return Err(TagError::UnknownDevice(address.clone()));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::types::{Address, ConnectionState};

/// The unified error type for all tagwatch operations.
#[derive(Debug, Error)]
pub enum TagError {
    // =========================================================================
    // LINK ERRORS
    // =========================================================================
    /// The transport could not establish a link to the tag.
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Tag address.
        address: Address,
        /// Transport-provided reason.
        reason: String,
    },

    /// GATT service discovery failed on an established link.
    #[error("Service discovery on {address} failed: {reason}")]
    DiscoveryFailed {
        /// Tag address.
        address: Address,
        /// Transport-provided reason.
        reason: String,
    },

    /// A characteristic write was rejected or never acknowledged.
    #[error("Write to {characteristic} on {address} failed: {reason}")]
    WriteFailed {
        /// Tag address.
        address: Address,
        /// Target characteristic.
        characteristic: Uuid,
        /// Transport-provided reason.
        reason: String,
    },

    /// A characteristic or RSSI read failed.
    #[error("Read of {characteristic} on {address} failed: {reason}")]
    ReadFailed {
        /// Tag address.
        address: Address,
        /// Target characteristic (nil UUID for RSSI reads).
        characteristic: Uuid,
        /// Transport-provided reason.
        reason: String,
    },

    /// A connect or discovery step did not complete in time.
    #[error("Link to {address} timed out while {state}")]
    LinkTimeout {
        /// Tag address.
        address: Address,
        /// State the link was stuck in.
        state: ConnectionState,
    },

    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// The operation targeted an address that is not in the registry.
    #[error("Unknown device: '{0}'. Run a scan so the tag can be discovered first.")]
    UnknownDevice(Address),

    /// The operation requires a Ready link.
    #[error("Device {address} is not ready (currently {state})")]
    DeviceNotReady {
        /// Tag address.
        address: Address,
        /// Current connection state.
        state: ConnectionState,
    },

    /// The tag does not expose the characteristic the operation needs.
    #[error("Device {address} does not expose characteristic {characteristic}")]
    CharacteristicUnavailable {
        /// Tag address.
        address: Address,
        /// Missing characteristic.
        characteristic: Uuid,
    },

    /// The provided string is not a Bluetooth address.
    #[error("Invalid Bluetooth address: '{0}'. Expected format XX:XX:XX:XX:XX:XX.")]
    InvalidAddress(String),

    // =========================================================================
    // TRANSPORT ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    AdapterNotFound,

    /// The Bluetooth adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// Starting or stopping a scan failed.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(String),

    /// Any other radio-stack failure.
    #[error("Bluetooth transport error: {0}")]
    Transport(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & RUNTIME ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading device records.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The engine task is no longer running.
    #[error("Tag engine has shut down")]
    EngineShutdown,
}

/// A specialized [`Result`] type for tagwatch operations.
pub type Result<T> = std::result::Result<T, TagError>;

impl TagError {
    /// Returns `true` if this error comes from a radio link to a specific tag.
    #[inline]
    #[must_use]
    pub const fn is_link_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::DiscoveryFailed { .. }
                | Self::WriteFailed { .. }
                | Self::ReadFailed { .. }
                | Self::LinkTimeout { .. }
        )
    }

    /// Returns `true` if this error is about the targeted device rather than the system.
    #[inline]
    #[must_use]
    pub const fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownDevice(_)
                | Self::DeviceNotReady { .. }
                | Self::CharacteristicUnavailable { .. }
                | Self::InvalidAddress(_)
        )
    }

    /// Returns `true` if this error is related to the Bluetooth adapter or stack.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::AdapterNotFound | Self::AdapterPoweredOff | Self::ScanFailed(_) | Self::Transport(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if the engine keeps retrying on its own after this error.
    ///
    /// Connection, discovery and timeout failures feed the reconnect path; a
    /// failed scan is retried by the next sweep.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::DiscoveryFailed { .. }
                | Self::LinkTimeout { .. }
                | Self::ScanFailed(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidAddress(_) => 400,

            // 404 Not Found
            Self::UnknownDevice(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - valid request, wrong link state
            Self::DeviceNotReady { .. } | Self::CharacteristicUnavailable { .. } => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - the tag misbehaved
            Self::ConnectionFailed { .. }
            | Self::DiscoveryFailed { .. }
            | Self::WriteFailed { .. }
            | Self::ReadFailed { .. }
            | Self::LinkTimeout { .. } => 502,

            // 503 Service Unavailable - Bluetooth hardware or engine down
            Self::AdapterNotFound
            | Self::AdapterPoweredOff
            | Self::ScanFailed(_)
            | Self::Transport(_)
            | Self::EngineShutdown => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::DiscoveryFailed { .. } => "DISCOVERY_FAILED",
            Self::WriteFailed { .. } => "WRITE_FAILED",
            Self::ReadFailed { .. } => "READ_FAILED",
            Self::LinkTimeout { .. } => "LINK_TIMEOUT",
            Self::UnknownDevice(_) => "UNKNOWN_DEVICE",
            Self::DeviceNotReady { .. } => "DEVICE_NOT_READY",
            Self::CharacteristicUnavailable { .. } => "CHARACTERISTIC_UNAVAILABLE",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::AdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::AdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
            Self::ScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
            Self::Transport(_) => "BLUETOOTH_TRANSPORT_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
            Self::EngineShutdown => "ENGINE_SHUTDOWN",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for TagError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::store::StoreError> for TagError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {source}", path.display()))
            }
            StoreError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {source}", path.display()))
            }
            StoreError::DeleteError { path, source } => {
                Self::PersistenceError(format!("Failed to delete {}: {source}", path.display()))
            }
            StoreError::CreateDirError { path, source } => Self::PersistenceError(format!(
                "Failed to create directory {}: {source}",
                path.display()
            )),
            StoreError::ParseError { path, source } => {
                Self::PersistenceError(format!("Failed to parse {}: {source}", path.display()))
            }
            StoreError::SerializeError(e) => Self::PersistenceError(e.to_string()),
            StoreError::NoDataDir => {
                Self::PersistenceError("Cannot determine data directory".into())
            }
        }
    }
}

impl From<crate::transport::TransportError> for TagError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::AdapterNotFound => Self::AdapterNotFound,
            TransportError::AdapterPoweredOff => Self::AdapterPoweredOff,
            TransportError::ScanFailed { message } => Self::ScanFailed(message),
            TransportError::InvalidAddress { address } => Self::InvalidAddress(address),
            TransportError::NotConnected { address } => Self::Transport(format!(
                "No open session for {address}"
            )),
            TransportError::CharacteristicNotFound {
                address,
                characteristic,
            } => Self::CharacteristicUnavailable {
                address,
                characteristic,
            },
            TransportError::Operation { message } => Self::Transport(message),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    fn addr() -> Address {
        Address::parse("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[test]
    fn test_link_error_classification() {
        let err = TagError::ConnectionFailed {
            address: addr(),
            reason: "gatt 133".into(),
        };
        assert!(err.is_link_error());
        assert!(err.is_recoverable());
        assert!(!err.is_device_error());

        let err = TagError::WriteFailed {
            address: addr(),
            characteristic: crate::uuids::ALARM_CONTROL,
            reason: "rejected".into(),
        };
        assert!(err.is_link_error());
        // Failed writes are logged, never retried.
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_device_error_classification() {
        assert!(TagError::UnknownDevice(addr()).is_device_error());
        assert!(TagError::InvalidAddress("nope".into()).is_device_error());
        assert!(TagError::DeviceNotReady {
            address: addr(),
            state: ConnectionState::Connecting,
        }
        .is_device_error());
        assert!(!TagError::AdapterNotFound.is_device_error());
    }

    #[test]
    fn test_transport_and_config_classification() {
        assert!(TagError::AdapterPoweredOff.is_transport_error());
        assert!(TagError::ScanFailed("busy".into()).is_transport_error());
        assert!(TagError::ConfigValidationError("bad".into()).is_config_error());
        assert!(TagError::ConfigNotFound(PathBuf::from("/etc")).is_config_error());
        assert!(!TagError::EngineShutdown.is_config_error());
    }

    #[test]
    fn test_io_error_classification() {
        assert!(TagError::PersistenceError("disk full".into()).is_io_error());
        assert!(TagError::IoError(IoErr::new(ErrorKind::NotFound, "test")).is_io_error());
        assert!(!TagError::AdapterNotFound.is_io_error());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(TagError::InvalidAddress("x".into()).http_status_code(), 400);
        assert_eq!(TagError::UnknownDevice(addr()).http_status_code(), 404);
        assert_eq!(
            TagError::DeviceNotReady {
                address: addr(),
                state: ConnectionState::Disconnected,
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            TagError::ConfigParseError("x".into()).http_status_code(),
            422
        );
        assert_eq!(
            TagError::PersistenceError("x".into()).http_status_code(),
            500
        );
        assert_eq!(
            TagError::LinkTimeout {
                address: addr(),
                state: ConnectionState::Discovering,
            }
            .http_status_code(),
            502
        );
        assert_eq!(TagError::EngineShutdown.http_status_code(), 503);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TagError::UnknownDevice(addr()).error_code(), "UNKNOWN_DEVICE");
        assert_eq!(
            TagError::AdapterNotFound.error_code(),
            "BLUETOOTH_ADAPTER_NOT_FOUND"
        );
        assert_eq!(TagError::EngineShutdown.error_code(), "ENGINE_SHUTDOWN");
    }

    #[test]
    fn test_from_transport_error() {
        let err: TagError = crate::transport::TransportError::CharacteristicNotFound {
            address: addr(),
            characteristic: crate::uuids::BATTERY_LEVEL,
        }
        .into();
        assert!(matches!(err, TagError::CharacteristicUnavailable { .. }));

        let err: TagError = crate::transport::TransportError::AdapterPoweredOff.into();
        assert!(matches!(err, TagError::AdapterPoweredOff));
    }

    #[test]
    fn test_from_config_error() {
        let err: TagError = crate::config::ConfigError::ValidationError {
            field: "scan.capacity".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(format!("{err}").contains("scan.capacity"));
    }

    #[test]
    fn test_error_display_messages() {
        let err = TagError::UnknownDevice(addr());
        assert!(format!("{err}").contains("AA:BB:CC:DD:EE:FF"));

        let err = TagError::LinkTimeout {
            address: addr(),
            state: ConnectionState::Connecting,
        };
        assert!(format!("{err}").contains("Connecting"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TagError>();
        assert_sync::<TagError>();
    }
}
