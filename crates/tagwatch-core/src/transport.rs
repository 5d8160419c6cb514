//! Radio transport abstraction.
//!
//! The engine never blocks on the radio. Every [`Transport`] method only
//! *initiates* an operation and returns immediately; the outcome is posted
//! later as a [`TransportEvent`] on the channel handed to the backend at
//! construction time. All completions for all tags share that one channel.
//!
//! Every session is opened under an attempt id chosen by the caller. Link
//! events echo it, so an event left over from a torn-down session can be
//! told apart from one about the session that replaced it.
//!
//! Two backends exist:
//!
//! - [`BluerTransport`](bluez::BluerTransport) talks to `BlueZ` over D-Bus (feature `bluetooth`)
//! - [`MockTransport`](crate::mock::MockTransport) records calls and can script completions

#[cfg(feature = "bluetooth")]
pub mod bluez;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::Address;

/// GATT property bit: the characteristic can be read.
pub const PROPERTY_READ: u32 = 0x02;
/// GATT property bit: write without response.
pub const PROPERTY_WRITE_WITHOUT_RESPONSE: u32 = 0x04;
/// GATT property bit: write with response.
pub const PROPERTY_WRITE: u32 = 0x08;
/// GATT property bit: notifications.
pub const PROPERTY_NOTIFY: u32 = 0x10;
/// GATT property bit: indications.
pub const PROPERTY_INDICATE: u32 = 0x20;

/// Sender half of the transport completion channel.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half of the transport completion channel.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a completion channel for a transport backend.
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Errors raised when a transport operation cannot even be started.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No adapter is present.
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter is powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// A scan could not be started or stopped.
    #[error("Scan failed: {message}")]
    ScanFailed {
        /// Backend message.
        message: String,
    },

    /// The backend could not interpret the address.
    #[error("Invalid address: {address}")]
    InvalidAddress {
        /// Offending address text.
        address: String,
    },

    /// The operation needs an open session that does not exist.
    #[error("No open session for {address}")]
    NotConnected {
        /// Tag address.
        address: Address,
    },

    /// The session does not expose the requested characteristic.
    #[error("Characteristic {characteristic} not found on {address}")]
    CharacteristicNotFound {
        /// Tag address.
        address: Address,
        /// Missing characteristic.
        characteristic: Uuid,
    },

    /// Any other backend failure.
    #[error("{message}")]
    Operation {
        /// Backend message.
        message: String,
    },
}

/// Identifies a characteristic inside a tag's GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Owning service.
    pub service: Uuid,
    /// Characteristic itself.
    pub characteristic: Uuid,
}

/// A characteristic reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Characteristic identifier.
    pub uuid: Uuid,
    /// GATT property bitmask (`PROPERTY_*`).
    pub properties: u32,
}

/// A service reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service identifier.
    pub uuid: Uuid,
    /// Characteristics in discovery order.
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address.
    pub address: Address,
    /// Local name, if advertised.
    pub name: Option<String>,
    /// Received signal strength.
    pub rssi: Option<i16>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Asynchronous completion of a transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A scan saw an advertisement.
    Discovered(Advertisement),

    /// A link came up.
    Connected {
        /// Tag address.
        address: Address,
        /// Attempt the session was opened under.
        attempt: u64,
    },

    /// A link went down, or a connect attempt failed.
    Disconnected {
        /// Tag address.
        address: Address,
        /// Attempt the session was opened under.
        attempt: u64,
        /// Failure text when the link never came up or broke with an error.
        reason: Option<String>,
    },

    /// Service discovery finished.
    ServicesDiscovered {
        /// Tag address.
        address: Address,
        /// Attempt the session was opened under.
        attempt: u64,
        /// Discovered services, or the failure text.
        result: Result<Vec<DiscoveredService>, String>,
    },

    /// A characteristic read finished.
    CharacteristicRead {
        /// Tag address.
        address: Address,
        /// Characteristic that was read.
        handle: CharacteristicHandle,
        /// Value, or the failure text.
        result: Result<Vec<u8>, String>,
    },

    /// A characteristic write finished.
    CharacteristicWritten {
        /// Tag address.
        address: Address,
        /// Characteristic that was written.
        handle: CharacteristicHandle,
        /// Failure text on error.
        result: Result<(), String>,
    },

    /// The tag pushed a notification.
    Notification {
        /// Tag address.
        address: Address,
        /// Source characteristic.
        handle: CharacteristicHandle,
        /// Notified value.
        value: Vec<u8>,
    },

    /// An RSSI read finished.
    RssiRead {
        /// Tag address.
        address: Address,
        /// Signal strength in dBm, or the failure text.
        result: Result<i16, String>,
    },
}

impl TransportEvent {
    /// The tag this event concerns.
    #[must_use]
    pub fn address(&self) -> &Address {
        match self {
            Self::Discovered(adv) => &adv.address,
            Self::Connected { address, .. }
            | Self::Disconnected { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::CharacteristicRead { address, .. }
            | Self::CharacteristicWritten { address, .. }
            | Self::Notification { address, .. }
            | Self::RssiRead { address, .. } => address,
        }
    }
}

/// Non-blocking radio primitives.
///
/// Implementations keep at most one session per address. Every connect,
/// discovery, read, write and RSSI initiation that returned `Ok` is answered
/// by one completion event unless the session is closed first. A failed
/// connect is reported as [`TransportEvent::Disconnected`] with a reason.
pub trait Transport: Send + Sync {
    /// Begin scanning for advertisements carrying any of `services`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan cannot be started.
    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    /// Stop the current scan. Stopping an idle scanner is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the request.
    fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open a session to `address` under `attempt`.
    ///
    /// `Connected`, `Disconnected` and `ServicesDiscovered` events for this
    /// session carry the same attempt id.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt cannot be started.
    fn connect(&self, address: &Address, attempt: u64) -> Result<(), TransportError>;

    /// Ask the tag to drop the link. Completion arrives as `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists.
    fn disconnect(&self, address: &Address) -> Result<(), TransportError>;

    /// Release every resource held for `address` without posting events.
    fn close(&self, address: &Address);

    /// Enumerate the GATT table.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists.
    fn discover_services(&self, address: &Address) -> Result<(), TransportError>;

    /// Read a characteristic value.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists.
    fn read_characteristic(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
    ) -> Result<(), TransportError>;

    /// Write a characteristic value.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists.
    fn write_characteristic(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Enable or disable notifications. Notifications arrive as `Notification`.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists.
    fn set_notify(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Sample the link's signal strength.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists.
    fn read_rssi(&self, address: &Address) -> Result<(), TransportError>;
}
