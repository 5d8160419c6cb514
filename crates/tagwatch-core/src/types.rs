//! Shared types and OpenAPI schemas.
//!
//! These types flow between the engine components and out through the HTTP
//! API, so most of them derive [`ToSchema`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::TagError;

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("address pattern compiles")
});

/// A Bluetooth device address, normalized to upper-case `XX:XX:XX:XX:XX:XX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
#[schema(example = "AA:BB:CC:DD:EE:FF")]
pub struct Address(String);

impl Address {
    /// Parse and normalize an address string.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidAddress`] if the string is not six
    /// colon-separated hex octets.
    pub fn parse(s: &str) -> Result<Self, TagError> {
        let trimmed = s.trim();
        if ADDRESS_RE.is_match(trimmed) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(TagError::InvalidAddress(s.to_string()))
        }
    }

    /// The normalized address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Link lifecycle of a single tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Link requested, waiting for the transport.
    Connecting,
    /// Linked, GATT services being discovered.
    Discovering,
    /// Services discovered and configured.
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Discovering => "Discovering",
            Self::Ready => "Ready",
        };
        f.write_str(s)
    }
}

/// User-facing status label for a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    /// Not currently seen or linked.
    #[default]
    Searching,
    /// Seen in a scan, not yet claimed.
    Found,
    /// A link attempt is in progress.
    Connecting,
    /// Linked and idle.
    Ready,
    /// Linked and the tag is ringing.
    Ringing,
    /// An established link was lost.
    Lost,
}

/// Everything the engine knows about one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceRecord {
    /// Unique key.
    pub address: Address,

    /// User-visible label.
    #[schema(example = "Keys")]
    pub nickname: String,

    /// Whether the user has claimed this tag.
    pub is_mine: bool,

    /// Alarm the phone when an established link drops.
    pub alarm_on_disconnect: bool,

    /// Current link state.
    pub connection_state: ConnectionState,

    /// User-facing label.
    pub display_state: DisplayState,

    /// Whether a lost-link alarm is currently sounding.
    pub is_alarming: bool,

    /// Remaining automatic reconnect attempts.
    #[schema(example = 5)]
    pub reconnect_budget: u8,

    /// Last battery reading, percent.
    #[schema(example = 77)]
    pub battery: Option<u8>,

    /// Last RSSI sample, dBm.
    #[schema(example = -60)]
    pub rssi: Option<i16>,

    /// Alert sound index chosen by the user.
    pub ring_index: u8,

    /// Optional image reference chosen by the user.
    pub image: Option<String>,

    /// Name carried in the last advertisement.
    pub advertised_name: Option<String>,

    /// Raw payload of the last advertisement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertisement: Vec<u8>,

    /// When the tag's button was last pressed.
    pub last_button_press: Option<DateTime<Utc>>,

    /// When the tag was last heard from.
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// Create a fresh, unclaimed record.
    #[must_use]
    pub fn new(address: Address, nickname: impl Into<String>) -> Self {
        Self {
            address,
            nickname: nickname.into(),
            is_mine: false,
            alarm_on_disconnect: true,
            connection_state: ConnectionState::Disconnected,
            display_state: DisplayState::Searching,
            is_alarming: false,
            reconnect_budget: crate::reconnect::DEFAULT_RECONNECT_BUDGET,
            battery: None,
            rssi: None,
            ring_index: 0,
            image: None,
            advertised_name: None,
            advertisement: Vec::new(),
            last_button_press: None,
            last_seen: None,
        }
    }

    /// Whether the engine holds a link (or a link attempt) for this tag.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.connection_state != ConnectionState::Disconnected
    }
}

/// Partial update applied by [`DeviceRegistry::upsert`](crate::registry::DeviceRegistry::upsert).
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    /// New nickname.
    pub nickname: Option<String>,
    /// New claim flag.
    pub is_mine: Option<bool>,
    /// New alarm-on-disconnect flag.
    pub alarm_on_disconnect: Option<bool>,
    /// New ring index.
    pub ring_index: Option<u8>,
    /// New image reference (`Some(None)` clears it).
    pub image: Option<Option<String>>,
    /// New advertised name.
    pub advertised_name: Option<String>,
    /// New advertisement payload.
    pub advertisement: Option<Vec<u8>>,
    /// New RSSI sample.
    pub rssi: Option<i16>,
    /// New last-seen timestamp.
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    /// Apply this update to `record`, returning whether anything changed.
    pub fn apply(self, record: &mut DeviceRecord) -> bool {
        let before = record.clone();
        if let Some(v) = self.nickname {
            record.nickname = v;
        }
        if let Some(v) = self.is_mine {
            record.is_mine = v;
        }
        if let Some(v) = self.alarm_on_disconnect {
            record.alarm_on_disconnect = v;
        }
        if let Some(v) = self.ring_index {
            record.ring_index = v;
        }
        if let Some(v) = self.image {
            record.image = v;
        }
        if let Some(v) = self.advertised_name {
            record.advertised_name = Some(v);
        }
        if let Some(v) = self.advertisement {
            record.advertisement = v;
        }
        if let Some(v) = self.rssi {
            record.rssi = Some(v);
        }
        if let Some(v) = self.last_seen {
            record.last_seen = Some(v);
        }
        *record != before
    }
}

/// Report submitted to the remote verification service once a tag is Ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VerifyRecord {
    /// Advertised or configured device name.
    #[serde(rename = "name")]
    pub device_name: String,

    /// Hex-encoded advertisement payload.
    #[serde(rename = "adv")]
    pub advertisement: String,

    /// Tag address.
    #[serde(rename = "mac")]
    pub address: String,

    /// One entry per discovered characteristic.
    #[serde(rename = "charc")]
    pub characteristic_summary: String,

    /// Version of this software.
    #[serde(rename = "appv")]
    pub app_version: String,
}

impl VerifyRecord {
    /// Build a record for `device` with the given characteristic summary.
    #[must_use]
    pub fn for_device(device: &DeviceRecord, characteristic_summary: String) -> Self {
        Self {
            device_name: device
                .advertised_name
                .clone()
                .unwrap_or_else(|| device.nickname.clone()),
            advertisement: hex::encode(&device.advertisement),
            address: device.address.to_string(),
            characteristic_summary,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Command written to a tag's alarm characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlarmCommand {
    /// Start the tag's buzzer.
    Ring,
    /// Stop the tag's buzzer.
    Silence,
}

impl AlarmCommand {
    /// Wire payload for this command.
    #[must_use]
    pub const fn payload(self) -> [u8; 1] {
        match self {
            Self::Ring => [1],
            Self::Silence => [0],
        }
    }

    /// Display label once the write completes.
    #[must_use]
    pub const fn display_state(self) -> DisplayState {
        match self {
            Self::Ring => DisplayState::Ringing,
            Self::Silence => DisplayState::Ready,
        }
    }
}

/// Current network connectivity of the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// On Wi-Fi.
    Wifi,
    /// On mobile data.
    Cellular,
    /// No connectivity.
    #[default]
    Offline,
}

/// Why a connect was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// User asked for it.
    Manual,
    /// A claimed tag reappeared in a scan.
    Discovery,
    /// Automatic reconnect after a drop.
    Retry,
}

impl ConnectReason {
    /// Deliberate connects reset the reconnect budget.
    #[must_use]
    pub const fn is_deliberate(self) -> bool {
        matches!(self, Self::Manual | Self::Discovery)
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Known tags.
    #[schema(example = 3)]
    pub devices: usize,

    /// Tags with a ready link.
    #[schema(example = 2)]
    pub ready: usize,
}
