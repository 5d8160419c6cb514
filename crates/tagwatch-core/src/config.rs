//! Engine configuration.
//!
//! Handles the tunables of the connection and alarm engine:
//! - Scan sweep timing and registry capacity
//! - Reconnect backoff
//! - Per-state link timeouts and RSSI polling
//! - Alarm suppression (Wi-Fi silence, quiet hours, timezone)
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::alarm::{AlarmSettings, QuietHours};

/// Errors raised while parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML could not be produced.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field is invalid.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Discovery sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ScanConfig {
    /// How long a sweep keeps the radio scanning.
    #[schema(example = 5)]
    pub window_secs: u64,

    /// Delay between the sweep trigger and opening the scan.
    #[schema(example = 200)]
    pub start_delay_ms: u64,

    /// Maximum number of tags in the registry.
    #[schema(example = 8)]
    pub capacity: usize,

    /// Run one sweep when the engine starts.
    pub scan_on_start: bool,

    /// Repeat sweeps on this period; 0 disables.
    pub rescan_interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_secs: 5,
            start_delay_ms: 200,
            capacity: 8,
            scan_on_start: true,
            rescan_interval_secs: 0,
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after a lost link.
    pub enabled: bool,

    /// Wait after the first failed retry; doubles per further failure.
    #[schema(example = 2000)]
    pub base_backoff_ms: u64,

    /// Upper bound on the wait.
    #[schema(example = 60000)]
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Link supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct LinkConfig {
    /// Give up on a connect after this long; 0 waits forever.
    #[schema(example = 30)]
    pub connect_timeout_secs: u64,

    /// Give up on service discovery after this long; 0 waits forever.
    #[schema(example = 30)]
    pub discovery_timeout_secs: u64,

    /// Sample RSSI on every ready link at this period; 0 disables.
    #[schema(example = 10)]
    pub rssi_poll_secs: u64,

    /// Re-read the battery level of every ready link at this period; 0 disables.
    #[schema(example = 21600)]
    pub battery_poll_secs: u64,

    /// Links held at once across all tags. Further connects wait for a slot.
    #[schema(example = 3)]
    pub max_connections: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            discovery_timeout_secs: 30,
            rssi_poll_secs: 10,
            battery_poll_secs: 6 * 60 * 60,
            max_connections: 3,
        }
    }
}

impl LinkConfig {
    /// Connect timeout, if enabled.
    #[must_use]
    pub const fn connect_timeout(&self) -> Option<Duration> {
        seconds(self.connect_timeout_secs)
    }

    /// Discovery timeout, if enabled.
    #[must_use]
    pub const fn discovery_timeout(&self) -> Option<Duration> {
        seconds(self.discovery_timeout_secs)
    }

    /// RSSI poll period, if enabled.
    #[must_use]
    pub const fn rssi_poll(&self) -> Option<Duration> {
        seconds(self.rssi_poll_secs)
    }

    /// Battery poll period, if enabled.
    #[must_use]
    pub const fn battery_poll(&self) -> Option<Duration> {
        seconds(self.battery_poll_secs)
    }
}

impl ScanConfig {
    /// Sweep length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Delay before the scan opens.
    #[must_use]
    pub const fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Rescan period, if enabled.
    #[must_use]
    pub const fn rescan_interval(&self) -> Option<Duration> {
        seconds(self.rescan_interval_secs)
    }
}

const fn seconds(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Quiet hours as local `HH:MM` strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuietHoursConfig {
    /// Window start, inclusive.
    #[schema(example = "22:00")]
    pub start: String,

    /// Window end, exclusive. Earlier than `start` wraps past midnight.
    #[schema(example = "07:00")]
    pub end: String,
}

/// Alarm suppression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct AlarmConfig {
    /// Suppress lost-link alarms while the phone is on Wi-Fi.
    pub silence_on_wifi: bool,

    /// Suppress lost-link alarms inside this window.
    pub quiet_hours: Option<QuietHoursConfig>,

    /// IANA timezone the quiet hours are expressed in.
    #[schema(example = "Europe/Berlin")]
    pub timezone: String,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            silence_on_wifi: false,
            quiet_hours: None,
            timezone: "UTC".to_string(),
        }
    }
}

impl AlarmConfig {
    /// Parse into the form the alarm policy evaluates.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed times or an unknown timezone.
    pub fn to_settings(&self) -> ConfigResult<AlarmSettings> {
        let timezone: Tz = self
            .timezone
            .parse()
            .map_err(|_| invalid("alarm.timezone", format!("unknown timezone '{}'", self.timezone)))?;

        let quiet_hours = match &self.quiet_hours {
            Some(window) => Some(QuietHours {
                start: parse_time("alarm.quiet_hours.start", &window.start)?,
                end: parse_time("alarm.quiet_hours.end", &window.end)?,
            }),
            None => None,
        };

        Ok(AlarmSettings {
            silence_on_wifi: self.silence_on_wifi,
            quiet_hours,
            timezone,
        })
    }

    /// Inverse of [`to_settings`](Self::to_settings).
    #[must_use]
    pub fn from_settings(settings: &AlarmSettings) -> Self {
        Self {
            silence_on_wifi: settings.silence_on_wifi,
            quiet_hours: settings.quiet_hours.map(|q| QuietHoursConfig {
                start: q.start.format("%H:%M").to_string(),
                end: q.end.format("%H:%M").to_string(),
            }),
            timezone: settings.timezone.name().to_string(),
        }
    }
}

fn parse_time(field: &str, value: &str) -> ConfigResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| invalid(field, format!("expected HH:MM, got '{value}'")))
}

// =============================================================================
// Root
// =============================================================================

/// All engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Discovery sweeps.
    pub scan: ScanConfig,
    /// Automatic reconnection.
    pub reconnect: ReconnectConfig,
    /// Link supervision.
    pub link: LinkConfig,
    /// Alarm suppression.
    pub alarm: AlarmConfig,
}

impl EngineConfig {
    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.scan.window_secs == 0 {
            errors.push(invalid("scan.window_secs", "must be at least 1"));
        }
        if self.scan.capacity == 0 {
            errors.push(invalid("scan.capacity", "must be at least 1"));
        }
        if self.link.max_connections == 0 {
            errors.push(invalid("link.max_connections", "must be at least 1"));
        }
        if self.reconnect.base_backoff_ms > self.reconnect.max_backoff_ms {
            errors.push(invalid(
                "reconnect.base_backoff_ms",
                "must not exceed reconnect.max_backoff_ms",
            ));
        }
        match self.alarm.to_settings() {
            Ok(_) => {}
            Err(ConfigError::MultipleValidationErrors(mut inner)) => errors.append(&mut inner),
            Err(e) => errors.push(e),
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}
