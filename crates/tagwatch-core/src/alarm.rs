//! Lost-link alarm decisions.
//!
//! Rules are checked in a fixed order and the first match wins:
//!
//! 1. the tag's `alarm_on_disconnect` is off
//! 2. the phone is on Wi-Fi and Wi-Fi silence is on
//! 3. the local time is inside quiet hours
//!
//! Anything else sounds the alarm.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use utoipa::ToSchema;

use crate::types::{DeviceRecord, NetworkMode};

/// A daily local-time window `[start, end)`.
///
/// `start > end` wraps past midnight; `start == end` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    /// First quiet minute.
    pub start: NaiveTime,
    /// First loud minute after the window.
    pub end: NaiveTime,
}

impl QuietHours {
    /// Whether `time` falls inside the window.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Evaluated alarm settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmSettings {
    /// Suppress while on Wi-Fi.
    pub silence_on_wifi: bool,
    /// Suppress inside this window.
    pub quiet_hours: Option<QuietHours>,
    /// Zone the window is expressed in.
    pub timezone: Tz,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            silence_on_wifi: false,
            quiet_hours: None,
            timezone: chrono_tz::UTC,
        }
    }
}

/// Why an alarm was not raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    /// The tag's alarm-on-disconnect flag is off.
    OptedOut,
    /// The phone is on Wi-Fi and Wi-Fi silence is on.
    WifiSilence,
    /// Inside quiet hours.
    QuietHours,
}

/// Outcome of [`AlarmPolicy::should_alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmDecision {
    /// Sound the alarm.
    Alarm,
    /// Stay silent.
    Suppressed(SuppressionReason),
}

impl AlarmDecision {
    /// Whether the alarm sounds.
    #[must_use]
    pub const fn is_alarm(self) -> bool {
        matches!(self, Self::Alarm)
    }
}

/// Decides whether a lost link sounds the alarm.
#[derive(Debug, Clone, Default)]
pub struct AlarmPolicy {
    settings: AlarmSettings,
    network: NetworkMode,
}

impl AlarmPolicy {
    /// Build a policy.
    #[must_use]
    pub const fn new(settings: AlarmSettings) -> Self {
        Self {
            settings,
            network: NetworkMode::Offline,
        }
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &AlarmSettings {
        &self.settings
    }

    /// Replace the settings.
    pub fn set_settings(&mut self, settings: AlarmSettings) {
        self.settings = settings;
    }

    /// Last reported network mode.
    #[must_use]
    pub const fn network(&self) -> NetworkMode {
        self.network
    }

    /// Record the phone's current network mode.
    pub fn set_network(&mut self, network: NetworkMode) {
        self.network = network;
    }

    /// Decide for `device` at `now`.
    #[must_use]
    pub fn should_alarm(&self, device: &DeviceRecord, now: DateTime<Utc>) -> AlarmDecision {
        if !device.alarm_on_disconnect {
            return AlarmDecision::Suppressed(SuppressionReason::OptedOut);
        }
        if self.network == NetworkMode::Wifi && self.settings.silence_on_wifi {
            return AlarmDecision::Suppressed(SuppressionReason::WifiSilence);
        }
        if let Some(window) = self.settings.quiet_hours {
            let local = now.with_timezone(&self.settings.timezone).time();
            if window.contains(local) {
                return AlarmDecision::Suppressed(SuppressionReason::QuietHours);
            }
        }
        AlarmDecision::Alarm
    }
}
