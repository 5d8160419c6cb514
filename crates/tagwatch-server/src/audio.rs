//! Alarm output as structured log events.
//!
//! The host has no speaker of its own; alerts are emitted under the
//! `tagwatch::audio` target so a journal watcher or notifier can act on them.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use tagwatch_core::{Address, AlarmSink};
use tracing::{info, warn};

/// [`AlarmSink`] that logs alerts and remembers which tags are sounding.
#[derive(Debug, Default)]
pub struct LogAlarmSink {
    playing: Mutex<BTreeSet<Address>>,
}

impl LogAlarmSink {
    /// Create a silent sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags whose alert is currently playing.
    #[must_use]
    pub fn playing(&self) -> Vec<Address> {
        self.playing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl AlarmSink for LogAlarmSink {
    fn play_alert(&self, address: &Address) {
        self.playing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone());
        warn!(target: "tagwatch::audio", address = %address, "Playing lost-tag alert");
    }

    fn pause(&self) {
        let stopped = std::mem::take(&mut *self.playing.lock().unwrap_or_else(PoisonError::into_inner));
        if !stopped.is_empty() {
            info!(target: "tagwatch::audio", count = stopped.len(), "Alert paused");
        }
    }

    fn on_button_press(&self, address: &Address) {
        info!(target: "tagwatch::audio", address = %address, "Tag button pressed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_clears_playing() {
        let sink = LogAlarmSink::new();
        let address = Address::parse("AA:BB:CC:DD:EE:01").unwrap();
        sink.play_alert(&address);
        sink.play_alert(&address);
        assert_eq!(sink.playing(), vec![address.clone()]);

        sink.on_button_press(&address);
        sink.pause();
        assert!(sink.playing().is_empty());
    }
}
