//! Outbound collaborators the engine notifies but never waits on.

use std::sync::Arc;

use tracing::debug;

use crate::transport::Transport;
use crate::types::{Address, VerifyRecord};

/// Everything the engine talks to outside itself.
#[derive(Clone)]
pub struct Collaborators {
    /// Radio.
    pub transport: Arc<dyn Transport>,
    /// Remote verification.
    pub verifier: Arc<dyn Verifier>,
    /// Audio.
    pub sink: Arc<dyn AlarmSink>,
}

impl Collaborators {
    /// Bundle a transport with no-op verification and audio.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            verifier: Arc::new(NoopVerifier),
            sink: Arc::new(NoopAlarmSink),
        }
    }
}

/// Remote verification of freshly configured tags.
///
/// Submission is fire-and-forget: implementations must not block the caller
/// and must swallow their own failures.
pub trait Verifier: Send + Sync {
    /// Hand over the record built when a tag reached Ready.
    fn submit(&self, record: VerifyRecord);
}

/// Audio output for alarms and tag button presses.
pub trait AlarmSink: Send + Sync {
    /// Start the lost-link alert for `address`.
    fn play_alert(&self, address: &Address);

    /// Stop whatever is playing.
    fn pause(&self);

    /// The tag's button was pressed.
    fn on_button_press(&self, address: &Address);
}

/// Verifier that drops every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

impl Verifier for NoopVerifier {
    fn submit(&self, record: VerifyRecord) {
        debug!(address = %record.address, "Verification disabled, dropping record");
    }
}

/// Sink that plays nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAlarmSink;

impl AlarmSink for NoopAlarmSink {
    fn play_alert(&self, _address: &Address) {}

    fn pause(&self) {}

    fn on_button_press(&self, _address: &Address) {}
}
