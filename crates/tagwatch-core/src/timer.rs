//! Fire-once timers that feed back into the engine loop.
//!
//! A timer is a sleeping task that posts a [`TimerEvent`] when it wakes.
//! Timers are never cancelled; every event carries enough identity (sweep id,
//! attempt id) for its handler to recognise and drop a stale one.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::types::{Address, ConnectionState};

/// Events produced by expired timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Open the radio scan for sweep `sweep`.
    ScanStart {
        /// Sweep id.
        sweep: u64,
    },
    /// Close the radio scan for sweep `sweep`.
    ScanStop {
        /// Sweep id.
        sweep: u64,
    },
    /// Backoff for a reconnect elapsed.
    Reconnect {
        /// Tag address.
        address: Address,
    },
    /// A connect or discovery step ran too long.
    LinkTimeout {
        /// Tag address.
        address: Address,
        /// Attempt id the timer was armed for.
        attempt: u64,
        /// State the link was in when the timer was armed.
        state: ConnectionState,
    },
}

/// Receiver half of the timer channel.
pub type TimerReceiver = mpsc::UnboundedReceiver<TimerEvent>;

/// Arms timers that post to the engine.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
}

impl Scheduler {
    /// Create a scheduler and the receiver its events arrive on.
    #[must_use]
    pub fn new() -> (Self, TimerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post `event` after `delay`. A zero delay posts without spawning.
    pub fn schedule(&self, delay: Duration, event: TimerEvent) {
        if delay.is_zero() {
            let _ = self.tx.send(event);
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The engine may have shut down meanwhile.
            let _ = tx.send(event);
        });
    }
}
