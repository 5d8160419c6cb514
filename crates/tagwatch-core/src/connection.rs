//! Per-tag link state machine.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──Connected──▶ Discovering ──services──▶ Ready
//!      ▲                        │                          │                     │
//!      └────────────── Disconnected / failure / timeout ───┴─────────────────────┘
//! ```
//!
//! One [`ConnectionManager`] owns every link. It is driven by the engine task,
//! which feeds it user commands, transport completions and timer expiries one
//! at a time, so per-address state needs no locking. GATT operations on one
//! link are strictly serialized through a small queue.
//!
//! At most `link.max_connections` links are held at once. Connects beyond
//! that wait in arrival order and start as soon as a link is released.
//! Every link is opened under a fresh attempt id, and connected, disconnected
//! and discovery events for any other attempt are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::alarm::{AlarmDecision, AlarmPolicy, AlarmSettings};
use crate::collaborators::{AlarmSink, Collaborators, Verifier};
use crate::config::{EngineConfig, LinkConfig};
use crate::dispatcher::{self, CharacteristicRole};
use crate::error::{Result, TagError};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::registry::DeviceRegistry;
use crate::timer::{Scheduler, TimerEvent};
use crate::transport::{CharacteristicHandle, DiscoveredService, Transport};
use crate::types::{
    Address, AlarmCommand, ConnectReason, ConnectionState, DisplayState, NetworkMode, VerifyRecord,
};
use crate::uuids;

/// Why a write was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteIntent {
    Alert(AlarmCommand),
    DisconnectPolicy(bool),
}

/// One GATT operation waiting for or holding the link.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkOp {
    Write {
        handle: CharacteristicHandle,
        payload: Vec<u8>,
        intent: WriteIntent,
    },
    Read {
        handle: CharacteristicHandle,
    },
    ReadRssi,
}

/// Handles and queue for one open link.
#[derive(Debug)]
struct Link {
    attempt: u64,
    reason: ConnectReason,
    write_channel: Option<CharacteristicHandle>,
    alarm_control: Option<CharacteristicHandle>,
    battery: Option<CharacteristicHandle>,
    rssi_ready: bool,
    in_flight: Option<LinkOp>,
    queue: VecDeque<LinkOp>,
}

impl Link {
    const fn new(attempt: u64, reason: ConnectReason) -> Self {
        Self {
            attempt,
            reason,
            write_channel: None,
            alarm_control: None,
            battery: None,
            rssi_ready: false,
            in_flight: None,
            queue: VecDeque::new(),
        }
    }

    fn has_pending(&self, op: &LinkOp) -> bool {
        self.in_flight.as_ref() == Some(op) || self.queue.contains(op)
    }
}

/// Drives every tag through connect, discovery, ready and recovery.
pub struct ConnectionManager {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn Verifier>,
    sink: Arc<dyn AlarmSink>,
    scheduler: Scheduler,
    reconnect: ReconnectPolicy,
    alarm: AlarmPolicy,
    link_config: LinkConfig,
    links: HashMap<Address, Link>,
    waiting: VecDeque<(Address, ConnectReason)>,
    pending_retries: HashSet<Address>,
    next_attempt: u64,
    clock: fn() -> DateTime<Utc>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("links", &self.links.len())
            .field("waiting", &self.waiting.len())
            .field("pending_retries", &self.pending_retries.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager with no open links.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the alarm settings are invalid.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        collaborators: Collaborators,
        scheduler: Scheduler,
        config: &EngineConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            transport: collaborators.transport,
            verifier: collaborators.verifier,
            sink: collaborators.sink,
            scheduler,
            reconnect: ReconnectPolicy::from_config(&config.reconnect),
            alarm: AlarmPolicy::new(config.alarm.to_settings()?),
            link_config: config.link.clone(),
            links: HashMap::new(),
            waiting: VecDeque::new(),
            pending_retries: HashSet::new(),
            next_attempt: 0,
            clock: Utc::now,
        })
    }

    /// Replace the wall clock used for quiet hours.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the manager holds a link (or attempt) for `address`.
    #[must_use]
    pub fn is_linked(&self, address: &Address) -> bool {
        self.links.contains_key(address)
    }

    /// Number of links held.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Whether a connect to `address` is waiting for a free slot.
    #[must_use]
    pub fn is_waiting(&self, address: &Address) -> bool {
        self.waiting.iter().any(|(a, _)| a == address)
    }

    /// Current alarm settings.
    #[must_use]
    pub const fn alarm_settings(&self) -> &AlarmSettings {
        self.alarm.settings()
    }

    /// Replace the alarm settings.
    pub fn set_alarm_settings(&mut self, settings: AlarmSettings) {
        info!(
            silence_on_wifi = settings.silence_on_wifi,
            quiet_hours = settings.quiet_hours.is_some(),
            timezone = %settings.timezone,
            "Alarm settings updated"
        );
        self.alarm.set_settings(settings);
    }

    /// Last reported network mode.
    #[must_use]
    pub const fn network_mode(&self) -> NetworkMode {
        self.alarm.network()
    }

    /// Record the phone's network mode.
    pub fn set_network_mode(&mut self, mode: NetworkMode) {
        debug!(mode = ?mode, "Network mode changed");
        self.alarm.set_network(mode);
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Open a link to a known tag.
    ///
    /// A no-op when a link or attempt already exists or the tag is already
    /// waiting for a slot. Deliberate connects refill the reconnect budget.
    /// When every slot is taken the connect waits for one.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] if the tag is not in the registry.
    pub fn connect(&mut self, address: &Address, reason: ConnectReason) -> Result<()> {
        let record = self
            .registry
            .get(address)
            .ok_or_else(|| TagError::UnknownDevice(address.clone()))?;

        if self.links.contains_key(address) || record.is_linked() {
            debug!(address = %address, state = %record.connection_state, "Already linked, ignoring connect");
            return Ok(());
        }
        if self.is_waiting(address) {
            debug!(address = %address, "Already waiting for a connection slot");
            return Ok(());
        }

        self.pending_retries.remove(address);
        if reason.is_deliberate() {
            self.reconnect.reset(&self.registry, address);
        }

        if self.links.len() >= self.link_config.max_connections {
            info!(
                address = %address,
                reason = ?reason,
                held = self.links.len(),
                "All connection slots in use, waiting"
            );
            self.waiting.push_back((address.clone(), reason));
            return Ok(());
        }
        self.open(address, reason);
        Ok(())
    }

    fn open(&mut self, address: &Address, reason: ConnectReason) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.links.insert(address.clone(), Link::new(attempt, reason));
        self.registry
            .set_connection_state(address, ConnectionState::Connecting);
        self.registry
            .set_display_state(address, DisplayState::Connecting);
        info!(address = %address, reason = ?reason, attempt, "Connecting");

        match self.transport.connect(address, attempt) {
            Ok(()) => {
                self.arm_timeout(address, attempt, ConnectionState::Connecting);
            }
            Err(e) => {
                let err: TagError = e.into();
                self.link_down(address, Some(err.to_string()));
            }
        }
    }

    /// Drop a link on the user's request. No reconnect and no alarm follow.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] if the tag is not in the registry.
    pub fn disconnect(&mut self, address: &Address) -> Result<()> {
        let record = self
            .registry
            .get(address)
            .ok_or_else(|| TagError::UnknownDevice(address.clone()))?;
        self.pending_retries.remove(address);
        self.waiting.retain(|(a, _)| a != address);

        if self.links.remove(address).is_none() {
            return Ok(());
        }
        if let Err(e) = self.transport.disconnect(address) {
            debug!(address = %address, error = %e, "Transport disconnect failed");
        }
        self.transport.close(address);

        self.registry
            .set_connection_state(address, ConnectionState::Disconnected);
        self.registry.update(address, |r| {
            r.is_alarming = false;
            r.display_state = DisplayState::Searching;
        });
        if record.is_alarming {
            self.sink.pause();
        }
        info!(address = %address, "Disconnected on request");
        self.admit_waiting();
        Ok(())
    }

    /// Forget a tag: tear down its link and delete its record.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] if the tag is not in the registry.
    pub fn remove(&mut self, address: &Address) -> Result<()> {
        if !self.registry.contains(address) {
            return Err(TagError::UnknownDevice(address.clone()));
        }
        self.pending_retries.remove(address);
        self.waiting.retain(|(a, _)| a != address);
        self.reconnect.forget(address);
        let released = self.links.remove(address).is_some();
        if released {
            let _ = self.transport.disconnect(address);
            self.transport.close(address);
        }
        if let Some(record) = self.registry.remove(address) {
            if record.is_alarming {
                self.sink.pause();
            }
        }
        info!(address = %address, "Device forgotten");
        if released {
            self.admit_waiting();
        }
        Ok(())
    }

    /// Ring or silence a ready tag.
    ///
    /// The write is queued behind any in-flight operation. The display state
    /// follows the command once the tag acknowledges it.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`], [`TagError::DeviceNotReady`] or
    /// [`TagError::CharacteristicUnavailable`] when the write cannot be queued.
    pub fn write_command(&mut self, address: &Address, command: AlarmCommand) -> Result<()> {
        let record = self
            .registry
            .get(address)
            .ok_or_else(|| TagError::UnknownDevice(address.clone()))?;
        let not_ready = || TagError::DeviceNotReady {
            address: address.clone(),
            state: record.connection_state,
        };
        if record.connection_state != ConnectionState::Ready {
            return Err(not_ready());
        }
        let link = self.links.get_mut(address).ok_or_else(not_ready)?;
        let handle = link
            .write_channel
            .ok_or_else(|| TagError::CharacteristicUnavailable {
                address: address.clone(),
                characteristic: uuids::DEVICE_INFO,
            })?;

        link.queue.push_back(LinkOp::Write {
            handle,
            payload: command.payload().to_vec(),
            intent: WriteIntent::Alert(command),
        });
        debug!(address = %address, command = ?command, "Queued alert write");
        self.pump(address);
        Ok(())
    }

    /// Change a tag's alarm-on-disconnect flag and push it to the tag if ready.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] if the tag is not in the registry.
    pub fn set_alarm_on_disconnect(&mut self, address: &Address, enabled: bool) -> Result<()> {
        if !self.registry.set_alarm_on_disconnect(address, enabled) {
            return Err(TagError::UnknownDevice(address.clone()));
        }
        let ready = self
            .registry
            .get(address)
            .is_some_and(|r| r.connection_state == ConnectionState::Ready);
        if let Some(link) = self.links.get_mut(address) {
            if let (true, Some(handle)) = (ready, link.alarm_control) {
                link.queue.push_back(policy_write(handle, enabled));
            }
        }
        self.pump(address);
        Ok(())
    }

    /// Queue an RSSI sample on every ready, pollable link.
    pub fn poll_rssi(&mut self) {
        self.poll_ready(|link| link.rssi_ready.then_some(LinkOp::ReadRssi));
    }

    /// Queue a battery read on every ready link that exposes a battery level.
    pub fn poll_battery(&mut self) {
        self.poll_ready(|link| link.battery.map(|handle| LinkOp::Read { handle }));
    }

    /// Close every link without reconnecting.
    pub fn shutdown(&mut self) {
        for (address, _) in self.links.drain() {
            self.transport.close(&address);
            self.registry
                .set_connection_state(&address, ConnectionState::Disconnected);
        }
        self.waiting.clear();
        self.pending_retries.clear();
    }

    // =========================================================================
    // Transport completions
    // =========================================================================

    /// The link came up: start service discovery.
    pub fn on_connected(&mut self, address: &Address, attempt: u64) {
        let Some(current) = self.links.get(address).map(|l| l.attempt) else {
            debug!(address = %address, attempt, "Connected event without a link, closing");
            self.transport.close(address);
            return;
        };
        if current != attempt {
            debug!(address = %address, attempt, current, "Stale connected event ignored");
            return;
        }
        if self.state_of(address) != Some(ConnectionState::Connecting) {
            debug!(address = %address, "Duplicate connected event ignored");
            return;
        }

        self.registry
            .set_connection_state(address, ConnectionState::Discovering);
        self.registry.mark_mine(address);

        match self.transport.discover_services(address) {
            Ok(()) => self.arm_timeout(address, attempt, ConnectionState::Discovering),
            Err(e) => self.link_down(address, Some(e.to_string())),
        }
    }

    /// The link went down, or a connect attempt failed.
    pub fn on_disconnected(&mut self, address: &Address, attempt: u64, reason: Option<String>) {
        let Some(current) = self.links.get(address).map(|l| l.attempt) else {
            debug!(address = %address, attempt, "Disconnected event without a link");
            self.transport.close(address);
            return;
        };
        if current != attempt {
            debug!(address = %address, attempt, current, "Stale disconnected event ignored");
            return;
        }
        self.link_down(address, reason);
    }

    /// Service discovery finished.
    pub fn on_services_discovered(
        &mut self,
        address: &Address,
        attempt: u64,
        result: std::result::Result<Vec<DiscoveredService>, String>,
    ) {
        let current = self.links.get(address).map(|l| l.attempt);
        if current != Some(attempt)
            || self.state_of(address) != Some(ConnectionState::Discovering)
        {
            debug!(address = %address, attempt, "Stale discovery result ignored");
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                let err = TagError::DiscoveryFailed {
                    address: address.clone(),
                    reason,
                };
                warn!(address = %address, error = %err, "Service discovery failed");
                self.link_down(address, Some(err.to_string()));
                return;
            }
        };

        let Some(record) = self.registry.get(address) else {
            return;
        };
        let plan = dispatcher::plan(&services);

        if let Some(link) = self.links.get_mut(address) {
            for action in &plan.actions {
                match action.role {
                    CharacteristicRole::DeviceInfo => {
                        link.write_channel = Some(action.handle);
                        link.rssi_ready = true;
                        link.queue.push_back(LinkOp::ReadRssi);
                    }
                    CharacteristicRole::Notify => {
                        if let Err(e) = self.transport.set_notify(address, action.handle, true) {
                            warn!(address = %address, error = %e, "Failed to enable notifications");
                        }
                    }
                    CharacteristicRole::AlarmControl => {
                        link.alarm_control = Some(action.handle);
                        link.queue
                            .push_back(policy_write(action.handle, record.alarm_on_disconnect));
                    }
                    CharacteristicRole::Battery => {
                        link.battery = Some(action.handle);
                        link.queue.push_back(LinkOp::Read {
                            handle: action.handle,
                        });
                    }
                }
            }
        }

        self.registry
            .set_connection_state(address, ConnectionState::Ready);
        self.registry
            .set_display_state(address, DisplayState::Ready);
        info!(
            address = %address,
            roles = plan.actions.len(),
            unmatched = plan.unmatched,
            "Device ready"
        );

        self.verifier
            .submit(VerifyRecord::for_device(&record, plan.summary));
        self.sink.pause();
        self.pump(address);
    }

    /// A characteristic read finished.
    pub fn on_characteristic_read(
        &mut self,
        address: &Address,
        handle: CharacteristicHandle,
        result: std::result::Result<Vec<u8>, String>,
    ) {
        if self
            .complete(address, |op| matches!(op, LinkOp::Read { handle: h } if *h == handle))
            .is_none()
        {
            return;
        }

        match result {
            Ok(payload) if handle.characteristic == uuids::BATTERY_LEVEL => {
                match dispatcher::battery_from_payload(&payload) {
                    Some(level) => {
                        self.registry.update(address, |r| r.battery = Some(level));
                        debug!(address = %address, level, "Battery level read");
                    }
                    None => debug!(address = %address, "Empty battery read ignored"),
                }
            }
            Ok(_) => {}
            Err(reason) => {
                let err = TagError::ReadFailed {
                    address: address.clone(),
                    characteristic: handle.characteristic,
                    reason,
                };
                warn!(address = %address, error = %err, "Characteristic read failed");
            }
        }
        self.pump(address);
    }

    /// A characteristic write finished.
    pub fn on_characteristic_written(
        &mut self,
        address: &Address,
        handle: CharacteristicHandle,
        result: std::result::Result<(), String>,
    ) {
        let Some(LinkOp::Write { intent, .. }) = self.complete(address, |op| {
            matches!(op, LinkOp::Write { handle: h, .. } if *h == handle)
        }) else {
            return;
        };

        match (result, intent) {
            (Ok(()), WriteIntent::Alert(command)) => {
                self.registry
                    .set_display_state(address, command.display_state());
                debug!(address = %address, command = ?command, "Alert write acknowledged");
            }
            (Ok(()), WriteIntent::DisconnectPolicy(enabled)) => {
                debug!(address = %address, enabled, "Disconnect policy pushed");
            }
            (Err(reason), _) => {
                let err = TagError::WriteFailed {
                    address: address.clone(),
                    characteristic: handle.characteristic,
                    reason,
                };
                warn!(address = %address, error = %err, "Characteristic write failed");
            }
        }
        self.pump(address);
    }

    /// An RSSI read finished.
    pub fn on_rssi_read(&mut self, address: &Address, result: std::result::Result<i16, String>) {
        if self
            .complete(address, |op| matches!(op, LinkOp::ReadRssi))
            .is_none()
        {
            return;
        }
        match result {
            Ok(rssi) => {
                let now = (self.clock)();
                self.registry.update(address, |r| {
                    r.rssi = Some(rssi);
                    r.last_seen = Some(now);
                });
            }
            Err(reason) => {
                let err = TagError::ReadFailed {
                    address: address.clone(),
                    characteristic: uuid::Uuid::nil(),
                    reason,
                };
                warn!(address = %address, error = %err, "RSSI read failed");
            }
        }
        self.pump(address);
    }

    /// The tag pushed a notification.
    pub fn on_notification(&mut self, address: &Address, handle: CharacteristicHandle, value: &[u8]) {
        if !self.links.contains_key(address) || handle.characteristic != uuids::NOTIFY {
            return;
        }
        if dispatcher::is_button_press(value) {
            let now = (self.clock)();
            self.registry
                .update(address, |r| r.last_button_press = Some(now));
            info!(address = %address, "Tag button pressed");
            self.sink.on_button_press(address);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// A reconnect backoff elapsed.
    pub fn on_reconnect_timer(&mut self, address: &Address) {
        if !self.pending_retries.remove(address) {
            return;
        }
        let ready_to_retry = self.registry.get(address).is_some_and(|r| {
            r.connection_state == ConnectionState::Disconnected && r.reconnect_budget > 0
        });
        if ready_to_retry {
            let _ = self.connect(address, ConnectReason::Retry);
        }
    }

    /// A connect or discovery step may have run too long.
    pub fn on_link_timeout(&mut self, address: &Address, attempt: u64, state: ConnectionState) {
        let current = self.links.get(address).map(|l| l.attempt);
        if current != Some(attempt) || self.state_of(address) != Some(state) {
            return;
        }
        let err = TagError::LinkTimeout {
            address: address.clone(),
            state,
        };
        warn!(address = %address, error = %err, "Link step timed out");
        let _ = self.transport.disconnect(address);
        self.link_down(address, Some(err.to_string()));
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn state_of(&self, address: &Address) -> Option<ConnectionState> {
        self.registry.get(address).map(|r| r.connection_state)
    }

    /// Queue `op_for(link)` on every ready link that is not already waiting on it.
    fn poll_ready(&mut self, op_for: impl Fn(&Link) -> Option<LinkOp>) {
        let due: Vec<(Address, LinkOp)> = self
            .links
            .iter()
            .filter_map(|(address, link)| {
                let op = op_for(link)?;
                (!link.has_pending(&op)).then(|| (address.clone(), op))
            })
            .filter(|(address, _)| {
                self.registry
                    .get(address)
                    .is_some_and(|r| r.connection_state == ConnectionState::Ready)
            })
            .collect();

        for (address, op) in due {
            if let Some(link) = self.links.get_mut(&address) {
                link.queue.push_back(op);
            }
            self.pump(&address);
        }
    }

    /// Hand free slots to waiting connects, oldest first.
    fn admit_waiting(&mut self) {
        while self.links.len() < self.link_config.max_connections {
            let Some((address, reason)) = self.waiting.pop_front() else {
                return;
            };
            let idle = self.registry.get(&address).is_some_and(|r| !r.is_linked());
            if idle && !self.links.contains_key(&address) {
                debug!(address = %address, "Connection slot freed");
                self.open(&address, reason);
            }
        }
    }

    fn arm_timeout(&self, address: &Address, attempt: u64, state: ConnectionState) {
        let timeout = match state {
            ConnectionState::Connecting => self.link_config.connect_timeout(),
            ConnectionState::Discovering => self.link_config.discovery_timeout(),
            _ => None,
        };
        if let Some(delay) = timeout {
            self.scheduler.schedule(
                delay,
                TimerEvent::LinkTimeout {
                    address: address.clone(),
                    attempt,
                    state,
                },
            );
        }
    }

    /// Tear down a link that failed or dropped, then run recovery.
    fn link_down(&mut self, address: &Address, reason: Option<String>) {
        let Some(link) = self.links.remove(address) else {
            return;
        };
        self.transport.close(address);

        let Some(record) = self.registry.get(address) else {
            return;
        };
        let was_ready = record.connection_state == ConnectionState::Ready;
        let was_alarming = record.is_alarming;

        self.registry
            .set_connection_state(address, ConnectionState::Disconnected);
        self.registry.update(address, |r| {
            r.is_alarming = false;
            r.display_state = if was_ready || r.display_state == DisplayState::Lost {
                DisplayState::Lost
            } else {
                DisplayState::Searching
            };
        });

        match &reason {
            Some(reason) => {
                let err = TagError::ConnectionFailed {
                    address: address.clone(),
                    reason: reason.clone(),
                };
                warn!(address = %address, error = %err, "Link failed");
            }
            None => info!(address = %address, was_ready, "Link lost"),
        }

        self.admit_waiting();

        let retry_failed = link.reason == ConnectReason::Retry && !was_ready;
        match self
            .reconnect
            .on_disconnected(&self.registry, address, retry_failed)
        {
            ReconnectDecision::Retry { delay } if delay == Duration::ZERO => {
                let _ = self.connect(address, ConnectReason::Retry);
            }
            ReconnectDecision::Retry { delay } => {
                self.pending_retries.insert(address.clone());
                self.scheduler.schedule(
                    delay,
                    TimerEvent::Reconnect {
                        address: address.clone(),
                    },
                );
            }
            ReconnectDecision::Ignore
            | ReconnectDecision::Disabled
            | ReconnectDecision::Exhausted => {}
        }

        if was_ready || was_alarming {
            self.evaluate_alarm(address, was_ready);
        }
    }

    /// Run the alarm policy for a lost tag. Only a fresh loss plays audio.
    fn evaluate_alarm(&mut self, address: &Address, fresh_loss: bool) {
        let Some(record) = self.registry.get(address) else {
            return;
        };
        match self.alarm.should_alarm(&record, (self.clock)()) {
            AlarmDecision::Alarm => {
                self.registry.update(address, |r| r.is_alarming = true);
                if fresh_loss {
                    warn!(address = %address, nickname = %record.nickname, "Tag lost, sounding alarm");
                    self.sink.play_alert(address);
                }
            }
            AlarmDecision::Suppressed(reason) => {
                info!(address = %address, reason = ?reason, "Alarm suppressed");
            }
        }
    }

    /// Take the in-flight operation if it matches.
    fn complete(&mut self, address: &Address, expected: impl Fn(&LinkOp) -> bool) -> Option<LinkOp> {
        let link = self.links.get_mut(address)?;
        if link.in_flight.as_ref().is_some_and(&expected) {
            link.in_flight.take()
        } else {
            debug!(address = %address, "Unexpected completion ignored");
            None
        }
    }

    /// Start the next queued operation if the link is idle.
    fn pump(&mut self, address: &Address) {
        let Some(link) = self.links.get_mut(address) else {
            return;
        };
        if link.in_flight.is_some() {
            return;
        }
        while let Some(op) = link.queue.pop_front() {
            let started = match &op {
                LinkOp::Write {
                    handle, payload, ..
                } => self
                    .transport
                    .write_characteristic(address, *handle, payload.clone()),
                LinkOp::Read { handle } => self.transport.read_characteristic(address, *handle),
                LinkOp::ReadRssi => self.transport.read_rssi(address),
            };
            match started {
                Ok(()) => {
                    link.in_flight = Some(op);
                    return;
                }
                Err(e) => warn!(address = %address, error = %e, op = ?op, "GATT operation not started"),
            }
        }
    }
}

fn policy_write(handle: CharacteristicHandle, enabled: bool) -> LinkOp {
    LinkOp::Write {
        handle,
        payload: vec![u8::from(enabled)],
        intent: WriteIntent::DisconnectPolicy(enabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{standard_tag_services, MockTransport, RecordingAlarmSink, RecordingVerifier, SinkCall, TransportCall};
    use crate::store::MemoryDeviceStore;
    use crate::timer::TimerReceiver;
    use crate::types::DeviceUpdate;
    use uuid::Uuid;

    struct Harness {
        manager: ConnectionManager,
        registry: Arc<DeviceRegistry>,
        transport: Arc<MockTransport>,
        verifier: Arc<RecordingVerifier>,
        sink: Arc<RecordingAlarmSink>,
        timers: TimerReceiver,
    }

    fn addr(last: u8) -> Address {
        Address::parse(&format!("AA:BB:CC:DD:EE:{last:02X}")).unwrap()
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let registry = Arc::new(DeviceRegistry::new(Arc::new(MemoryDeviceStore::new())));
        let transport = Arc::new(MockTransport::new());
        let verifier = Arc::new(RecordingVerifier::new());
        let sink = Arc::new(RecordingAlarmSink::new());
        let (scheduler, timers) = Scheduler::new();
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Collaborators {
                transport: transport.clone(),
                verifier: verifier.clone(),
                sink: sink.clone(),
            },
            scheduler,
            &config,
        )
        .unwrap();
        registry.upsert(&addr(1), DeviceUpdate::default());
        Harness {
            manager,
            registry,
            transport,
            verifier,
            sink,
            timers,
        }
    }

    fn state(h: &Harness) -> ConnectionState {
        h.registry.get(&addr(1)).unwrap().connection_state
    }

    /// Attempt id of the latest connect to tag 1.
    fn attempt(transport: &MockTransport) -> u64 {
        transport.last_attempt(&addr(1)).unwrap()
    }

    /// Connect, come up and finish discovery, then drain the startup GATT queue.
    fn bring_ready(h: &mut Harness) {
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Ok(standard_tag_services()));
        h.manager.on_rssi_read(&addr(1), Ok(-55));
        let control = h.transport.writes(&addr(1))[0].0;
        h.manager
            .on_characteristic_written(&addr(1), control, Ok(()));
        h.manager
            .on_characteristic_read(&addr(1), battery_handle(), Ok(vec![77]));
    }

    fn battery_handle() -> CharacteristicHandle {
        CharacteristicHandle {
            service: Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb),
            characteristic: uuids::BATTERY_LEVEL,
        }
    }

    fn write_channel() -> CharacteristicHandle {
        CharacteristicHandle {
            service: Uuid::from_u128(0x0000_1802_0000_1000_8000_0080_5f9b_34fb),
            characteristic: uuids::DEVICE_INFO,
        }
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let mut h = harness();
        let err = h.manager.connect(&addr(9), ConnectReason::Manual).unwrap_err();
        assert!(matches!(err, TagError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn test_at_most_one_link() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager.connect(&addr(1), ConnectReason::Discovery).unwrap();
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Ok(standard_tag_services()));
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();

        assert_eq!(state(&h), ConnectionState::Ready);
        assert_eq!(h.transport.connect_count(&addr(1)), 1);
        assert_eq!(h.transport.duplicate_sessions(), 0);
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let mut h = harness();
        bring_ready(&mut h);

        let record = h.registry.get(&addr(1)).unwrap();
        assert_eq!(record.connection_state, ConnectionState::Ready);
        assert_eq!(record.display_state, DisplayState::Ready);
        assert!(record.is_mine);
        assert_eq!(record.battery, Some(77));
        assert_eq!(record.rssi, Some(-55));

        let verified = h.verifier.records();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].address, "AA:BB:CC:DD:EE:01");
        assert_eq!(verified[0].characteristic_summary.matches(';').count(), 4);
        assert!(h.sink.calls().contains(&SinkCall::Pause));
    }

    #[tokio::test]
    async fn test_discovery_wires_characteristics_in_order() {
        let mut h = harness();
        bring_ready(&mut h);

        let calls = h.transport.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            TransportCall::SetNotify { handle, enabled: true, .. } if handle.characteristic == uuids::NOTIFY
        )));
        // Alarm-on-disconnect defaults to on, so the tag is told [1].
        let writes = h.transport.writes(&addr(1));
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0.characteristic, uuids::ALARM_CONTROL);
        assert_eq!(writes[0].1, vec![1]);
    }

    #[tokio::test]
    async fn test_gatt_operations_are_serialized() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Ok(standard_tag_services()));

        // RSSI read is in flight; the policy write and battery read wait.
        let pending = |h: &Harness| {
            h.transport
                .calls()
                .iter()
                .filter(|c| {
                    matches!(
                        c,
                        TransportCall::ReadRssi(_) | TransportCall::Write { .. } | TransportCall::Read { .. }
                    )
                })
                .count()
        };
        assert_eq!(pending(&h), 1);
        h.manager.write_command(&addr(1), AlarmCommand::Ring).unwrap();
        assert_eq!(pending(&h), 1);

        h.manager.on_rssi_read(&addr(1), Ok(-50));
        assert_eq!(pending(&h), 2);
    }

    #[tokio::test]
    async fn test_battery_read_empty_payload_keeps_value() {
        let mut h = harness();
        h.registry.update(&addr(1), |r| r.battery = Some(40));
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Ok(standard_tag_services()));
        h.manager.on_rssi_read(&addr(1), Ok(-55));
        h.manager
            .on_characteristic_written(&addr(1), h.transport.writes(&addr(1))[0].0, Ok(()));

        h.manager
            .on_characteristic_read(&addr(1), battery_handle(), Ok(Vec::new()));
        assert_eq!(h.registry.get(&addr(1)).unwrap().battery, Some(40));
    }

    #[tokio::test]
    async fn test_write_command_requires_ready() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        let err = h
            .manager
            .write_command(&addr(1), AlarmCommand::Ring)
            .unwrap_err();
        assert!(matches!(err, TagError::DeviceNotReady { .. }));
    }

    #[tokio::test]
    async fn test_ring_and_silence_update_display_on_completion() {
        let mut h = harness();
        bring_ready(&mut h);

        h.manager.write_command(&addr(1), AlarmCommand::Ring).unwrap();
        assert_eq!(h.registry.get(&addr(1)).unwrap().display_state, DisplayState::Ready);
        h.manager.write_command(&addr(1), AlarmCommand::Silence).unwrap();

        h.manager
            .on_characteristic_written(&addr(1), write_channel(), Ok(()));
        assert_eq!(h.registry.get(&addr(1)).unwrap().display_state, DisplayState::Ringing);

        h.manager
            .on_characteristic_written(&addr(1), write_channel(), Ok(()));
        assert_eq!(h.registry.get(&addr(1)).unwrap().display_state, DisplayState::Ready);

        let payloads: Vec<_> = h
            .transport
            .writes(&addr(1))
            .into_iter()
            .filter(|(handle, _)| handle.characteristic == uuids::DEVICE_INFO)
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(payloads, vec![vec![1], vec![0]]);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_label() {
        let mut h = harness();
        bring_ready(&mut h);
        h.manager.write_command(&addr(1), AlarmCommand::Ring).unwrap();
        h.manager
            .on_characteristic_written(&addr(1), write_channel(), Err("rejected".into()));
        assert_eq!(h.registry.get(&addr(1)).unwrap().display_state, DisplayState::Ready);
    }

    #[tokio::test]
    async fn test_stale_link_events_are_ignored() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.on_connected(&addr(1), 1);
        h.manager
            .on_link_timeout(&addr(1), 1, ConnectionState::Discovering);

        // The timed-out session was replaced by an immediate retry.
        assert_eq!(attempt(&h.transport), 2);
        assert_eq!(state(&h), ConnectionState::Connecting);

        // Late events from the first session must not touch the retry.
        h.manager
            .on_disconnected(&addr(1), 1, Some("disconnect failed".into()));
        h.manager.on_connected(&addr(1), 1);
        h.manager
            .on_services_discovered(&addr(1), 1, Ok(standard_tag_services()));
        assert_eq!(state(&h), ConnectionState::Connecting);
        assert!(h.manager.is_linked(&addr(1)));
        assert_eq!(h.registry.get(&addr(1)).unwrap().reconnect_budget, 5);
        assert_eq!(h.transport.connect_count(&addr(1)), 2);

        h.manager.on_connected(&addr(1), 2);
        h.manager
            .on_services_discovered(&addr(1), 2, Ok(standard_tag_services()));
        assert_eq!(state(&h), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_sweep_while_connecting_keeps_link() {
        let mut h = harness();
        assert!(!h.registry.get(&addr(1)).unwrap().is_mine);
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();

        let (scheduler, _timers) = Scheduler::new();
        let mut scanner = crate::scanner::Scanner::new(crate::config::ScanConfig::default());
        assert!(scanner.start_sweep(&h.registry, &scheduler));

        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Ok(standard_tag_services()));
        let record = h.registry.get(&addr(1)).unwrap();
        assert_eq!(record.connection_state, ConnectionState::Ready);
        assert!(record.is_mine);
        assert!(h.transport.has_session(&addr(1)));
    }

    #[tokio::test]
    async fn test_link_loss_alarms_and_retries_immediately() {
        let mut h = harness();
        bring_ready(&mut h);

        h.manager.on_disconnected(&addr(1), attempt(&h.transport), None);

        let record = h.registry.get(&addr(1)).unwrap();
        assert!(record.is_alarming);
        assert_eq!(record.display_state, DisplayState::Lost);
        assert_eq!(record.connection_state, ConnectionState::Connecting);
        assert_eq!(record.reconnect_budget, 5);
        assert_eq!(h.transport.connect_count(&addr(1)), 2);
        assert_eq!(h.sink.alerts_for(&addr(1)), 1);
    }

    #[tokio::test]
    async fn test_ready_resets_alarm() {
        let mut h = harness();
        bring_ready(&mut h);
        h.manager.on_disconnected(&addr(1), attempt(&h.transport), None);
        assert!(h.registry.get(&addr(1)).unwrap().is_alarming);

        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Ok(standard_tag_services()));

        let record = h.registry.get(&addr(1)).unwrap();
        assert!(!record.is_alarming);
        assert_eq!(record.display_state, DisplayState::Ready);
        assert_eq!(h.sink.calls().last(), Some(&SinkCall::Pause));
    }

    #[tokio::test]
    async fn test_opted_out_tag_does_not_alarm() {
        let mut h = harness();
        h.registry.set_alarm_on_disconnect(&addr(1), false);
        bring_ready(&mut h);

        h.manager.on_disconnected(&addr(1), attempt(&h.transport), None);
        assert!(!h.registry.get(&addr(1)).unwrap().is_alarming);
        assert_eq!(h.sink.alerts_for(&addr(1)), 0);
    }

    #[tokio::test]
    async fn test_wifi_silence_suppresses_alarm() {
        let mut config = EngineConfig::default();
        config.alarm.silence_on_wifi = true;
        let mut h = harness_with(config);
        h.manager.set_network_mode(NetworkMode::Wifi);
        bring_ready(&mut h);

        h.manager.on_disconnected(&addr(1), attempt(&h.transport), None);
        assert!(!h.registry.get(&addr(1)).unwrap().is_alarming);
        assert_eq!(h.sink.alerts_for(&addr(1)), 0);
    }

    #[tokio::test]
    async fn test_budget_spent_only_by_failed_retries() {
        let mut h = harness();
        bring_ready(&mut h);
        h.manager.on_disconnected(&addr(1), attempt(&h.transport), None);

        for expected in (0..5_u8).rev() {
            // The retry in flight fails.
            h.manager
                .on_disconnected(&addr(1), attempt(&h.transport), Some("connection refused".into()));
            let record = h.registry.get(&addr(1)).unwrap();
            assert_eq!(record.reconnect_budget, expected);
            assert_eq!(record.connection_state, ConnectionState::Disconnected);
            // The alarm keeps sounding while the tag stays lost.
            assert!(record.is_alarming);
            h.manager.on_reconnect_timer(&addr(1));
        }

        // Immediate retry plus four backed-off retries.
        assert_eq!(h.transport.connect_count(&addr(1)), 6);
        assert!(!h.manager.is_linked(&addr(1)));
        assert_eq!(h.sink.alerts_for(&addr(1)), 1);

        h.manager.on_reconnect_timer(&addr(1));
        assert_eq!(h.transport.connect_count(&addr(1)), 6);

        // A manual connect refills the budget.
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        assert_eq!(h.registry.get(&addr(1)).unwrap().reconnect_budget, 5);
    }

    #[tokio::test]
    async fn test_discovery_failure_takes_reconnect_path() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.on_connected(&addr(1), attempt(&h.transport));
        h.manager
            .on_services_discovered(&addr(1), attempt(&h.transport), Err("gatt error".into()));

        // Not a retry yet, so the first retry is immediate and free.
        assert_eq!(state(&h), ConnectionState::Connecting);
        assert_eq!(h.transport.connect_count(&addr(1)), 2);
        assert_eq!(h.registry.get(&addr(1)).unwrap().reconnect_budget, 5);
        assert!(!h.registry.get(&addr(1)).unwrap().is_alarming);
        assert!(h.transport.calls().contains(&TransportCall::Close(addr(1))));
    }

    #[tokio::test]
    async fn test_explicit_disconnect_has_no_side_effects() {
        let mut h = harness();
        bring_ready(&mut h);

        h.manager.disconnect(&addr(1)).unwrap();
        // The transport echoes a disconnected event, which is now stale.
        h.manager.on_disconnected(&addr(1), attempt(&h.transport), None);

        assert_eq!(state(&h), ConnectionState::Disconnected);
        assert_eq!(h.transport.connect_count(&addr(1)), 1);
        assert_eq!(h.sink.alerts_for(&addr(1)), 0);
        assert!(!h.transport.has_session(&addr(1)));
    }

    #[tokio::test]
    async fn test_remove_tears_down_link() {
        let mut h = harness();
        bring_ready(&mut h);

        h.manager.remove(&addr(1)).unwrap();
        assert!(h.registry.get(&addr(1)).is_none());
        assert!(!h.manager.is_linked(&addr(1)));
        assert!(!h.transport.has_session(&addr(1)));
        assert!(matches!(
            h.manager.remove(&addr(1)),
            Err(TagError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_matches_attempt_and_state() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();

        // Wrong attempt and wrong stage are ignored.
        h.manager
            .on_link_timeout(&addr(1), 99, ConnectionState::Connecting);
        h.manager
            .on_link_timeout(&addr(1), 1, ConnectionState::Discovering);
        assert_eq!(state(&h), ConnectionState::Connecting);
        assert_eq!(h.transport.connect_count(&addr(1)), 1);

        h.manager
            .on_link_timeout(&addr(1), 1, ConnectionState::Connecting);
        // Timed out, then retried immediately under a new attempt.
        assert_eq!(h.transport.connect_count(&addr(1)), 2);
        h.manager
            .on_link_timeout(&addr(1), 1, ConnectionState::Connecting);
        assert_eq!(h.transport.connect_count(&addr(1)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_arms_timeout_timer() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(
            h.timers.try_recv().unwrap(),
            TimerEvent::LinkTimeout {
                address: addr(1),
                attempt: 1,
                state: ConnectionState::Connecting,
            }
        );
    }

    #[tokio::test]
    async fn test_button_press_notification() {
        let mut h = harness();
        bring_ready(&mut h);
        let notify = CharacteristicHandle {
            service: uuids::SERVICE_FILTER,
            characteristic: uuids::NOTIFY,
        };

        h.manager.on_notification(&addr(1), notify, &[0]);
        assert!(h.registry.get(&addr(1)).unwrap().last_button_press.is_none());

        h.manager.on_notification(&addr(1), notify, &[1]);
        assert!(h.registry.get(&addr(1)).unwrap().last_button_press.is_some());
        assert!(h.sink.calls().contains(&SinkCall::ButtonPress(addr(1))));
    }

    #[tokio::test]
    async fn test_alarm_flag_pushed_to_ready_tag() {
        let mut h = harness();
        bring_ready(&mut h);

        h.manager.set_alarm_on_disconnect(&addr(1), false).unwrap();
        let writes = h.transport.writes(&addr(1));
        let last = writes.last().unwrap();
        assert_eq!(last.0.characteristic, uuids::ALARM_CONTROL);
        assert_eq!(last.1, vec![0]);
        assert!(!h.registry.get(&addr(1)).unwrap().alarm_on_disconnect);
    }

    #[tokio::test]
    async fn test_poll_battery_rereads_level() {
        let mut h = harness();
        bring_ready(&mut h);
        h.transport.clear_calls();

        h.manager.poll_battery();
        h.manager.poll_battery();
        let reads = |h: &Harness| {
            h.transport
                .calls()
                .iter()
                .filter(|c| matches!(c, TransportCall::Read { handle, .. } if *handle == battery_handle()))
                .count()
        };
        assert_eq!(reads(&h), 1);

        h.manager
            .on_characteristic_read(&addr(1), battery_handle(), Ok(vec![31]));
        assert_eq!(h.registry.get(&addr(1)).unwrap().battery, Some(31));
        h.manager.poll_battery();
        assert_eq!(reads(&h), 2);
    }

    #[tokio::test]
    async fn test_poll_battery_skips_links_not_ready() {
        let mut h = harness();
        h.manager.connect(&addr(1), ConnectReason::Manual).unwrap();
        h.manager.poll_battery();
        assert!(!h
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Read { .. })));
    }

    #[tokio::test]
    async fn test_connects_beyond_cap_wait_for_a_slot() {
        let mut config = EngineConfig::default();
        config.link.max_connections = 2;
        let mut h = harness_with(config);
        for i in 2..=4 {
            h.registry.upsert(&addr(i), DeviceUpdate::default());
        }

        for i in 1..=4 {
            h.manager.connect(&addr(i), ConnectReason::Manual).unwrap();
        }
        assert_eq!(h.manager.link_count(), 2);
        assert!(h.manager.is_waiting(&addr(3)));
        assert!(h.manager.is_waiting(&addr(4)));
        assert_eq!(h.transport.connect_count(&addr(3)), 0);
        assert_eq!(h.registry.get(&addr(3)).unwrap().connection_state, ConnectionState::Disconnected);

        // Asking again does not queue twice.
        h.manager.connect(&addr(3), ConnectReason::Manual).unwrap();

        // Removing a waiting tag drops it from the queue.
        h.manager.remove(&addr(4)).unwrap();
        assert!(!h.manager.is_waiting(&addr(4)));

        h.manager.disconnect(&addr(2)).unwrap();
        assert_eq!(h.manager.link_count(), 2);
        assert!(!h.manager.is_waiting(&addr(3)));
        assert_eq!(h.transport.connect_count(&addr(3)), 1);
        assert_eq!(h.registry.get(&addr(3)).unwrap().connection_state, ConnectionState::Connecting);
        assert_eq!(h.transport.connect_count(&addr(4)), 0);
    }

    #[tokio::test]
    async fn test_waiting_tag_gets_slot_before_lost_tag_retries() {
        let mut config = EngineConfig::default();
        config.link.max_connections = 1;
        let mut h = harness_with(config);
        h.registry.upsert(&addr(2), DeviceUpdate::default());
        bring_ready(&mut h);
        h.manager.connect(&addr(2), ConnectReason::Manual).unwrap();
        assert!(h.manager.is_waiting(&addr(2)));

        h.manager
            .on_disconnected(&addr(1), attempt(&h.transport), None);
        assert_eq!(h.transport.connect_count(&addr(2)), 1);
        assert!(h.manager.is_waiting(&addr(1)));
        assert_eq!(h.transport.connect_count(&addr(1)), 1);
        assert!(h.registry.get(&addr(1)).unwrap().is_alarming);
    }

    #[tokio::test]
    async fn test_poll_rssi_skips_busy_links() {
        let mut h = harness();
        bring_ready(&mut h);
        h.transport.clear_calls();

        h.manager.poll_rssi();
        h.manager.poll_rssi();
        let reads = h
            .transport
            .calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::ReadRssi(_)))
            .count();
        assert_eq!(reads, 1);
    }
}
