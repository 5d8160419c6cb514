//! The engine task and its handle.
//!
//! [`Engine`] owns the scanner and the connection manager and is the only
//! writer of link state. User commands, transport completions, timer expiries
//! and periodic ticks are all funneled into one `select!` loop, so each is
//! handled to completion before the next starts. Everything outside talks to
//! it through a cloneable [`EngineHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alarm::AlarmSettings;
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::error::{Result, TagError};
use crate::registry::DeviceRegistry;
use crate::scanner::Scanner;
use crate::timer::{Scheduler, TimerEvent, TimerReceiver};
use crate::transport::{EventReceiver, Transport, TransportEvent};
use crate::types::{Address, AlarmCommand, ConnectReason, DeviceRecord, NetworkMode};

const COMMAND_BUFFER: usize = 64;

/// User-editable fields of one tag. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    /// Display name.
    pub nickname: Option<String>,
    /// Sound the alarm when the link drops.
    pub alarm_on_disconnect: Option<bool>,
    /// Alert sound index.
    pub ring_index: Option<u8>,
    /// Picture reference; `Some(None)` clears it.
    pub image: Option<Option<String>>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum Command {
    Scan(Reply<bool>),
    Connect(Address, Reply<()>),
    Disconnect(Address, Reply<()>),
    Remove(Address, Reply<()>),
    Write(Address, AlarmCommand, Reply<()>),
    UpdateSettings(Address, SettingsUpdate, Reply<()>),
    GetAlarmSettings(Reply<AlarmSettings>),
    SetAlarmSettings(AlarmSettings, Reply<()>),
    SetNetworkMode(NetworkMode, Reply<()>),
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front door to a running [`Engine`].
///
/// Reads go straight to the registry. Everything that changes link state is
/// sent to the engine task and answered over a oneshot channel.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    registry: Arc<DeviceRegistry>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| TagError::EngineShutdown)?;
        rx.await.map_err(|_| TagError::EngineShutdown)?
    }

    /// The shared registry.
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Every known tag, sorted by address.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot()
    }

    /// One tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] if the tag is not known.
    pub fn device(&self, address: &Address) -> Result<DeviceRecord> {
        self.registry
            .get(address)
            .ok_or_else(|| TagError::UnknownDevice(address.clone()))
    }

    /// "Registry changed" signal.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.registry.subscribe()
    }

    /// Start a discovery sweep. `Ok(false)` means one was already running.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::EngineShutdown`] if the engine is gone.
    pub async fn scan(&self) -> Result<bool> {
        self.request(Command::Scan).await
    }

    /// Connect to a tag, refilling its reconnect budget.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] or [`TagError::EngineShutdown`].
    pub async fn connect(&self, address: Address) -> Result<()> {
        self.request(|tx| Command::Connect(address, tx)).await
    }

    /// Disconnect without reconnecting or alarming.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] or [`TagError::EngineShutdown`].
    pub async fn disconnect(&self, address: Address) -> Result<()> {
        self.request(|tx| Command::Disconnect(address, tx)).await
    }

    /// Forget a tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] or [`TagError::EngineShutdown`].
    pub async fn remove(&self, address: Address) -> Result<()> {
        self.request(|tx| Command::Remove(address, tx)).await
    }

    /// Ring or silence a ready tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is unknown, not ready or lacks a write channel.
    pub async fn write(&self, address: Address, command: AlarmCommand) -> Result<()> {
        self.request(|tx| Command::Write(address, command, tx)).await
    }

    /// Change user-editable fields of a tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`] or [`TagError::EngineShutdown`].
    pub async fn update_settings(&self, address: Address, update: SettingsUpdate) -> Result<()> {
        self.request(|tx| Command::UpdateSettings(address, update, tx))
            .await
    }

    /// Current alarm suppression settings.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::EngineShutdown`] if the engine is gone.
    pub async fn alarm_settings(&self) -> Result<AlarmSettings> {
        self.request(Command::GetAlarmSettings).await
    }

    /// Replace the alarm suppression settings.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::EngineShutdown`] if the engine is gone.
    pub async fn set_alarm_settings(&self, settings: AlarmSettings) -> Result<()> {
        self.request(|tx| Command::SetAlarmSettings(settings, tx))
            .await
    }

    /// Report the phone's network mode.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::EngineShutdown`] if the engine is gone.
    pub async fn set_network_mode(&self, mode: NetworkMode) -> Result<()> {
        self.request(|tx| Command::SetNetworkMode(mode, tx)).await
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The single task that owns every link.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    scanner: Scanner,
    connections: ConnectionManager,
    commands: mpsc::Receiver<Command>,
    events: EventReceiver,
    timers: TimerReceiver,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scanner", &self.scanner)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine and its handle. Call [`Engine::run`] to start it.
    ///
    /// `events` must be the receiver paired with the transport's sender.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn new(
        config: EngineConfig,
        registry: Arc<DeviceRegistry>,
        collaborators: Collaborators,
        events: EventReceiver,
    ) -> Result<(Self, EngineHandle)> {
        config.validate()?;

        let (scheduler, timers) = Scheduler::new();
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let transport = Arc::clone(&collaborators.transport);
        let connections = ConnectionManager::new(
            Arc::clone(&registry),
            collaborators,
            scheduler.clone(),
            &config,
        )?;

        let engine = Self {
            scanner: Scanner::new(config.scan.clone()),
            config,
            registry: Arc::clone(&registry),
            transport,
            scheduler,
            connections,
            commands,
            events,
            timers,
        };
        let handle = EngineHandle {
            commands: tx,
            registry,
        };
        Ok((engine, handle))
    }

    /// Run until every [`EngineHandle`] is dropped, then close all links.
    pub async fn run(mut self) {
        info!(
            devices = self.registry.len(),
            scan_on_start = self.config.scan.scan_on_start,
            "Tag engine started"
        );

        let mut rssi_poll = self.config.link.rssi_poll().map(ticker);
        let mut battery_poll = self.config.link.battery_poll().map(ticker);
        let mut rescan = self.config.scan.rescan_interval().map(ticker);

        if self.config.scan.scan_on_start {
            self.scanner.start_sweep(&self.registry, &self.scheduler);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(timer) = self.timers.recv() => self.handle_timer(timer),
                () = maybe_tick(&mut rssi_poll) => self.connections.poll_rssi(),
                () = maybe_tick(&mut battery_poll) => self.connections.poll_battery(),
                () = maybe_tick(&mut rescan) => {
                    self.scanner.start_sweep(&self.registry, &self.scheduler);
                }
            }
        }

        self.connections.shutdown();
        info!("Tag engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!(command = ?command, "Engine command");
        // A caller that gave up waiting is not an error.
        match command {
            Command::Scan(reply) => {
                let started = self.scanner.start_sweep(&self.registry, &self.scheduler);
                let _ = reply.send(Ok(started));
            }
            Command::Connect(address, reply) => {
                let _ = reply.send(self.connections.connect(&address, ConnectReason::Manual));
            }
            Command::Disconnect(address, reply) => {
                let _ = reply.send(self.connections.disconnect(&address));
            }
            Command::Remove(address, reply) => {
                let _ = reply.send(self.connections.remove(&address));
            }
            Command::Write(address, alarm, reply) => {
                let _ = reply.send(self.connections.write_command(&address, alarm));
            }
            Command::UpdateSettings(address, update, reply) => {
                let _ = reply.send(self.update_settings(&address, update));
            }
            Command::GetAlarmSettings(reply) => {
                let _ = reply.send(Ok(self.connections.alarm_settings().clone()));
            }
            Command::SetAlarmSettings(settings, reply) => {
                self.connections.set_alarm_settings(settings);
                let _ = reply.send(Ok(()));
            }
            Command::SetNetworkMode(mode, reply) => {
                self.connections.set_network_mode(mode);
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn update_settings(&mut self, address: &Address, update: SettingsUpdate) -> Result<()> {
        if !self.registry.contains(address) {
            return Err(TagError::UnknownDevice(address.clone()));
        }
        if let Some(nickname) = update.nickname {
            self.registry.set_nickname(address, nickname)?;
        }
        if let Some(ring_index) = update.ring_index {
            self.registry.set_ring_index(address, ring_index)?;
        }
        if let Some(image) = update.image {
            self.registry.set_image(address, image)?;
        }
        if let Some(enabled) = update.alarm_on_disconnect {
            self.connections.set_alarm_on_disconnect(address, enabled)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(advertisement) => {
                if let Some(address) = self
                    .scanner
                    .on_advertisement(&self.registry, advertisement)
                {
                    if let Err(e) = self.connections.connect(&address, ConnectReason::Discovery) {
                        warn!(address = %address, error = %e, "Connect after discovery failed");
                    }
                }
            }
            TransportEvent::Connected { address, attempt } => {
                self.connections.on_connected(&address, attempt);
            }
            TransportEvent::Disconnected {
                address,
                attempt,
                reason,
            } => self.connections.on_disconnected(&address, attempt, reason),
            TransportEvent::ServicesDiscovered {
                address,
                attempt,
                result,
            } => self
                .connections
                .on_services_discovered(&address, attempt, result),
            TransportEvent::CharacteristicRead {
                address,
                handle,
                result,
            } => self
                .connections
                .on_characteristic_read(&address, handle, result),
            TransportEvent::CharacteristicWritten {
                address,
                handle,
                result,
            } => self
                .connections
                .on_characteristic_written(&address, handle, result),
            TransportEvent::Notification {
                address,
                handle,
                value,
            } => self.connections.on_notification(&address, handle, &value),
            TransportEvent::RssiRead { address, result } => {
                self.connections.on_rssi_read(&address, result);
            }
        }
    }

    fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::ScanStart { sweep } => {
                // Failure is logged by the scanner and ends the sweep.
                let _ = self.scanner.on_scan_start(sweep, self.transport.as_ref());
            }
            TimerEvent::ScanStop { sweep } => {
                self.scanner.on_scan_stop(sweep, self.transport.as_ref());
            }
            TimerEvent::Reconnect { address } => self.connections.on_reconnect_timer(&address),
            TimerEvent::LinkTimeout {
                address,
                attempt,
                state,
            } => self.connections.on_link_timeout(&address, attempt, state),
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn maybe_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
