//! Time-boxed discovery sweeps.
//!
//! A sweep purges unclaimed records that hold no link, waits a short start delay, opens a scan
//! filtered to the tag service and closes it when the window elapses. Both
//! edges are timer events carrying the sweep id, so a late stop from an old
//! sweep cannot close a newer one.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

use crate::config::ScanConfig;
use crate::error::{Result, TagError};
use crate::registry::{DeviceRegistry, Upsert};
use crate::timer::{Scheduler, TimerEvent};
use crate::transport::{Advertisement, Transport};
use crate::types::{Address, ConnectionState, DeviceUpdate, DisplayState};
use crate::uuids;

static NAME_JUNK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s_-]+").expect("name pattern compiles"));
static WHITESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

/// Turn an advertised name into a nickname, falling back to the address.
#[must_use]
pub fn sanitize_name(name: Option<&str>, address: &Address) -> String {
    let cleaned = name
        .map(|n| NAME_JUNK_RE.replace_all(n, ""))
        .map(|n| WHITESPACE_RE.replace_all(n.trim(), " ").into_owned())
        .unwrap_or_default();
    if cleaned.is_empty() {
        address.to_string()
    } else {
        cleaned
    }
}

/// Discovery sweep state.
#[derive(Debug)]
pub struct Scanner {
    config: ScanConfig,
    sweep: u64,
    active: bool,
    scanning: bool,
}

impl Scanner {
    /// Create an idle scanner.
    #[must_use]
    pub const fn new(config: ScanConfig) -> Self {
        Self {
            config,
            sweep: 0,
            active: false,
            scanning: false,
        }
    }

    /// Whether a sweep is running.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Begin a sweep. Returns `false` if one is already running.
    pub fn start_sweep(&mut self, registry: &DeviceRegistry, scheduler: &Scheduler) -> bool {
        if self.active {
            debug!(sweep = self.sweep, "Sweep already running");
            return false;
        }
        self.sweep += 1;
        self.active = true;

        let purged = registry.purge_transient();
        info!(sweep = self.sweep, purged, "Starting discovery sweep");

        let start = self.config.start_delay();
        scheduler.schedule(start, TimerEvent::ScanStart { sweep: self.sweep });
        scheduler.schedule(
            start + self.config.window(),
            TimerEvent::ScanStop { sweep: self.sweep },
        );
        true
    }

    /// Start timer fired: open the radio scan.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::ScanFailed`] (or another transport error) if the
    /// radio refuses; the sweep is then over.
    pub fn on_scan_start(&mut self, sweep: u64, transport: &dyn Transport) -> Result<()> {
        if !self.active || sweep != self.sweep {
            return Ok(());
        }
        match transport.start_scan(&[uuids::SERVICE_FILTER]) {
            Ok(()) => {
                self.scanning = true;
                Ok(())
            }
            Err(e) => {
                self.active = false;
                let err = TagError::from(e);
                error!(sweep, error = %err, "Failed to open scan");
                Err(err)
            }
        }
    }

    /// Stop timer fired: close the scan. Stale or repeated stops are ignored.
    pub fn on_scan_stop(&mut self, sweep: u64, transport: &dyn Transport) {
        if !self.active || sweep != self.sweep {
            return;
        }
        self.active = false;
        if std::mem::take(&mut self.scanning) {
            if let Err(e) = transport.stop_scan() {
                debug!(sweep, error = %e, "Stopping scan failed");
            }
        }
        info!(sweep, "Discovery sweep finished");
    }

    /// Feed one advertisement into the registry.
    ///
    /// Returns the address when it belongs to a claimed, disconnected tag that
    /// should be connected now.
    pub fn on_advertisement(
        &self,
        registry: &DeviceRegistry,
        advertisement: Advertisement,
    ) -> Option<Address> {
        let Advertisement {
            address,
            name,
            rssi,
            payload,
        } = advertisement;

        if !registry.contains(&address) && registry.len() >= self.config.capacity {
            debug!(address = %address, capacity = self.config.capacity, "Registry full, ignoring device");
            return None;
        }

        let nickname = (!registry.contains(&address))
            .then(|| sanitize_name(name.as_deref(), &address));
        let outcome = registry.upsert(
            &address,
            DeviceUpdate {
                nickname,
                advertised_name: name,
                advertisement: Some(payload),
                rssi,
                last_seen: Some(Utc::now()),
                ..DeviceUpdate::default()
            },
        );

        let record = registry.get(&address)?;
        if outcome == Upsert::Created {
            registry.set_display_state(&address, DisplayState::Found);
            debug!(address = %address, nickname = %record.nickname, "New device seen");
        }

        (record.is_mine && record.connection_state == ConnectionState::Disconnected)
            .then_some(address)
    }
}
