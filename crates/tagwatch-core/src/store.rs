//! Persistent storage for claimed tags.
//!
//! Only user-owned state is stored: transient link state (connection state,
//! alarm flag, budget, battery) is rebuilt at runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Address, DeviceRecord};

/// Errors raised by [`DeviceStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read a file.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a file.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to delete a file.
    #[error("Failed to delete {}: {source}", path.display())]
    DeleteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create the storage directory.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored file is not valid JSON.
    #[error("Failed to parse {}: {source}", path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized.
    #[error("Failed to serialize device: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// No platform data directory could be determined.
    #[error("Cannot determine data directory")]
    NoDataDir,
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The persisted subset of a [`DeviceRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Tag address.
    pub address: Address,
    /// User-visible label.
    pub nickname: String,
    /// Alarm policy flag.
    #[serde(default = "default_true")]
    pub alarm_on_disconnect: bool,
    /// Selected alert sound.
    #[serde(default)]
    pub ring_index: u8,
    /// Optional image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Last RSSI sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    /// Last time the tag was heard from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

const fn default_true() -> bool {
    true
}

impl From<&DeviceRecord> for StoredDevice {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            address: record.address.clone(),
            nickname: record.nickname.clone(),
            alarm_on_disconnect: record.alarm_on_disconnect,
            ring_index: record.ring_index,
            image: record.image.clone(),
            rssi: record.rssi,
            last_seen: record.last_seen,
        }
    }
}

impl StoredDevice {
    /// Rebuild a record at boot: claimed, disconnected, searching.
    #[must_use]
    pub fn into_record(self) -> DeviceRecord {
        let mut record = DeviceRecord::new(self.address, self.nickname);
        record.is_mine = true;
        record.alarm_on_disconnect = self.alarm_on_disconnect;
        record.ring_index = self.ring_index;
        record.image = self.image;
        record.rssi = self.rssi;
        record.last_seen = self.last_seen;
        record
    }
}

/// Persistence collaborator for claimed tags.
pub trait DeviceStore: Send + Sync {
    /// Load every stored tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn load_all(&self) -> StoreResult<Vec<StoredDevice>>;

    /// Insert or replace one tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn save(&self, device: &StoredDevice) -> StoreResult<()>;

    /// Delete one tag. Deleting an unknown tag is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be removed.
    fn delete(&self, address: &Address) -> StoreResult<()>;
}

/// Get the default data directory.
///
/// On Linux: `/var/lib/tagwatch/`
/// Elsewhere: the platform data dir from `directories`.
///
/// # Errors
///
/// Returns [`StoreError::NoDataDir`] if no home directory can be found.
pub fn default_data_dir() -> StoreResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/tagwatch"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs =
            directories::ProjectDirs::from("", "", "tagwatch").ok_or(StoreError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

/// One pretty-printed JSON file per tag under `<data_dir>/devices/`.
#[derive(Debug, Clone)]
pub struct JsonDeviceStore {
    dir: PathBuf,
}

impl JsonDeviceStore {
    /// Create a store rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("devices"),
        }
    }

    /// Directory holding the device files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, address: &Address) -> PathBuf {
        self.dir
            .join(format!("{}.json", address.as_str().replace(':', "-")))
    }
}

impl DeviceStore for JsonDeviceStore {
    fn load_all(&self) -> StoreResult<Vec<StoredDevice>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::ReadError {
            path: self.dir.clone(),
            source,
        })?;

        let mut devices = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::ReadError {
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|source| {
                StoreError::ReadError {
                    path: path.clone(),
                    source,
                }
            })?;
            match serde_json::from_str::<StoredDevice>(&content) {
                Ok(device) => devices.push(device),
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "Skipping unreadable device file");
                }
            }
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        debug!(count = devices.len(), dir = %self.dir.display(), "Loaded stored devices");
        Ok(devices)
    }

    fn save(&self, device: &StoredDevice) -> StoreResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDirError {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(&device.address);
        let content = serde_json::to_string_pretty(device)?;
        std::fs::write(&path, content).map_err(|source| StoreError::WriteError { path, source })
    }

    fn delete(&self, address: &Address) -> StoreResult<()> {
        let path = self.path_for(address);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::DeleteError { path, source }),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<Address, StoredDevice>>,
}

impl MemoryDeviceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `devices`.
    #[must_use]
    pub fn with_devices(devices: impl IntoIterator<Item = StoredDevice>) -> Self {
        let store = Self::new();
        {
            let mut map = store.devices.lock().unwrap_or_else(PoisonError::into_inner);
            for device in devices {
                map.insert(device.address.clone(), device);
            }
        }
        store
    }

    /// Fetch one stored tag.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<StoredDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn load_all(&self) -> StoreResult<Vec<StoredDevice>> {
        let mut devices: Vec<_> = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    fn save(&self, device: &StoredDevice) -> StoreResult<()> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.address.clone(), device.clone());
        Ok(())
    }

    fn delete(&self, address: &Address) -> StoreResult<()> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        Ok(())
    }
}
