//! The authoritative table of known tags.
//!
//! Every mutation goes through [`DeviceRegistry`]; readers get cloned
//! snapshots. Each effective change bumps a revision counter on a
//! [`watch`] channel, which is the "registry changed, please redraw" signal
//! for any UI. Changes to user-owned fields of claimed tags are written
//! through to the [`DeviceStore`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{DeviceStore, StoredDevice};
use crate::types::{Address, ConnectionState, DeviceRecord, DeviceUpdate, DisplayState};

/// Outcome of [`DeviceRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new record was created.
    Created,
    /// An existing record changed.
    Updated,
    /// Nothing changed.
    Unchanged,
}

impl Upsert {
    /// Whether the call changed the table.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// In-memory device table with persistence write-through.
pub struct DeviceRegistry {
    records: RwLock<HashMap<Address, DeviceRecord>>,
    store: Arc<dyn DeviceStore>,
    changes: watch::Sender<u64>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("len", &self.len())
            .field("revision", &*self.changes.borrow())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Create an empty registry backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            records: RwLock::new(HashMap::new()),
            store,
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Address, DeviceRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Address, DeviceRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|revision| *revision += 1);
    }

    fn persist(&self, record: &DeviceRecord) {
        if let Err(e) = self.store.save(&StoredDevice::from(record)) {
            warn!(address = %record.address, error = %e, "Failed to persist device");
        }
    }

    /// Populate the table from the store at boot.
    ///
    /// Every stored tag comes back claimed, disconnected and searching with a
    /// full reconnect budget. Returns the number of tags loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load_from_store(&self) -> Result<usize> {
        let stored = self.store.load_all()?;
        let count = stored.len();
        {
            let mut records = self.write();
            for device in stored {
                records.insert(device.address.clone(), device.into_record());
            }
        }
        if count > 0 {
            self.notify();
        }
        info!(count, "Loaded claimed tags");
        Ok(count)
    }

    /// Create or merge a record.
    ///
    /// A new record starts disconnected with a full reconnect budget and the
    /// address as nickname unless the update supplies one. An existing record
    /// only takes the fields the update sets. Unchanged upserts do not notify.
    pub fn upsert(&self, address: &Address, update: DeviceUpdate) -> Upsert {
        let (outcome, to_persist) = {
            let mut records = self.write();
            match records.get_mut(address) {
                Some(record) => {
                    let before = StoredDevice::from(&*record);
                    let was_mine = record.is_mine;
                    if update.apply(record) {
                        let persist = record.is_mine
                            && (!was_mine || StoredDevice::from(&*record) != before);
                        (Upsert::Updated, persist.then(|| record.clone()))
                    } else {
                        (Upsert::Unchanged, None)
                    }
                }
                None => {
                    let mut record = DeviceRecord::new(address.clone(), address.as_str());
                    update.apply(&mut record);
                    let persist = record.is_mine.then(|| record.clone());
                    records.insert(address.clone(), record);
                    (Upsert::Created, persist)
                }
            }
        };

        if let Some(record) = to_persist {
            self.persist(&record);
        }
        if outcome.changed() {
            self.notify();
        }
        outcome
    }

    /// Clone of one record.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<DeviceRecord> {
        self.read().get(address).cloned()
    }

    /// Whether `address` is known.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.read().contains_key(address)
    }

    /// Number of known tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no tags are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Clones of every record, sorted by address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    /// Visit every claimed tag.
    ///
    /// The callback sees a snapshot, so it may call back into the registry.
    pub fn for_each_mine(&self, mut f: impl FnMut(&DeviceRecord)) {
        for record in self.snapshot().iter().filter(|r| r.is_mine) {
            f(record);
        }
    }

    /// Delete a record and its stored copy. Unknown addresses are a no-op.
    pub fn remove(&self, address: &Address) -> Option<DeviceRecord> {
        let removed = self.write().remove(address)?;
        if removed.is_mine {
            if let Err(e) = self.store.delete(address) {
                warn!(address = %address, error = %e, "Failed to delete stored device");
            }
        }
        self.notify();
        debug!(address = %address, "Device removed");
        Some(removed)
    }

    /// Drop every unclaimed record that has no link in progress. Returns how
    /// many were dropped.
    pub fn purge_transient(&self) -> usize {
        let purged = {
            let mut records = self.write();
            let before = records.len();
            records.retain(|_, r| r.is_mine || r.is_linked());
            before - records.len()
        };
        if purged > 0 {
            self.notify();
            debug!(purged, "Purged transient devices");
        }
        purged
    }

    /// Subscribe to the change signal. The value is a revision counter.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Rename a tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`](crate::error::TagError::UnknownDevice)
    /// if the address is not known.
    pub fn set_nickname(&self, address: &Address, nickname: impl Into<String>) -> Result<()> {
        let nickname = nickname.into();
        self.require(address, |r| r.nickname = nickname)
    }

    /// Choose the alert sound for a tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`](crate::error::TagError::UnknownDevice)
    /// if the address is not known.
    pub fn set_ring_index(&self, address: &Address, ring_index: u8) -> Result<()> {
        self.require(address, |r| r.ring_index = ring_index)
    }

    /// Set or clear a tag's image reference.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::UnknownDevice`](crate::error::TagError::UnknownDevice)
    /// if the address is not known.
    pub fn set_image(&self, address: &Address, image: Option<String>) -> Result<()> {
        self.require(address, |r| r.image = image)
    }

    fn require(&self, address: &Address, f: impl FnOnce(&mut DeviceRecord)) -> Result<()> {
        self.update(address, f)
            .ok_or_else(|| crate::error::TagError::UnknownDevice(address.clone()))
    }

    // =========================================================================
    // Engine-only mutation
    // =========================================================================

    /// Mutate one record in place.
    ///
    /// Notifies on any change and writes through when a claimed tag's stored
    /// fields changed (or it just became claimed). Returns `None` for unknown
    /// addresses.
    pub(crate) fn update<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&mut DeviceRecord) -> R,
    ) -> Option<R> {
        let (result, changed, to_persist) = {
            let mut records = self.write();
            let record = records.get_mut(address)?;
            let before = record.clone();
            let result = f(record);
            let changed = *record != before;
            let persist = changed
                && record.is_mine
                && (!before.is_mine || StoredDevice::from(&*record) != StoredDevice::from(&before));
            (result, changed, persist.then(|| record.clone()))
        };

        if let Some(record) = to_persist {
            self.persist(&record);
        }
        if changed {
            self.notify();
        }
        Some(result)
    }

    /// Move a tag's link state. Only the connection manager calls this.
    pub(crate) fn set_connection_state(&self, address: &Address, state: ConnectionState) -> bool {
        self.update(address, |r| {
            if r.connection_state != state {
                debug!(address = %address, from = %r.connection_state, to = %state, "Connection state change");
            }
            r.connection_state = state;
            if state == ConnectionState::Ready {
                r.is_alarming = false;
            }
        })
        .is_some()
    }

    pub(crate) fn set_display_state(&self, address: &Address, state: DisplayState) {
        self.update(address, |r| r.display_state = state);
    }

    pub(crate) fn set_alarm_on_disconnect(&self, address: &Address, enabled: bool) -> bool {
        self.update(address, |r| r.alarm_on_disconnect = enabled)
            .is_some()
    }

    pub(crate) fn mark_mine(&self, address: &Address) {
        self.update(address, |r| r.is_mine = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDeviceStore;

    fn addr(last: u8) -> Address {
        Address::parse(&format!("AA:BB:CC:DD:EE:{last:02X}")).unwrap()
    }

    fn registry() -> (DeviceRegistry, Arc<MemoryDeviceStore>) {
        let store = Arc::new(MemoryDeviceStore::new());
        (DeviceRegistry::new(store.clone()), store)
    }

    #[test]
    fn test_upsert_creates_with_defaults() {
        let (registry, _) = registry();
        assert_eq!(registry.upsert(&addr(1), DeviceUpdate::default()), Upsert::Created);

        let record = registry.get(&addr(1)).unwrap();
        assert_eq!(record.reconnect_budget, 5);
        assert_eq!(record.connection_state, ConnectionState::Disconnected);
        assert_eq!(record.nickname, "AA:BB:CC:DD:EE:01");
        assert!(!record.is_mine);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (registry, _) = registry();
        let update = DeviceUpdate {
            nickname: Some("Keys".into()),
            rssi: Some(-50),
            ..DeviceUpdate::default()
        };
        registry.upsert(&addr(1), update.clone());
        let first = registry.get(&addr(1)).unwrap();
        let revision = registry.revision();

        assert_eq!(registry.upsert(&addr(1), update), Upsert::Unchanged);
        assert_eq!(registry.get(&addr(1)).unwrap(), first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.revision(), revision);
    }

    #[test]
    fn test_upsert_merges_only_set_fields() {
        let (registry, _) = registry();
        registry.upsert(
            &addr(1),
            DeviceUpdate {
                nickname: Some("Keys".into()),
                ..DeviceUpdate::default()
            },
        );
        let outcome = registry.upsert(
            &addr(1),
            DeviceUpdate {
                rssi: Some(-42),
                ..DeviceUpdate::default()
            },
        );
        assert_eq!(outcome, Upsert::Updated);
        let record = registry.get(&addr(1)).unwrap();
        assert_eq!(record.nickname, "Keys");
        assert_eq!(record.rssi, Some(-42));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let (registry, _) = registry();
        let revision = registry.revision();
        assert!(registry.remove(&addr(9)).is_none());
        assert_eq!(registry.revision(), revision);
    }

    #[test]
    fn test_remove_deletes_stored_copy() {
        let (registry, store) = registry();
        registry.upsert(&addr(1), DeviceUpdate::default());
        registry.mark_mine(&addr(1));
        assert!(store.get(&addr(1)).is_some());

        registry.remove(&addr(1));
        assert!(store.get(&addr(1)).is_none());
        assert!(!registry.contains(&addr(1)));
    }

    #[test]
    fn test_purge_transient_keeps_mine() {
        let (registry, _) = registry();
        registry.upsert(&addr(1), DeviceUpdate::default());
        registry.upsert(&addr(2), DeviceUpdate::default());
        registry.mark_mine(&addr(2));

        assert_eq!(registry.purge_transient(), 1);
        assert!(registry.contains(&addr(2)));
        assert!(!registry.contains(&addr(1)));
    }

    #[test]
    fn test_purge_transient_keeps_linking_records() {
        let (registry, _) = registry();
        registry.upsert(&addr(1), DeviceUpdate::default());
        registry.upsert(&addr(2), DeviceUpdate::default());
        registry.set_connection_state(&addr(1), ConnectionState::Connecting);

        assert_eq!(registry.purge_transient(), 1);
        assert!(registry.contains(&addr(1)));
        assert!(!registry.contains(&addr(2)));
    }

    #[test]
    fn test_for_each_mine_visits_claimed_only() {
        let (registry, _) = registry();
        for i in 1..=3 {
            registry.upsert(&addr(i), DeviceUpdate::default());
        }
        registry.mark_mine(&addr(1));
        registry.mark_mine(&addr(3));

        let mut seen = Vec::new();
        registry.for_each_mine(|r| seen.push(r.address.clone()));
        assert_eq!(seen, vec![addr(1), addr(3)]);
    }

    #[test]
    fn test_write_through_only_for_mine() {
        let (registry, store) = registry();
        registry.upsert(&addr(1), DeviceUpdate::default());
        registry.set_nickname(&addr(1), "Keys").unwrap();
        assert!(store.get(&addr(1)).is_none());

        registry.mark_mine(&addr(1));
        registry.set_ring_index(&addr(1), 3).unwrap();
        let stored = store.get(&addr(1)).unwrap();
        assert_eq!(stored.nickname, "Keys");
        assert_eq!(stored.ring_index, 3);
    }

    #[test]
    fn test_setters_reject_unknown() {
        let (registry, _) = registry();
        assert!(registry.set_nickname(&addr(1), "x").is_err());
        assert!(registry.set_image(&addr(1), None).is_err());
    }

    #[test]
    fn test_load_from_store() {
        let store = Arc::new(MemoryDeviceStore::with_devices([StoredDevice {
            address: addr(4),
            nickname: "Bag".into(),
            alarm_on_disconnect: true,
            ring_index: 1,
            image: None,
            rssi: None,
            last_seen: None,
        }]));
        let registry = DeviceRegistry::new(store);
        assert_eq!(registry.load_from_store().unwrap(), 1);

        let record = registry.get(&addr(4)).unwrap();
        assert!(record.is_mine);
        assert_eq!(record.display_state, DisplayState::Searching);
        assert_eq!(record.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_ready_forces_alarm_off() {
        let (registry, _) = registry();
        registry.upsert(&addr(1), DeviceUpdate::default());
        registry.update(&addr(1), |r| r.is_alarming = true);

        registry.set_connection_state(&addr(1), ConnectionState::Ready);
        assert!(!registry.get(&addr(1)).unwrap().is_alarming);
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let (registry, _) = registry();
        let mut rx = registry.subscribe();
        registry.upsert(&addr(1), DeviceUpdate::default());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        registry.upsert(&addr(1), DeviceUpdate::default());
        assert!(!rx.has_changed().unwrap());
    }
}
