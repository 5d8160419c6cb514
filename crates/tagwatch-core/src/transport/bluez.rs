//! `BlueZ` backend built on `bluer`.
//!
//! Each operation runs on its own tokio task and posts its completion to the
//! shared event channel, so a slow tag never stalls the others. Tasks that
//! belong to a session are aborted when the session is closed.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bluer::gatt::remote::Characteristic;
use bluer::gatt::CharacteristicFlags;
use bluer::{Adapter, AdapterEvent, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport};
use futures::{pin_mut, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Advertisement, CharacteristicHandle, DiscoveredCharacteristic, DiscoveredService, EventSender,
    Transport, TransportError, TransportEvent, PROPERTY_INDICATE, PROPERTY_NOTIFY, PROPERTY_READ,
    PROPERTY_WRITE, PROPERTY_WRITE_WITHOUT_RESPONSE,
};
use crate::types::Address;

const RESOLVE_POLL: Duration = Duration::from_millis(100);

/// One open link and everything spawned on its behalf.
struct Session {
    device: bluer::Device,
    attempt: u64,
    characteristics: HashMap<CharacteristicHandle, Characteristic>,
    notify_tasks: HashMap<CharacteristicHandle, JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn new(device: bluer::Device, attempt: u64) -> Self {
        Self {
            device,
            attempt,
            characteristics: HashMap::new(),
            notify_tasks: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn abort_all(self) {
        for task in self.tasks {
            task.abort();
        }
        for (_, task) in self.notify_tasks {
            task.abort();
        }
    }
}

type Sessions = Arc<Mutex<HashMap<Address, Session>>>;

/// Transport backed by the system `BlueZ` daemon.
pub struct BluerTransport {
    _session: bluer::Session,
    adapter: Adapter,
    events: EventSender,
    sessions: Sessions,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl BluerTransport {
    /// Connect to `BlueZ` and open the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterNotFound`] when no adapter exists and
    /// [`TransportError::AdapterPoweredOff`] when it is switched off.
    pub async fn new(events: EventSender) -> Result<Self, TransportError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| operation(&e))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterNotFound)?;

        if !adapter.is_powered().await.map_err(|e| operation(&e))? {
            return Err(TransportError::AdapterPoweredOff);
        }

        info!(adapter = %adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            scan: Mutex::new(None),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Address, Session>> {
        lock(&self.sessions)
    }

    fn device_for(&self, address: &Address) -> Result<(bluer::Device, u64), TransportError> {
        self.sessions()
            .get(address)
            .map(|s| (s.device.clone(), s.attempt))
            .ok_or_else(|| TransportError::NotConnected {
                address: address.clone(),
            })
    }

    fn characteristic_for(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
    ) -> Result<Characteristic, TransportError> {
        let sessions = self.sessions();
        let session = sessions
            .get(address)
            .ok_or_else(|| TransportError::NotConnected {
                address: address.clone(),
            })?;
        session
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                address: address.clone(),
                characteristic: handle.characteristic,
            })
    }

    fn track(&self, address: &Address, task: JoinHandle<()>) {
        match self.sessions().get_mut(address) {
            Some(session) => session.track(task),
            None => task.abort(),
        }
    }
}

impl Transport for BluerTransport {
    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        let mut scan = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = scan.take() {
            task.abort();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let filter = DiscoveryFilter {
            uuids: services.iter().copied().collect::<HashSet<_>>(),
            transport: DiscoveryTransport::Le,
            ..DiscoveryFilter::default()
        };

        *scan = Some(tokio::spawn(async move {
            if let Err(e) = run_scan(adapter, filter, events).await {
                warn!(error = %e, "Bluetooth scan ended with error");
            }
        }));
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.scan.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        Ok(())
    }

    fn connect(&self, address: &Address, attempt: u64) -> Result<(), TransportError> {
        let bt_address = to_bluer(address)?;
        let device = self.adapter.device(bt_address).map_err(|e| operation(&e))?;

        let mut sessions = self.sessions();
        if sessions.contains_key(address) {
            return Err(TransportError::Operation {
                message: format!("Session for {address} already open"),
            });
        }
        let mut session = Session::new(device.clone(), attempt);

        let events = self.events.clone();
        let shared = Arc::clone(&self.sessions);
        let key = address.clone();
        let address = address.clone();
        session.track(tokio::spawn(async move {
            match device.connect().await {
                Ok(()) => {
                    let watcher = tokio::spawn(watch_link(
                        device,
                        address.clone(),
                        attempt,
                        events.clone(),
                    ));
                    if let Some(session) = lock(&shared).get_mut(&address) {
                        session.track(watcher);
                    }
                    let _ = events.send(TransportEvent::Connected { address, attempt });
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Disconnected {
                        address,
                        attempt,
                        reason: Some(e.to_string()),
                    });
                }
            }
        }));
        sessions.insert(key, session);
        Ok(())
    }

    fn disconnect(&self, address: &Address) -> Result<(), TransportError> {
        let (device, attempt) = self.device_for(address)?;
        let events = self.events.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(e) = device.disconnect().await {
                let _ = events.send(TransportEvent::Disconnected {
                    address,
                    attempt,
                    reason: Some(e.to_string()),
                });
            }
        });
        Ok(())
    }

    fn close(&self, address: &Address) {
        let Some(session) = self.sessions().remove(address) else {
            return;
        };
        let device = session.device.clone();
        session.abort_all();
        tokio::spawn(async move {
            if matches!(device.is_connected().await, Ok(true)) {
                let _ = device.disconnect().await;
            }
        });
        debug!(address = %address, "Transport session closed");
    }

    fn discover_services(&self, address: &Address) -> Result<(), TransportError> {
        let (device, attempt) = self.device_for(address)?;
        let events = self.events.clone();
        let shared = Arc::clone(&self.sessions);
        let owner = address.clone();
        let task = tokio::spawn(async move {
            let result = match resolve_services(&device).await {
                Ok((services, characteristics)) => {
                    if let Some(session) = lock(&shared).get_mut(&owner) {
                        session.characteristics = characteristics;
                    }
                    Ok(services)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(TransportEvent::ServicesDiscovered {
                address: owner,
                attempt,
                result,
            });
        });
        self.track(address, task);
        Ok(())
    }

    fn read_characteristic(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic_for(address, handle)?;
        let events = self.events.clone();
        let owner = address.clone();
        let task = tokio::spawn(async move {
            let result = characteristic.read().await.map_err(|e| e.to_string());
            let _ = events.send(TransportEvent::CharacteristicRead {
                address: owner,
                handle,
                result,
            });
        });
        self.track(address, task);
        Ok(())
    }

    fn write_characteristic(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic_for(address, handle)?;
        let events = self.events.clone();
        let owner = address.clone();
        let task = tokio::spawn(async move {
            let result = characteristic.write(&value).await.map_err(|e| e.to_string());
            let _ = events.send(TransportEvent::CharacteristicWritten {
                address: owner,
                handle,
                result,
            });
        });
        self.track(address, task);
        Ok(())
    }

    fn set_notify(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic_for(address, handle)?;
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(address) else {
            return Err(TransportError::NotConnected {
                address: address.clone(),
            });
        };

        if let Some(task) = session.notify_tasks.remove(&handle) {
            task.abort();
        }
        if !enabled {
            return Ok(());
        }

        let events = self.events.clone();
        let owner = address.clone();
        let task = tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(address = %owner, error = %e, "Failed to enable notifications");
                    return;
                }
            };
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                let _ = events.send(TransportEvent::Notification {
                    address: owner.clone(),
                    handle,
                    value,
                });
            }
        });
        session.notify_tasks.insert(handle, task);
        Ok(())
    }

    fn read_rssi(&self, address: &Address) -> Result<(), TransportError> {
        let (device, _) = self.device_for(address)?;
        let events = self.events.clone();
        let owner = address.clone();
        let task = tokio::spawn(async move {
            let result = match device.rssi().await {
                Ok(Some(rssi)) => Ok(rssi),
                Ok(None) => Err("RSSI not available".to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(TransportEvent::RssiRead {
                address: owner,
                result,
            });
        });
        self.track(address, task);
        Ok(())
    }
}

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<Address, Session>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

fn operation(err: &bluer::Error) -> TransportError {
    TransportError::Operation {
        message: err.to_string(),
    }
}

fn to_bluer(address: &Address) -> Result<bluer::Address, TransportError> {
    bluer::Address::from_str(address.as_str()).map_err(|_| TransportError::InvalidAddress {
        address: address.to_string(),
    })
}

fn from_bluer(address: bluer::Address) -> Option<Address> {
    Address::parse(&address.to_string()).ok()
}

const fn flags_to_properties(flags: &CharacteristicFlags) -> u32 {
    let mut properties = 0;
    if flags.read {
        properties |= PROPERTY_READ;
    }
    if flags.write_without_response {
        properties |= PROPERTY_WRITE_WITHOUT_RESPONSE;
    }
    if flags.write {
        properties |= PROPERTY_WRITE;
    }
    if flags.notify {
        properties |= PROPERTY_NOTIFY;
    }
    if flags.indicate {
        properties |= PROPERTY_INDICATE;
    }
    properties
}

/// Rebuild manufacturer-specific AD structures from the properties `BlueZ` exposes.
fn advertisement_payload(manufacturer: Option<HashMap<u16, Vec<u8>>>) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut entries: Vec<_> = manufacturer.unwrap_or_default().into_iter().collect();
    entries.sort_by_key(|(id, _)| *id);
    for (id, data) in entries {
        let Ok(len) = u8::try_from(data.len() + 3) else {
            continue;
        };
        payload.push(len);
        payload.push(0xff);
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&data);
    }
    payload
}

async fn run_scan(
    adapter: Adapter,
    filter: DiscoveryFilter,
    events: EventSender,
) -> bluer::Result<()> {
    adapter.set_discovery_filter(filter).await?;
    let stream = adapter.discover_devices().await?;
    pin_mut!(stream);

    debug!("Bluetooth discovery started");
    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(bt_address) = event else {
            continue;
        };
        let (Some(address), Ok(device)) = (from_bluer(bt_address), adapter.device(bt_address))
        else {
            continue;
        };
        let advertisement = Advertisement {
            address,
            name: device.name().await.ok().flatten(),
            rssi: device.rssi().await.ok().flatten(),
            payload: advertisement_payload(device.manufacturer_data().await.ok().flatten()),
        };
        if events.send(TransportEvent::Discovered(advertisement)).is_err() {
            break;
        }
    }
    Ok(())
}

async fn watch_link(device: bluer::Device, address: Address, attempt: u64, events: EventSender) {
    let Ok(stream) = device.events().await else {
        return;
    };
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            let _ = events.send(TransportEvent::Disconnected {
                address,
                attempt,
                reason: None,
            });
            return;
        }
    }
}

async fn resolve_services(
    device: &bluer::Device,
) -> bluer::Result<(
    Vec<DiscoveredService>,
    HashMap<CharacteristicHandle, Characteristic>,
)> {
    while !device.is_services_resolved().await? {
        tokio::time::sleep(RESOLVE_POLL).await;
    }

    let mut services = Vec::new();
    let mut handles = HashMap::new();
    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            let properties = flags_to_properties(&characteristic.flags().await?);
            characteristics.push(DiscoveredCharacteristic { uuid, properties });
            handles.insert(
                CharacteristicHandle {
                    service: service_uuid,
                    characteristic: uuid,
                },
                characteristic,
            );
        }
        services.push(DiscoveredService {
            uuid: service_uuid,
            characteristics,
        });
    }
    Ok((services, handles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_to_properties() {
        let flags = CharacteristicFlags {
            read: true,
            notify: true,
            ..CharacteristicFlags::default()
        };
        assert_eq!(flags_to_properties(&flags), PROPERTY_READ | PROPERTY_NOTIFY);
    }

    #[test]
    fn test_advertisement_payload_layout() {
        let mut data = HashMap::new();
        data.insert(0x004c_u16, vec![0x02, 0x15]);
        assert_eq!(
            advertisement_payload(Some(data)),
            vec![5, 0xff, 0x4c, 0x00, 0x02, 0x15]
        );
        assert!(advertisement_payload(None).is_empty());
    }

    #[test]
    fn test_address_conversion() {
        let ours = Address::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let theirs = to_bluer(&ours).unwrap();
        assert_eq!(from_bluer(theirs), Some(ours));
    }
}
