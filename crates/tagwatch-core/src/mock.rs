//! Scriptable stand-ins for the radio and the outbound collaborators.
//!
//! [`MockTransport`] records every call. Built with [`MockTransport::with_events`]
//! it also answers like a well-behaved tag: connects succeed (unless told to
//! fail), discovery returns [`standard_tag_services`], the battery reads 77 %
//! and RSSI reads -60 dBm.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::collaborators::{AlarmSink, Verifier};
use crate::transport::{
    Advertisement, CharacteristicHandle, DiscoveredCharacteristic, DiscoveredService, EventSender,
    Transport, TransportError, TransportEvent, PROPERTY_NOTIFY, PROPERTY_READ, PROPERTY_WRITE,
    PROPERTY_WRITE_WITHOUT_RESPONSE,
};
use crate::types::{Address, VerifyRecord};
use crate::uuids;

const IMMEDIATE_ALERT: Uuid = Uuid::from_u128(0x0000_1802_0000_1000_8000_0080_5f9b_34fb);
const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// The GATT table of a typical anti-lost tag.
#[must_use]
pub fn standard_tag_services() -> Vec<DiscoveredService> {
    vec![
        DiscoveredService {
            uuid: IMMEDIATE_ALERT,
            characteristics: vec![DiscoveredCharacteristic {
                uuid: uuids::DEVICE_INFO,
                properties: PROPERTY_WRITE_WITHOUT_RESPONSE,
            }],
        },
        DiscoveredService {
            uuid: uuids::SERVICE_FILTER,
            characteristics: vec![
                DiscoveredCharacteristic {
                    uuid: uuids::NOTIFY,
                    properties: PROPERTY_NOTIFY,
                },
                DiscoveredCharacteristic {
                    uuid: uuids::ALARM_CONTROL,
                    properties: PROPERTY_READ | PROPERTY_WRITE,
                },
            ],
        },
        DiscoveredService {
            uuid: BATTERY_SERVICE,
            characteristics: vec![DiscoveredCharacteristic {
                uuid: uuids::BATTERY_LEVEL,
                properties: PROPERTY_READ,
            }],
        },
    ]
}

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `start_scan`.
    StartScan(Vec<Uuid>),
    /// `stop_scan`.
    StopScan,
    /// `connect`.
    Connect(Address),
    /// `disconnect`.
    Disconnect(Address),
    /// `close`.
    Close(Address),
    /// `discover_services`.
    DiscoverServices(Address),
    /// `read_characteristic`.
    Read {
        /// Tag.
        address: Address,
        /// Characteristic.
        handle: CharacteristicHandle,
    },
    /// `write_characteristic`.
    Write {
        /// Tag.
        address: Address,
        /// Characteristic.
        handle: CharacteristicHandle,
        /// Payload.
        value: Vec<u8>,
    },
    /// `set_notify`.
    SetNotify {
        /// Tag.
        address: Address,
        /// Characteristic.
        handle: CharacteristicHandle,
        /// Enable flag.
        enabled: bool,
    },
    /// `read_rssi`.
    ReadRssi(Address),
}

#[derive(Debug)]
struct MockState {
    calls: Vec<TransportCall>,
    sessions: HashMap<Address, u64>,
    last_attempt: HashMap<Address, u64>,
    duplicate_sessions: usize,
    failing: HashSet<Address>,
    services: Vec<DiscoveredService>,
    advertisements: Vec<Advertisement>,
    battery: Vec<u8>,
    rssi: i16,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            sessions: HashMap::new(),
            last_attempt: HashMap::new(),
            duplicate_sessions: 0,
            failing: HashSet::new(),
            services: standard_tag_services(),
            advertisements: Vec::new(),
            battery: vec![77],
            rssi: -60,
        }
    }
}

/// Recording, optionally self-answering transport.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    events: Option<EventSender>,
}

impl MockTransport {
    /// A transport that only records calls. Tests inject completions themselves.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that answers every call on `events`.
    #[must_use]
    pub fn with_events(events: EventSender) -> Self {
        Self {
            state: Mutex::default(),
            events: Some(events),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn require_session(state: &MockState, address: &Address) -> Result<u64, TransportError> {
        state
            .sessions
            .get(address)
            .copied()
            .ok_or_else(|| TransportError::NotConnected {
                address: address.clone(),
            })
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Make connects to `address` fail.
    pub fn fail_connect(&self, address: &Address) {
        self.state().failing.insert(address.clone());
    }

    /// Let connects to `address` succeed again.
    pub fn allow_connect(&self, address: &Address) {
        self.state().failing.remove(address);
    }

    /// Replace the GATT table returned by discovery.
    pub fn set_services(&self, services: Vec<DiscoveredService>) {
        self.state().services = services;
    }

    /// Replace the battery read payload.
    pub fn set_battery(&self, payload: Vec<u8>) {
        self.state().battery = payload;
    }

    /// Advertisements reported by every scan.
    pub fn add_advertisement(&self, advertisement: Advertisement) {
        self.state().advertisements.push(advertisement);
    }

    /// The tag drops the link on its own.
    pub fn simulate_link_loss(&self, address: &Address) {
        let attempt = {
            let mut state = self.state();
            state.sessions.remove(address);
            state.last_attempt.get(address).copied().unwrap_or_default()
        };
        self.emit(TransportEvent::Disconnected {
            address: address.clone(),
            attempt,
            reason: None,
        });
    }

    /// The tag pushes a notification on its notify characteristic.
    pub fn simulate_notification(&self, address: &Address, value: Vec<u8>) {
        self.emit(TransportEvent::Notification {
            address: address.clone(),
            handle: CharacteristicHandle {
                service: uuids::SERVICE_FILTER,
                characteristic: uuids::NOTIFY,
            },
            value,
        });
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// How many times `connect` was called for `address`.
    #[must_use]
    pub fn connect_count(&self, address: &Address) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(a) if a == address))
            .count()
    }

    /// Writes to `address`, in order.
    #[must_use]
    pub fn writes(&self, address: &Address) -> Vec<(CharacteristicHandle, Vec<u8>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Write {
                    address: a,
                    handle,
                    value,
                } if a == address => Some((*handle, value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Whether a session to `address` is open.
    #[must_use]
    pub fn has_session(&self, address: &Address) -> bool {
        self.state().sessions.contains_key(address)
    }

    /// Attempt id passed to the latest `connect` for `address`.
    #[must_use]
    pub fn last_attempt(&self, address: &Address) -> Option<u64> {
        self.state().last_attempt.get(address).copied()
    }

    /// Connects issued while a session to the same address was already open.
    #[must_use]
    pub fn duplicate_sessions(&self) -> usize {
        self.state().duplicate_sessions
    }
}

impl Transport for MockTransport {
    fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        let advertisements = {
            let mut state = self.state();
            state.calls.push(TransportCall::StartScan(services.to_vec()));
            state.advertisements.clone()
        };
        for advertisement in advertisements {
            self.emit(TransportEvent::Discovered(advertisement));
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().calls.push(TransportCall::StopScan);
        Ok(())
    }

    fn connect(&self, address: &Address, attempt: u64) -> Result<(), TransportError> {
        let failing = {
            let mut state = self.state();
            state.calls.push(TransportCall::Connect(address.clone()));
            state.last_attempt.insert(address.clone(), attempt);
            if state.failing.contains(address) {
                true
            } else {
                if state.sessions.insert(address.clone(), attempt).is_some() {
                    state.duplicate_sessions += 1;
                }
                false
            }
        };
        if failing {
            self.emit(TransportEvent::Disconnected {
                address: address.clone(),
                attempt,
                reason: Some("connection refused".into()),
            });
        } else {
            self.emit(TransportEvent::Connected {
                address: address.clone(),
                attempt,
            });
        }
        Ok(())
    }

    fn disconnect(&self, address: &Address) -> Result<(), TransportError> {
        let attempt = {
            let mut state = self.state();
            state.calls.push(TransportCall::Disconnect(address.clone()));
            Self::require_session(&state, address)?
        };
        self.emit(TransportEvent::Disconnected {
            address: address.clone(),
            attempt,
            reason: None,
        });
        Ok(())
    }

    fn close(&self, address: &Address) {
        let mut state = self.state();
        state.calls.push(TransportCall::Close(address.clone()));
        state.sessions.remove(address);
    }

    fn discover_services(&self, address: &Address) -> Result<(), TransportError> {
        let (attempt, services) = {
            let mut state = self.state();
            state.calls.push(TransportCall::DiscoverServices(address.clone()));
            let attempt = Self::require_session(&state, address)?;
            (attempt, state.services.clone())
        };
        self.emit(TransportEvent::ServicesDiscovered {
            address: address.clone(),
            attempt,
            result: Ok(services),
        });
        Ok(())
    }

    fn read_characteristic(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let value = {
            let mut state = self.state();
            state.calls.push(TransportCall::Read {
                address: address.clone(),
                handle,
            });
            Self::require_session(&state, address)?;
            if handle.characteristic == uuids::BATTERY_LEVEL {
                state.battery.clone()
            } else {
                Vec::new()
            }
        };
        self.emit(TransportEvent::CharacteristicRead {
            address: address.clone(),
            handle,
            result: Ok(value),
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            state.calls.push(TransportCall::Write {
                address: address.clone(),
                handle,
                value,
            });
            Self::require_session(&state, address)?;
        }
        self.emit(TransportEvent::CharacteristicWritten {
            address: address.clone(),
            handle,
            result: Ok(()),
        });
        Ok(())
    }

    fn set_notify(
        &self,
        address: &Address,
        handle: CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(TransportCall::SetNotify {
            address: address.clone(),
            handle,
            enabled,
        });
        Self::require_session(&state, address).map(|_| ())
    }

    fn read_rssi(&self, address: &Address) -> Result<(), TransportError> {
        let rssi = {
            let mut state = self.state();
            state.calls.push(TransportCall::ReadRssi(address.clone()));
            Self::require_session(&state, address)?;
            state.rssi
        };
        self.emit(TransportEvent::RssiRead {
            address: address.clone(),
            result: Ok(rssi),
        });
        Ok(())
    }
}

/// Verifier that keeps every submitted record.
#[derive(Debug, Default)]
pub struct RecordingVerifier {
    records: Mutex<Vec<VerifyRecord>>,
}

impl RecordingVerifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records submitted so far.
    #[must_use]
    pub fn records(&self) -> Vec<VerifyRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Verifier for RecordingVerifier {
    fn submit(&self, record: VerifyRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// One recorded [`AlarmSink`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    /// `play_alert`.
    PlayAlert(Address),
    /// `pause`.
    Pause,
    /// `on_button_press`.
    ButtonPress(Address),
}

/// Alarm sink that records calls.
#[derive(Debug, Default)]
pub struct RecordingAlarmSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingAlarmSink {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many alerts were played for `address`.
    #[must_use]
    pub fn alerts_for(&self, address: &Address) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SinkCall::PlayAlert(a) if a == address))
            .count()
    }

    fn push(&self, call: SinkCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl AlarmSink for RecordingAlarmSink {
    fn play_alert(&self, address: &Address) {
        self.push(SinkCall::PlayAlert(address.clone()));
    }

    fn pause(&self) {
        self.push(SinkCall::Pause);
    }

    fn on_button_press(&self, address: &Address) {
        self.push(SinkCall::ButtonPress(address.clone()));
    }
}

/// Per-address call counts, handy for assertions over many tags.
#[must_use]
pub fn connects_by_address(calls: &[TransportCall]) -> HashMap<Address, usize> {
    let mut counts = HashMap::new();
    for call in calls {
        if let TransportCall::Connect(address) = call {
            *counts.entry(address.clone()).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_channel;

    fn addr() -> Address {
        Address::parse("AA:BB:CC:DD:EE:01").unwrap()
    }

    #[test]
    fn test_auto_connect_then_discover() {
        let (tx, mut rx) = event_channel();
        let mock = MockTransport::with_events(tx);

        mock.connect(&addr(), 7).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Connected {
                address: addr(),
                attempt: 7
            }
        );

        mock.discover_services(&addr()).unwrap();
        match rx.try_recv().unwrap() {
            TransportEvent::ServicesDiscovered {
                attempt, result, ..
            } => {
                assert_eq!(attempt, 7);
                assert_eq!(result.unwrap(), standard_tag_services());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failing_connect_reports_disconnect() {
        let (tx, mut rx) = event_channel();
        let mock = MockTransport::with_events(tx);
        mock.fail_connect(&addr());

        mock.connect(&addr(), 2).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::Disconnected { attempt: 2, reason: Some(_), .. }
        ));
        assert!(!mock.has_session(&addr()));
    }

    #[test]
    fn test_duplicate_session_counted() {
        let mock = MockTransport::new();
        mock.connect(&addr(), 1).unwrap();
        mock.connect(&addr(), 2).unwrap();
        assert_eq!(mock.duplicate_sessions(), 1);
        assert_eq!(mock.last_attempt(&addr()), Some(2));
        assert_eq!(connects_by_address(&mock.calls())[&addr()], 2);
    }

    #[test]
    fn test_ops_require_session() {
        let mock = MockTransport::new();
        assert!(mock.read_rssi(&addr()).is_err());
        mock.connect(&addr(), 1).unwrap();
        assert!(mock.read_rssi(&addr()).is_ok());
        mock.close(&addr());
        assert!(mock.read_rssi(&addr()).is_err());
    }
}
