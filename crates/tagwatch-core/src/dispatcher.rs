//! Maps discovered GATT characteristics to the roles the engine drives.
//!
//! | Characteristic | Role | On discovery |
//! |---|---|---|
//! | `2a06` | [`DeviceInfo`](CharacteristicRole::DeviceInfo) | cache write channel, read RSSI |
//! | `ffe1` | [`Notify`](CharacteristicRole::Notify) | enable notifications |
//! | `ffe2` | [`AlarmControl`](CharacteristicRole::AlarmControl) | push alarm-on-disconnect |
//! | `2a19` | [`Battery`](CharacteristicRole::Battery) | read once |
//!
//! Planning is pure; the connection manager executes the plan.

use std::fmt::Write;

use tracing::debug;
use uuid::Uuid;

use crate::transport::{CharacteristicHandle, DiscoveredService};
use crate::uuids;

/// What the engine does with a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Alert-level write channel; also marks the link RSSI-pollable.
    DeviceInfo,
    /// Button notifications.
    Notify,
    /// Alarm-on-disconnect control.
    AlarmControl,
    /// Battery level.
    Battery,
}

impl CharacteristicRole {
    /// Role for a characteristic identifier, if it has one.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        match uuid {
            u if u == uuids::DEVICE_INFO => Some(Self::DeviceInfo),
            u if u == uuids::NOTIFY => Some(Self::Notify),
            u if u == uuids::ALARM_CONTROL => Some(Self::AlarmControl),
            u if u == uuids::BATTERY_LEVEL => Some(Self::Battery),
            _ => None,
        }
    }
}

/// One characteristic the engine must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchAction {
    /// What to do.
    pub role: CharacteristicRole,
    /// Where to do it.
    pub handle: CharacteristicHandle,
}

/// Result of walking a discovered GATT table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPlan {
    /// Actions in discovery order.
    pub actions: Vec<DispatchAction>,
    /// `service:… characteristic:… properties:…;` per characteristic, for verification.
    pub summary: String,
    /// Characteristics without a role.
    pub unmatched: usize,
}

impl DispatchPlan {
    /// First handle with `role`, if discovered.
    #[must_use]
    pub fn handle(&self, role: CharacteristicRole) -> Option<CharacteristicHandle> {
        self.actions
            .iter()
            .find(|a| a.role == role)
            .map(|a| a.handle)
    }
}

/// Walk every characteristic of every service.
#[must_use]
pub fn plan(services: &[DiscoveredService]) -> DispatchPlan {
    let mut plan = DispatchPlan::default();
    for service in services {
        for characteristic in &service.characteristics {
            let _ = write!(
                plan.summary,
                "service:{} characteristic:{} properties:{};",
                service.uuid, characteristic.uuid, characteristic.properties
            );
            let handle = CharacteristicHandle {
                service: service.uuid,
                characteristic: characteristic.uuid,
            };
            match CharacteristicRole::from_uuid(characteristic.uuid) {
                Some(role) => plan.actions.push(DispatchAction { role, handle }),
                None => {
                    plan.unmatched += 1;
                    debug!(service = %service.uuid, characteristic = %characteristic.uuid, "Ignoring characteristic");
                }
            }
        }
    }
    plan
}

/// Battery percent from a read payload. Empty payloads carry nothing.
#[must_use]
pub fn battery_from_payload(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

/// Whether a notification payload is a button press.
#[must_use]
pub fn is_button_press(payload: &[u8]) -> bool {
    payload.first() == Some(&1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DiscoveredCharacteristic, PROPERTY_NOTIFY, PROPERTY_READ};

    fn characteristic(uuid: Uuid, properties: u32) -> DiscoveredCharacteristic {
        DiscoveredCharacteristic { uuid, properties }
    }

    fn services() -> Vec<DiscoveredService> {
        let generic = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
        let name = Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb);
        vec![
            DiscoveredService {
                uuid: generic,
                characteristics: vec![characteristic(name, PROPERTY_READ)],
            },
            DiscoveredService {
                uuid: uuids::SERVICE_FILTER,
                characteristics: vec![
                    characteristic(uuids::NOTIFY, PROPERTY_NOTIFY),
                    characteristic(uuids::ALARM_CONTROL, 0x08),
                ],
            },
            DiscoveredService {
                uuid: Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb),
                characteristics: vec![characteristic(uuids::BATTERY_LEVEL, PROPERTY_READ)],
            },
        ]
    }

    #[test]
    fn test_plan_keeps_discovery_order() {
        let plan = plan(&services());
        let roles: Vec<_> = plan.actions.iter().map(|a| a.role).collect();
        assert_eq!(
            roles,
            vec![
                CharacteristicRole::Notify,
                CharacteristicRole::AlarmControl,
                CharacteristicRole::Battery
            ]
        );
        assert_eq!(plan.unmatched, 1);
        assert!(plan.handle(CharacteristicRole::DeviceInfo).is_none());
    }

    #[test]
    fn test_plan_summary_lists_every_characteristic() {
        let plan = plan(&services());
        assert_eq!(plan.summary.matches(';').count(), 4);
        assert!(plan.summary.contains(
            "service:0000ffe0-0000-1000-8000-00805f9b34fb characteristic:0000ffe1-0000-1000-8000-00805f9b34fb properties:16;"
        ));
    }

    #[test]
    fn test_role_lookup() {
        assert_eq!(
            CharacteristicRole::from_uuid(uuids::DEVICE_INFO),
            Some(CharacteristicRole::DeviceInfo)
        );
        assert_eq!(CharacteristicRole::from_uuid(uuids::SERVICE_FILTER), None);
    }

    #[test]
    fn test_battery_payload() {
        assert_eq!(battery_from_payload(&[77]), Some(77));
        assert_eq!(battery_from_payload(&[255, 1]), Some(255));
        assert_eq!(battery_from_payload(&[]), None);
    }

    #[test]
    fn test_button_press() {
        assert!(is_button_press(&[1]));
        assert!(is_button_press(&[1, 0]));
        assert!(!is_button_press(&[0]));
        assert!(!is_button_press(&[]));
    }
}
