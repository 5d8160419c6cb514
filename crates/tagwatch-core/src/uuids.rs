//! Well-known GATT identifiers spoken by anti-lost tags.

use uuid::Uuid;

/// Service advertised by tags; scans are filtered to it.
pub const SERVICE_FILTER: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb);

/// Alert-level characteristic, used as the tag's write channel.
pub const DEVICE_INFO: Uuid = Uuid::from_u128(0x0000_2a06_0000_1000_8000_0080_5f9b_34fb);

/// Button notification characteristic.
pub const NOTIFY: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb);

/// Alarm-on-disconnect control characteristic.
pub const ALARM_CONTROL: Uuid = Uuid::from_u128(0x0000_ffe2_0000_1000_8000_0080_5f9b_34fb);

/// Standard battery level characteristic.
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_match_wire_format() {
        assert_eq!(
            SERVICE_FILTER.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(DEVICE_INFO.to_string(), "00002a06-0000-1000-8000-00805f9b34fb");
        assert_eq!(NOTIFY.to_string(), "0000ffe1-0000-1000-8000-00805f9b34fb");
        assert_eq!(ALARM_CONTROL.to_string(), "0000ffe2-0000-1000-8000-00805f9b34fb");
        assert_eq!(BATTERY_LEVEL.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");
    }
}
