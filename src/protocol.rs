//! Heart Rate Profile constants and measurement decoding.
//!
//! The service and characteristic UUIDs are the fixed Bluetooth SIG
//! assignments for the Heart Rate service; they are deliberately not
//! configurable.

use uuid::Uuid;

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128,
    )
}

/// Heart Rate Service UUID (0x180D).
pub const HR_SERVICE_UUID: Uuid = ble_uuid(0x180D);

/// Heart Rate Measurement Characteristic UUID (0x2A37).
pub const HR_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A37);

/// Parse a BLE Heart Rate Measurement characteristic value.
///
/// Per the Bluetooth spec, byte 0 is flags:
///   bit 0: 0 = HR is uint8 in byte 1, 1 = HR is uint16 LE in bytes 1-2
///
/// Sensor-contact, energy-expended, and RR-interval fields are ignored;
/// only the bpm value is extracted. Returns None if the payload is too
/// short for the encoding the flags select.
pub fn parse_hr_measurement(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }

    let flags = data[0];
    let hr_format_16bit = (flags & 0x01) != 0;

    if hr_format_16bit {
        if data.len() < 3 {
            return None;
        }
        Some(u16::from_le_bytes([data[1], data[2]]))
    } else {
        Some(data[1] as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_expansion() {
        assert_eq!(
            HR_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HR_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_parse_uint8() {
        // flags=0x00 (uint8 format), HR=72
        assert_eq!(parse_hr_measurement(&[0x00, 72]), Some(72));
    }

    #[test]
    fn test_parse_uint16() {
        // flags=0x01 (uint16 format), HR=72 (0x0048 LE = [0x48, 0x00])
        assert_eq!(parse_hr_measurement(&[0x01, 0x48, 0x00]), Some(72));
    }

    #[test]
    fn test_parse_uint16_above_u8_range() {
        // HR=300 (0x012C LE = [0x2C, 0x01])
        assert_eq!(parse_hr_measurement(&[0x01, 0x2C, 0x01]), Some(300));
    }

    #[test]
    fn test_parse_uint8_with_extra_flags() {
        // flags=0x06 (bit0=0 so uint8, other bits set for contact/energy), HR=155
        assert_eq!(parse_hr_measurement(&[0x06, 155, 0x00, 0x00]), Some(155));
    }

    #[test]
    fn test_parse_uint16_with_extra_flags() {
        // flags=0x11 (bit0=1 so uint16, bit4=rr), HR=256
        assert_eq!(parse_hr_measurement(&[0x11, 0x00, 0x01, 0x00, 0x00]), Some(256));
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_hr_measurement(&[]), None);
    }

    #[test]
    fn test_parse_flags_only() {
        assert_eq!(parse_hr_measurement(&[0x00]), None);
        assert_eq!(parse_hr_measurement(&[0x01]), None);
    }

    #[test]
    fn test_parse_uint16_truncated() {
        // 16-bit flag set but only one value byte present
        assert_eq!(parse_hr_measurement(&[0x01, 0x01]), None);
    }

    #[test]
    fn test_parse_zero_and_max() {
        assert_eq!(parse_hr_measurement(&[0x00, 0]), Some(0));
        assert_eq!(parse_hr_measurement(&[0x00, 255]), Some(255));
        assert_eq!(parse_hr_measurement(&[0x01, 0xFF, 0xFF]), Some(65535));
    }
}
