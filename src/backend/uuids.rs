//! Fast Pair and Nearby UUIDs

use uuid::Uuid;

/// Bluetooth base UUID expansion of a 16-bit assigned number
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Fast Pair service (0xFE2C)
pub const FAST_PAIR_SERVICE_UUID: Uuid = uuid16(0xFE2C);

/// Nearby presence service (0xFEF3)
pub const NEARBY_SERVICE_UUID: Uuid = uuid16(0xFEF3);

/// Key-based Pairing characteristic
pub const KBP_CHAR_UUID: Uuid = Uuid::from_bytes([
    0xfe, 0x2c, 0x12, 0x34, 0x83, 0x66, 0x48, 0x14, 0x8e, 0xb0, 0x01, 0xde, 0x32, 0x10, 0x0b, 0xea,
]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            FAST_PAIR_SERVICE_UUID.to_string(),
            "0000fe2c-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            NEARBY_SERVICE_UUID.to_string(),
            "0000fef3-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            KBP_CHAR_UUID.to_string(),
            "fe2c1234-8366-4814-8eb0-01de32100bea"
        );
    }
}
