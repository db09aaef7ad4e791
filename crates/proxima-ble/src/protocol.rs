//! BLE protocol constants and utilities for discovery

use proxima_core::codec;
use proxima_core::Stamp;
use uuid::Uuid;

use crate::radio::Sighting;

// ----------------------------------------------------------------------------
// Manufacturer Data
// ----------------------------------------------------------------------------

/// Manufacturer id under which the stamp is broadcast
pub const DEFAULT_MANUFACTURER_ID: u16 = 0x03E9;

// ----------------------------------------------------------------------------
// Reserved Services
// ----------------------------------------------------------------------------

/// Generic Access profile service (device name, appearance)
pub const GENERIC_ACCESS_UUID: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB);

/// Generic Attribute profile service (service changed)
pub const GENERIC_ATTRIBUTE_UUID: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805F9B34FB);

/// True for housekeeping services that never carry advertisements
pub fn is_reserved_service(uuid: &Uuid) -> bool {
    *uuid == GENERIC_ACCESS_UUID || *uuid == GENERIC_ATTRIBUTE_UUID
}

// ----------------------------------------------------------------------------
// Protocol Utilities
// ----------------------------------------------------------------------------

/// Manufacturer payload announcing `stamp`
pub fn stamp_payload(stamp: Stamp) -> Vec<u8> {
    codec::encode_stamp(stamp).to_vec()
}

/// Stamp announced by a sighting, if its payload is well formed
pub fn sighting_stamp(sighting: &Sighting) -> Option<Stamp> {
    codec::decode_stamp(&sighting.manufacturer_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxima_core::RadioId;

    #[test]
    fn test_reserved_services() {
        assert!(is_reserved_service(&GENERIC_ACCESS_UUID));
        assert!(is_reserved_service(&GENERIC_ATTRIBUTE_UUID));
        assert!(!is_reserved_service(&codec::ID_UUID));
    }

    #[test]
    fn test_sighting_stamp() {
        let stamp = Stamp::new(42);
        let sighting = Sighting {
            peer: RadioId::new("aa:bb"),
            manufacturer_data: stamp_payload(stamp),
        };
        assert_eq!(sighting_stamp(&sighting), Some(stamp));

        let garbage = Sighting {
            peer: RadioId::new("aa:bb"),
            manufacturer_data: vec![1, 2, 3],
        };
        assert_eq!(sighting_stamp(&garbage), None);
    }
}
