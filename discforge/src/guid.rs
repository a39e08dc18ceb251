//! GUID encode/decode for the "mixed-endian" on-disk layout GPT (and the
//! registry's class GUIDs, where present) use: the first three fields are
//! little-endian, the last two are big-endian, matching Microsoft's GUID
//! wire format.
//!
//! The field split (`data1`/`data2`/`data3`/`data4`) is the standard
//! Microsoft GUID layout; the storage type is `uuid::Uuid` rather than a
//! bespoke struct, since `Uuid::from_fields` already implements the
//! mixed-endian convention natively.

use discforge_codec::{read_u16_le, read_u32_le};
use uuid::Uuid;

/// Decode a 16-byte mixed-endian GUID as it appears on disk.
pub fn from_mixed_endian_bytes(buf: [u8; 16]) -> Uuid {
    let d1 = read_u32_le(&buf, 0).unwrap();
    let d2 = read_u16_le(&buf, 4).unwrap();
    let d3 = read_u16_le(&buf, 6).unwrap();
    let d4: [u8; 8] = buf[8..16].try_into().unwrap();
    Uuid::from_fields(d1, d2, d3, &d4)
}

/// Encode a GUID back into its 16-byte mixed-endian on-disk form.
pub fn to_mixed_endian_bytes(guid: Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = guid.as_fields();
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&d1.to_le_bytes());
    out[4..6].copy_from_slice(&d2.to_le_bytes());
    out[6..8].copy_from_slice(&d3.to_le_bytes());
    out[8..16].copy_from_slice(d4);
    out
}

/// The all-zero GUID, used as both "no type" (free GPT slot) and "no
/// unique id" sentinel.
pub fn nil() -> Uuid {
    Uuid::nil()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_mixed_endian_bytes() {
        let buf: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
        let guid = from_mixed_endian_bytes(buf);
        assert_eq!(to_mixed_endian_bytes(guid), buf);
    }

    #[test]
    fn nil_is_all_zero_bytes() {
        assert_eq!(to_mixed_endian_bytes(nil()), [0u8; 16]);
    }
}
