//! IEEE 802.3 CRC-32 (polynomial `0x04C11DB7`, reflected, init/xorout
//! `0xFFFFFFFF`) — the checksum GPT uses for its header and entry array.
//!
//! The table is a standard reflected CRC-32 lookup table, computed once
//! into a `OnceLock` rather than through a `static mut`, since nothing
//! about lazily building a read-only table actually requires unsafe code
//! once `OnceLock` exists.

use std::sync::OnceLock;

const POLYNOMIAL: u32 = 0x04C1_1DB7;

fn reflect(mut value: u32, bits: u8) -> u32 {
    let mut out = 0u32;
    for i in 0..=bits {
        if value & 1 != 0 {
            out |= 1 << (bits - i);
        }
        value >>= 1;
    }
    out
}

fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    for (code, slot) in table.iter_mut().enumerate() {
        let mut value = reflect(code as u32, 8) << 24;
        for _ in 0..8 {
            value = if value & (1 << 31) != 0 {
                (value << 1) ^ POLYNOMIAL
            } else {
                value << 1
            };
        }
        *slot = reflect(value, 31);
    }
    table
}

fn table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

/// CRC32 of `data`, matching the IEEE 802.3 variant GPT specifies.
pub fn crc32(data: &[u8]) -> u32 {
    let table = table();
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = (crc >> 8) ^ table[((crc & 0xFF) ^ byte as u32) as usize];
    }
    crc ^ 0xFFFF_FFFF
}

pub fn verify(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_vector() {
        // "123456789" is the standard CRC-32/ISO-HDLC check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn verify_round_trips() {
        let data = b"EFI PART some header bytes";
        let sum = crc32(data);
        assert!(verify(data, sum));
        assert!(!verify(data, sum ^ 1));
    }
}
