//! Windows registry hive engine: bin/cell allocator over a hive file's
//! heap, typed cells (`nk`/`vk`/`sk`/`lh`/`lf`/`li`/`ri`), and LOG1/LOG2
//! transactional replay.
//!
//! Only cell-level edits are supported; rewriting the hive's bin layout
//! wholesale is out of scope.

mod cell;
mod filetime;
mod hive;
mod key;
mod log;

pub use cell::{CellIndex, SecurityCell, ValueCell, ValueType};
pub use filetime::{filetime_to_system_time, system_time_to_filetime};
pub use hive::Hive;
pub use key::KeyHandle;

use discforge_codec::read_u32_le;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HiveError>;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad hive signature")]
    BadSignature,

    #[error("hive needs transaction logs to recover")]
    NeedsLogs,

    #[error("registry transaction logs are corrupt")]
    LogsCorrupt,

    #[error("unknown cell tag {0:?}")]
    UnknownCellTag([u8; 2]),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key has sub-keys, delete forbidden: {0}")]
    HasChildren(String),

    #[error("cell relocation disabled")]
    RelocationDisabled,

    #[error("out of bounds: {0}")]
    Bounds(String),
}

/// Marvin32-style hash used for LOG entry integrity checking, with the
/// fixed seed the hive format specifies.
pub const MARVIN_SEED: u64 = 0x82EF_4D88_7A4E_55C5;

pub(crate) fn marvin32(data: &[u8], seed: u64) -> u64 {
    let mut lo = seed as u32;
    let mut hi = (seed >> 32) as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let v = read_u32_le(chunk, 0).unwrap();
        lo = lo.wrapping_add(v);
        marvin_mix(&mut lo, &mut hi);
    }

    let rem = chunks.remainder();
    let mut last = 0x8000_0000u32;
    for (i, &b) in rem.iter().enumerate() {
        last = (last & !(0xFF << (i * 8))) | ((b as u32) << (i * 8));
    }
    lo = lo.wrapping_add(last);
    marvin_mix(&mut lo, &mut hi);
    marvin_mix(&mut lo, &mut hi);

    ((hi as u64) << 32) | lo as u64
}

fn marvin_mix(lo: &mut u32, hi: &mut u32) {
    *hi ^= *lo;
    *hi = hi.rotate_left(20);
    *hi = hi.wrapping_add(*lo);
    *lo = lo.rotate_left(9);
    *lo ^= *hi;
    *lo = lo.wrapping_add(*hi);
    *hi = hi.rotate_left(21);
    *hi = hi.wrapping_sub(*lo);
    *lo = lo.rotate_left(16);
}
