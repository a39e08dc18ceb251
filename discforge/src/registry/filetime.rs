//! Windows `FILETIME`: 100-nanosecond ticks since 1601-01-01 UTC.

use std::time::{Duration, SystemTime};

/// Seconds from the Windows epoch (1601-01-01) to the Unix epoch
/// (1970-01-01), i.e. `SystemTime::UNIX_EPOCH` expressed in FILETIME terms.
const EPOCH_DIFF_SECONDS: u64 = 11_644_473_600;
const TICKS_PER_SECOND: u64 = 10_000_000;

pub fn filetime_to_system_time(ticks: u64) -> SystemTime {
    let total_seconds = ticks / TICKS_PER_SECOND;
    let remainder_ticks = ticks % TICKS_PER_SECOND;
    let unix_seconds = total_seconds.saturating_sub(EPOCH_DIFF_SECONDS);
    SystemTime::UNIX_EPOCH + Duration::new(unix_seconds, (remainder_ticks * 100) as u32)
}

pub fn system_time_to_filetime(time: SystemTime) -> u64 {
    let since_unix = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let total_seconds = since_unix.as_secs() + EPOCH_DIFF_SECONDS;
    total_seconds * TICKS_PER_SECOND + since_unix.subsec_nanos() as u64 / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_round_trips() {
        let ft = system_time_to_filetime(SystemTime::UNIX_EPOCH);
        assert_eq!(ft, EPOCH_DIFF_SECONDS * TICKS_PER_SECOND);
        assert_eq!(filetime_to_system_time(ft), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn sub_second_precision_survives_round_trip() {
        let original = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_400);
        let ft = system_time_to_filetime(original);
        let back = filetime_to_system_time(ft);
        let drift = back
            .duration_since(original)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_micros(1));
    }
}
