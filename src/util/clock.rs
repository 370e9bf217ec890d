//! Wall-clock helpers for timestamps exposed in snapshots and descriptors.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or `0` if the system clock is before it.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Saturating conversion of a duration to whole microseconds.
#[must_use]
pub fn duration_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_duration_micros_saturates() {
        assert_eq!(duration_micros(Duration::from_millis(3)), 3_000);
        assert_eq!(duration_micros(Duration::MAX), u64::MAX);
    }
}
