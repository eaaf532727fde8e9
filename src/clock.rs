//! Time sources for tracker timestamps.
//!
//! Records carry a monotonic tick value; the region header pairs a
//! wall-clock reference with the tick value taken at the same moment.
//! A reader in any process can translate a record's ticks to wall time
//! with nothing but the two header fields, so the tick origin only has
//! to be stable within the writing process.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Process-wide origin for the monotonic tick counter.
fn tick_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn wall_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(1)
}

/// Current monotonic tick count in nanoseconds.
///
/// Always non-zero, so a zero tick field reliably means "never written".
#[must_use]
pub fn ticks_now() -> i64 {
    (tick_origin().elapsed().as_nanos() as i64).max(1)
}

/// Translates a record's ticks into wall time using the region's
/// wall/tick reference pair.
#[must_use]
pub const fn ticks_to_wall(start_time: i64, start_ticks: i64, ticks: i64) -> i64 {
    start_time + (ticks - start_ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_nonzero_and_monotonic() {
        let a = ticks_now();
        let b = ticks_now();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn wall_time_is_plausible() {
        // Sometime after 2020.
        assert!(wall_now() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn translation_is_exact() {
        let start_time = 1_000_000;
        let start_ticks = 500;
        assert_eq!(ticks_to_wall(start_time, start_ticks, 500), start_time);
        assert_eq!(ticks_to_wall(start_time, start_ticks, 750), start_time + 250);
    }
}
