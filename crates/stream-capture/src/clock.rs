//! Process-wide monotonic presentation clock.
//!
//! Video and audio PTS must share one timeline; both backends stamp
//! frames with [`monotonic_us`]. The epoch is the first call in the
//! process, which keeps values small and sidesteps wall-clock jumps.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the process capture epoch.
#[must_use]
pub fn monotonic_us() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    i64::try_from(epoch.elapsed().as_micros()).unwrap_or(i64::MAX)
}

/// The epoch instant, for converting PTS back to `Instant`s.
#[must_use]
pub fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }
}
