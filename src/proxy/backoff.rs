//! Reconnect delays for upstream pools.

use std::time::Duration;

use rand::Rng;

const STEP_MS: u64 = 10;
const CEILING_MS: u64 = 6_000;

/// Extra wait before reconnecting a pool that failed `failed` times in a row.
///
/// Doubles from 10ms per failure up to 6s, plus up to a tenth more at random.
pub(crate) fn reconnect_delay(failed: u32) -> Duration {
    if failed == 0 {
        return Duration::ZERO;
    }
    let ms = (STEP_MS << (failed - 1).min(20)).min(CEILING_MS);
    let spread = rand::thread_rng().gen_range(0..=ms / 10);
    Duration::from_millis(ms + spread)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_failure() {
        assert_eq!(reconnect_delay(0), Duration::ZERO);
        assert!((10..=11).contains(&reconnect_delay(1).as_millis()));
        assert!((40..=44).contains(&reconnect_delay(3).as_millis()));
    }

    #[test]
    fn long_failure_streaks_stay_capped() {
        for failed in [12, 64, u32::MAX] {
            let ms = reconnect_delay(failed).as_millis();
            assert!((6_000..=6_600).contains(&ms), "{failed}: {ms}");
        }
    }
}
