//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Calculate the delay to wait after `attempt` failed attempts.
///
/// The delay grows by `factor` per attempt starting at `base_ms` and never
/// exceeds `max_ms`. Jitter shaves up to 10% off the delay so the cap stays a
/// hard upper bound.
pub fn calculate_backoff(attempt: u32, base_ms: u64, factor: f64, max_ms: u64, jitter: bool) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponent = (attempt - 1).min(64) as i32;
    let raw = base_ms as f64 * factor.max(1.0).powi(exponent);
    let capped_delay = if raw.is_finite() {
        (raw as u64).min(max_ms)
    } else {
        max_ms
    };

    let jitter_range = capped_delay / 10;
    let shave = if jitter && jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay - shave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 1000, 1.5, 10_000, false), Duration::ZERO);
        assert_eq!(calculate_backoff(1, 1000, 1.5, 10_000, false).as_millis(), 1000);
        assert_eq!(calculate_backoff(2, 1000, 1.5, 10_000, false).as_millis(), 1500);
        assert_eq!(calculate_backoff(3, 1000, 1.5, 10_000, false).as_millis(), 2250);
    }

    #[test]
    fn test_backoff_is_capped() {
        let max = calculate_backoff(30, 1000, 1.5, 10_000, false);
        assert_eq!(max.as_millis(), 10_000);

        let huge = calculate_backoff(u32::MAX, 1000, 2.0, 10_000, false);
        assert_eq!(huge.as_millis(), 10_000);
    }

    #[test]
    fn test_jitter_stays_below_cap() {
        for attempt in 1..20 {
            let delay = calculate_backoff(attempt, 1000, 1.5, 10_000, true);
            assert!(delay.as_millis() <= 10_000);
        }
    }
}
