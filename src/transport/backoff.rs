//! Reconnect backoff
//!
//! Exponential delay with upward jitter. While the doubling delay is below
//! the ceiling, delays never decrease. Once the doubling reaches the
//! ceiling, each delay is drawn from the band
//! `[ceiling * (1 - jitter_ratio), ceiling]` so surfaces that stay down do
//! not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff state for one surface
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    jitter_ratio: f64,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Create a backoff doubling from `base` up to `ceiling`
    ///
    /// `jitter_ratio` adds up to that fraction of the raw delay on top of it.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use pocketclaw::transport::Backoff;
    ///
    /// let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.0);
    /// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    /// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    /// ```
    pub fn new(base: Duration, ceiling: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let raw = self.base.saturating_mul(factor);
        let delay = if raw >= self.ceiling {
            let floor = self.ceiling_band_floor();
            let spread = self.ceiling.saturating_sub(floor);
            (floor + spread.mul_f64(self.jitter_fraction(1.0))).min(self.ceiling)
        } else {
            let jitter = raw.mul_f64(self.jitter_fraction(self.jitter_ratio));
            raw.saturating_add(jitter).min(self.ceiling).max(self.last)
        };

        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Shortest delay once the doubling has reached the ceiling
    pub fn ceiling_band_floor(&self) -> Duration {
        self.ceiling.mul_f64(1.0 - self.jitter_ratio).min(self.ceiling)
    }

    fn jitter_fraction(&self, upper: f64) -> f64 {
        if self.jitter_ratio > 0.0 && upper > 0.0 {
            rand::rng().random_range(0.0..=upper)
        } else {
            0.0
        }
    }

    /// Attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_ceiling_without_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 0.0);
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn test_jittered_delays_non_decreasing_below_ceiling() {
        let ceiling = Duration::from_secs(2);
        for _ in 0..50 {
            let mut backoff = Backoff::new(Duration::from_millis(50), ceiling, 0.5);
            let mut previous = Duration::ZERO;
            // 50ms doubled five times is 1.6s, still under the ceiling.
            for _ in 0..6 {
                let delay = backoff.next_delay();
                assert!(delay >= previous);
                assert!(delay <= ceiling);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_delays_at_ceiling_stay_jittered_within_band() {
        let ceiling = Duration::from_secs(2);
        let mut backoff = Backoff::new(Duration::from_millis(50), ceiling, 0.5);
        for _ in 0..6 {
            backoff.next_delay();
        }
        let floor = backoff.ceiling_band_floor();
        assert_eq!(floor, Duration::from_secs(1));

        let band: Vec<Duration> = (0..64).map(|_| backoff.next_delay()).collect();
        assert!(band.iter().all(|d| *d >= floor && *d <= ceiling));
        assert!(
            band.iter().any(|d| *d != band[0]),
            "delays at the ceiling must not repeat one fixed value"
        );
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_ceiling_below_base_is_raised() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1), 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    mod properties {
        use super::super::Backoff;
        use proptest::prelude::*;
        use std::time::Duration;

        proptest! {
            #[test]
            fn delays_climb_to_ceiling_then_stay_in_band(
                base_ms in 1u64..2_000,
                ceiling_ms in 1u64..60_000,
                jitter_ratio in 0.0f64..=1.0,
                attempts in 1usize..40,
            ) {
                let base = Duration::from_millis(base_ms);
                let mut backoff = Backoff::new(base, Duration::from_millis(ceiling_ms), jitter_ratio);
                let ceiling = Duration::from_millis(ceiling_ms).max(base);
                let floor = backoff.ceiling_band_floor();

                let mut previous = Duration::ZERO;
                for attempt in 0..attempts {
                    let delay = backoff.next_delay();
                    let raw = base.saturating_mul(2u32.saturating_pow(attempt.min(31) as u32));
                    prop_assert!(delay <= ceiling);
                    if raw < ceiling {
                        prop_assert!(delay >= previous);
                        prop_assert!(delay >= raw);
                    } else {
                        prop_assert!(delay >= floor);
                    }
                    previous = delay;
                }
            }
        }
    }
}
