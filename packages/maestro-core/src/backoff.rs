//! Exponential backoff with jitter for reconnect loops.
//!
//! Every "connect, wait, retry" loop in this library shares this policy:
//! the delay doubles on each failed attempt up to a ceiling, with a small
//! random jitter so a fleet of nodes does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Default initial delay for the first retry.
const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Default ceiling for the delay.
const DEFAULT_CAP: Duration = Duration::from_secs(64);

/// Maximum jitter as a fraction of the raw delay.
const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff policy with jitter and reset.
///
/// `delay()` is a pure function of the internal attempt counter: it returns
/// `base * 2^attempts` plus jitter, capped at the ceiling, and increments the
/// counter. `reset()` returns the policy to its initial state after a
/// successful operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl Backoff {
    /// Creates a backoff policy with the given base delay and ceiling.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: 0,
        }
    }

    /// Returns the next delay and advances the internal counter.
    ///
    /// The sequence is non-decreasing: jitter is bounded by a quarter of the
    /// raw delay, which is always less than the next doubling, and the cap is
    /// applied after jitter.
    pub fn delay(&mut self) -> Duration {
        let raw = self
            .base
            .checked_mul(1u32.checked_shl(self.attempts).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        self.attempts = self.attempts.saturating_add(1);

        let jitter = raw.mul_f64(rand::thread_rng().gen_range(0.0..JITTER_FRACTION));
        (raw + jitter).min(self.cap)
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the policy to its initial state after a successful operation.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_non_decreasing_and_bounded() {
        let cap = Duration::from_secs(30);
        let mut backoff = Backoff::new(Duration::from_millis(500), cap);

        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.delay();
            assert!(delay >= previous, "sequence must be non-decreasing");
            assert!(delay <= cap, "sequence must be bounded by the ceiling");
            previous = delay;
        }
        assert_eq!(previous, cap);
    }

    #[test]
    fn reset_restores_first_call_range() {
        let base = Duration::from_secs(1);
        let mut backoff = Backoff::new(base, Duration::from_secs(64));

        for _ in 0..5 {
            backoff.delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);

        let first = backoff.delay();
        assert!(first >= base);
        assert!(first <= base.mul_f64(1.0 + JITTER_FRACTION));
    }

    #[test]
    fn attempt_counter_saturates_without_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        for _ in 0..100 {
            let delay = backoff.delay();
            assert!(delay <= Duration::from_secs(8));
        }
    }
}
