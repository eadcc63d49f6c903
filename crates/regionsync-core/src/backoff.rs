//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Doubles from `initial` up to `max` on every failure; resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
            jitter: true,
        }
    }

    /// Disable jitter, so delays are exactly `initial * 2^n` capped at `max`.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait before the next attempt; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        if !self.jitter || base.is_zero() {
            return base;
        }
        // Up to 25% extra, never beyond the cap.
        let spread = (base.as_millis() as u64 / 4).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(extra)).min(self.max)
    }

    /// Delay the next call to [`Backoff::next_delay`] would start from.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
