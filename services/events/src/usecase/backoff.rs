use std::time::Duration;

use rand::RngExt as _;

/// Exponential backoff with equal jitter.
///
/// Attempt `n` (1-based) waits between half and all of
/// `min(initial * multiplier^(n-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Self::default()
        }
    }

    /// Upper bound of the delay for `attempt`, without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if !scaled_ms.is_finite() || scaled_ms >= self.max.as_millis() as f64 {
            self.max
        } else {
            Duration::from_millis(scaled_ms.round() as u64)
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let full = self.ceiling(attempt).as_millis() as u64;
        if full == 0 {
            return Duration::ZERO;
        }
        let half = full / 2;
        Duration::from_millis(rand::rng().random_range(half..=full))
    }
}
