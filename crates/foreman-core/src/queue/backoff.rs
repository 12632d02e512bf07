//! Exponential backoff.

use std::time::Duration;

/// Capped exponential backoff.
///
/// `delay = base_delay * multiplier^(attempts - 1)`, never above `max_delay`.
///
/// Example with base_delay=5s, multiplier=2.0, max_delay=300s:
/// - attempt 1: 5s
/// - attempt 2: 10s
/// - attempt 7: 300s (320s clamped)
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            max_delay,
        }
    }

    /// Worker throttling: 5s doubling up to 5 minutes.
    pub fn throttle() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    /// Store contention: short waits between read-modify-write attempts.
    pub fn contention() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(500))
    }

    /// Delay before the next attempt, given how many attempts have failed.
    /// `attempts == 0` is treated as 1.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::throttle()
    }
}
