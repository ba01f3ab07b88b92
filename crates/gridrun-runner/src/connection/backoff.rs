//! Bounded exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Reconnection backoff policy: initial delay, multiplicative growth, capped
/// maximum, plus a random jitter fraction.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Jitter fraction in `[0, 1]`; the delay is scaled by a random value in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before the given retry attempt (0-based), without jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.factor.powi(attempt.min(32) as i32);
        Duration::from_secs_f64(grown.min(self.max.as_secs_f64()))
    }

    /// Delay before the given retry attempt (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * scale).min(self.max.as_secs_f64()))
    }
}
