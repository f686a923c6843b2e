//! Reconnect backoff policy.

use std::time::Duration;

use rand::Rng;

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
    /// Fraction of the delay that may be shaved off at random (0.0 - 1.0)
    pub jitter: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number, before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        if !delay.is_finite() {
            return self.max_delay_ms;
        }
        (delay as u32).min(self.max_delay_ms)
    }

    /// Delay for `attempt` scaled by a random factor in `[1 - jitter, 1]`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=1.0)
        } else {
            1.0
        };
        Duration::from_millis((base as f32 * factor) as u64)
    }

    /// Whether another attempt is allowed after `attempts` consecutive failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}
