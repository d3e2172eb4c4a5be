//! Exponential reconnect backoff for the event stream.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay schedule: `initial * multiplier^n`, capped at `max`.
///
/// Delays strictly increase until they reach the cap and then stay there.
/// `reset` is called after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            // A multiplier of 1.0 would never grow.
            multiplier: if multiplier.is_finite() { multiplier.max(1.5) } else { 2.0 },
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.multiplier,
        )
    }
}
