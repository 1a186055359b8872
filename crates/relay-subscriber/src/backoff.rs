//! Reconnect delay schedule.

use std::time::Duration;

use rand::Rng;

use crate::config::SubscriberConfig;

/// Exponential backoff: `initial * 2^attempt`, capped at `max`, with optional
/// jitter of `delay * (1 ± jitter)`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &SubscriberConfig) -> Self {
        Self::new(
            config.backoff_initial(),
            config.backoff_max(),
            config.backoff_jitter,
        )
    }

    /// Delay to wait before the next dial. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        // 2^16 * any sane initial is already past any sane cap
        let exp = self.initial.as_millis() as f64 * 2.0_f64.powi(self.attempt.min(16) as i32);
        let capped = exp.min(self.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter <= 0.0 || capped <= 0.0 {
            return Duration::from_millis(capped as u64);
        }
        let range = capped * self.jitter;
        let spread = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((capped + spread).max(0.0) as u64)
    }

    /// Back to the initial delay. Called after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
