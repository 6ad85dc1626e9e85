//! Retry backoff shared by the reconnect loop and the presence queue.

use std::time::Duration;

/// Exponential backoff policy.
///
/// Deliberately jitter-free: delivery and reconnect timing must be
/// deterministic and monotonically non-decreasing in the attempt number.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay for the zeroth attempt.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Attempts beyond this keep the same backoff value.
    pub max_backoff_attempt: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            factor: 1.5,
            max_delay: Duration::from_millis(5000),
            max_backoff_attempt: 6,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.max_backoff_attempt) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
