use std::time::Duration;

/// Exponential reconnect schedule with a cap on both delay and attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before the 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for(attempt))
    }

    /// Sum of all delays, i.e. how long a full failed reconnect cycle waits.
    pub fn total_delay(&self) -> Duration {
        self.schedule().fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}
