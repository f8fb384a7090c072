/**
 * Exponential retry backoff
 *
 * The delay for attempt `n` is `first × factor^n`, clamped to `max`. It
 * paces per-key requeues and watch stream restarts alike.
 */
use std::time::Duration;

/// Exponential backoff applied to failed keys and failed watch cycles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// 5ms doubling up to 1000s.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay for the given attempt number (0-indexed).
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped_secs)
        }
    }
}
