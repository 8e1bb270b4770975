//! # Backoff policy for restarting crashed jobs.
//!
//! [`BackoffPolicy`] controls how restart delays grow across a burst of
//! failures. It is parameterized by:
//! - [`BackoffPolicy::first`] the initial delay;
//! - [`BackoffPolicy::factor`] the multiplicative growth factor;
//! - [`BackoffPolicy::max`] the maximum delay cap.
//!
//! The restart controller threads the previous delay back into
//! [`BackoffPolicy::next`] and resets it to `None` once a job has run long
//! enough to count as successfully started.

use std::time::Duration;

/// Restart backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Initial delay before the first restart.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// Returns the supervisor schedule: 1 s doubling up to 5 min.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the next delay based on the previous one.
    ///
    /// - If `prev` is `None`, returns `first` clamped to `max`.
    /// - Otherwise multiplies the previous delay by `factor` and caps the
    ///   result at `max`. Growth that overflows `Duration` (or a factor
    ///   that is not a finite positive number) saturates at the cap.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let grown = match prev {
            None => self.first,
            Some(prev) => Duration::try_from_secs_f64(prev.as_secs_f64() * self.factor)
                .unwrap_or(self.max),
        };
        grown.min(self.max)
    }
}
