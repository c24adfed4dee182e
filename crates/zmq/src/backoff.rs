//! Retry timing for the initial connection sequence.
//!
//! A `Backoff` hands out the delay to wait before each retry and fails once
//! the attempt budget is spent. Every retry waits the same interval; the
//! client derives it from `reconnect_interval` / `max_reconnect_attempts`.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use lbros_zmq::backoff::Backoff;
//!
//! let mut backoff = Backoff::fixed(Duration::from_secs(5), 3);
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
//! assert!(backoff.next_sleep().is_err());
//! ```

use std::time::Duration;

use thiserror::Error;

/// Error type for backoff exhaustion.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Retry delay controller.
///
/// Each call to [`Backoff::next_sleep`] consumes one attempt. The counter is
/// cleared by [`Backoff::reset`] after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval: Duration,
    attempt: u32,
    /// Retries allowed between resets; 0 means never retry.
    max_attempts: u32,
}

impl Backoff {
    /// Creates a constant-interval backoff allowing `max_attempts` retries.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            attempt: 0,
            max_attempts,
        }
    }

    /// Clears the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the next sleep duration and consumes one attempt.
    ///
    /// Fails with [`BackoffError::MaxAttemptLimitError`] once the limit
    /// has been reached. The counter keeps advancing on failure, so repeated
    /// calls keep failing until [`Backoff::reset`].
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.max_attempts {
            return Err(BackoffError::MaxAttemptLimitError(self.max_attempts));
        }
        Ok(self.interval)
    }

    /// Returns true when another call to `next_sleep` would fail.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Number of retries handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// Matches the default reconnect settings: 5 retries, 5 seconds apart.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 5)
    }
}
