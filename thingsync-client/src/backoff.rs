//! Reconnect backoff
//!
//! The delay before retry `n` (starting at 1) is
//!
//! ```text
//! delay[n] = min(base * 2^(n-1), max)
//! ```
//!
//! Once `max_retries` delays have been handed out the next request fails with
//! [`BackoffError::MaxRetriesExceeded`]; the connection manager treats that as
//! the end of the session. A successful connection resets the counter.

use std::time::Duration;

use thiserror::Error;

/// Retry budget exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("Maximum number of reconnect attempts exceeded: {0}")]
    MaxRetriesExceeded(u32),
}

/// Exponential backoff for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_retries,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Result<Duration, BackoffError> {
        if self.attempt >= self.max_retries {
            return Err(BackoffError::MaxRetriesExceeded(self.max_retries));
        }
        self.attempt += 1;

        // 2^31 already overflows any realistic base delay
        let exponent = (self.attempt - 1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        Ok(delay)
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_capped() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_secs(3), Duration::from_secs(30), 6);

        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 30, 30]);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(100), 2);
        assert!(backoff.next_delay().is_ok());
        assert!(backoff.next_delay().is_ok());
        assert_eq!(
            backoff.next_delay(),
            Err(BackoffError::MaxRetriesExceeded(2))
        );
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 5);
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(3), Duration::from_secs(30), 100);
        for _ in 0..99 {
            backoff.next_delay().unwrap();
        }
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(2), 0);
        assert!(backoff.next_delay().is_err());
    }
}
