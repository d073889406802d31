//! Retry policies for sensor acquisition.
//!
//! Two independent levels exist:
//!
//! - [`OperationRetry`] wraps a single link operation (one write or one read)
//!   and retries it a few times with a linearly growing delay.
//! - [`RoundBackoff`] spaces out whole scheduler rounds with an exponentially
//!   growing delay.
//!
//! An operation may exhaust its own attempts inside one round, after which
//! the sensor as a whole is retried in the next round.

use crate::link::LinkError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Per-operation retry: up to `attempts` tries, sleeping `base_delay * n`
/// after failed attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for OperationRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl OperationRetry {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `op` until it succeeds, fails with a non-transport error, or the
    /// attempts are used up. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, LinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LinkError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transport() && attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        "{operation} failed (attempt {attempt} of {attempts}): {err}, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Inter-round backoff for the batch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundBackoff {
    /// Total number of rounds, including the first one.
    pub rounds: u32,
    /// Delay before the second round; doubles for every further round.
    pub base_delay: Duration,
}

impl Default for RoundBackoff {
    fn default() -> Self {
        Self {
            rounds: 6,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RoundBackoff {
    /// Delay before round `round` (0-based): nothing before round 0,
    /// `base * 2^(round - 1)` afterwards.
    pub fn delay_before(&self, round: u32) -> Option<Duration> {
        match round {
            0 => None,
            n => Some(self.base_delay.saturating_mul(2u32.saturating_pow(n - 1))),
        }
    }
}
