//! Bounded polling with a fixed backoff
//!
//! Every wait in the platform (network attach, health gate, wake) goes
//! through this one primitive so attempt budgets and per-attempt timeouts are
//! enforced uniformly instead of re-derived at each call site.

use crate::error::Error;
use std::future::Future;
use std::time::Duration;

/// A bounded poll: up to `attempts` tries, `interval` apart, each individual
/// try cancelled after `attempt_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            // a stuck attempt may not outlive its slot
            attempt_timeout: interval.max(Duration::from_secs(1)),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Run `op` until it yields `Some(value)` or the attempt budget is spent.
    ///
    /// An attempt that hangs past `attempt_timeout` counts as a failure and
    /// the poll moves on; exhaustion is a distinct `PollTimeout` error.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 0..self.attempts {
            match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(_elapsed) => {}
            }

            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(Error::PollTimeout {
            attempts: self.attempts,
            interval: self.interval,
        })
    }
}
