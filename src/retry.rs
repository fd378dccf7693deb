//! Bounded retry policy shared by every external call.
//!
//! The same `RetryPolicy` value drives link connects, register reads and
//! writes, and document-sink writes. Callers iterate an [`Attempts`] cursor
//! instead of hand-rolling loops, which keeps the "at most N attempts, fixed
//! delay between them" contract in one place and lets the caller keep
//! exclusive borrows (e.g. a locked transport) across attempts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use textile_gateway::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(5, Duration::from_millis(200));
/// assert_eq!(policy.max_attempts(), 5);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    max_attempts: u32,

    /// Constant delay between two consecutive attempts.
    #[serde(with = "humantime_serde")]
    delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts, one second apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Total attempts allowed (never less than one).
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn total_delay(&self) -> Duration {
        self.delay * self.max_attempts().saturating_sub(1)
    }

    /// Start a fresh attempt cursor.
    pub fn attempts(&self) -> Attempts {
        Attempts {
            policy: *self,
            made: 0,
        }
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. Returns the last error on
    /// exhaustion.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = self.attempts();
        loop {
            let attempt = attempts.next_attempt().await;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempts.exhausted() => return Err(err),
                Err(_) => continue,
            }
        }
    }
}

/// Cursor over the attempts granted by a [`RetryPolicy`].
#[derive(Debug)]
pub struct Attempts {
    policy: RetryPolicy,
    made: u32,
}

impl Attempts {
    /// Wait as required and return the next 1-based attempt number, or `None`
    /// once every attempt has been handed out.
    pub async fn next(&mut self) -> Option<u32> {
        if self.exhausted() {
            return None;
        }
        Some(self.next_attempt().await)
    }

    /// Number of attempts handed out so far.
    pub fn made(&self) -> u32 {
        self.made
    }

    /// Whether no attempts remain.
    pub fn exhausted(&self) -> bool {
        self.made >= self.policy.max_attempts()
    }

    async fn next_attempt(&mut self) -> u32 {
        if self.made > 0 && !self.policy.delay.is_zero() {
            sleep(self.policy.delay).await;
        }
        self.made += 1;
        self.made
    }
}
