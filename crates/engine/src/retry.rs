//! Bounded retry with backoff.
//!
//! One policy type shared by file renames, moves, removals and the encoder
//! validation pass. Each call site picks its attempt budget, backoff shape and
//! which errors are worth retrying.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause before every retry.
    Fixed(Duration),
    /// `base * 2^(retry - 1)`.
    Exponential(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential(base),
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Pause before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential(base) => {
                let shift = retry.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift)
            }
        }
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// budget is spent. The last error is returned on exhaustion.
    pub async fn run<T, E, F, Fut, P>(&self, what: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed: {}",
                        what,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
