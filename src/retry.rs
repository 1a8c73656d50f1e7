use crate::error::{Error, MaxRetryAttemptsError};
use log::*;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 50;
pub const DEFAULT_JITTER_MAGNITUDE_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means a single attempt.
    pub max_retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Each delay is moved by a uniform amount in `[-jitter, +jitter]`.
    pub jitter_magnitude_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            jitter_magnitude_ms: DEFAULT_JITTER_MAGNITUDE_MS,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retry_attempts: 0,
            retry_delay_ms: 0,
            jitter_magnitude_ms: 0,
        }
    }

    pub fn max_retry_attempts(mut self, n: u32) -> Self {
        self.max_retry_attempts = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn jitter_magnitude_ms(mut self, ms: u64) -> Self {
        self.jitter_magnitude_ms = ms;
        self
    }

    pub fn next_delay(&self) -> Duration {
        let jitter = if self.jitter_magnitude_ms == 0 {
            0
        } else {
            let m = i128::from(self.jitter_magnitude_ms);
            rand::rng().random_range(-m..=m)
        };

        let ms = (i128::from(self.retry_delay_ms) + jitter).clamp(0, i128::from(u64::MAX));
        Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
    }
}

#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// Known transient condition; try again after a delay.
    Retry,
    /// Anything else; stops the loop without using up attempts.
    Fatal(Error),
}

/// Runs `attempt` until it succeeds, fails fatally, or `1 + max_retry_attempts`
/// attempts have asked for a retry.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    let total = policy.max_retry_attempts.saturating_add(1);

    for n in 1..=total {
        match attempt().await {
            Outcome::Success(v) => return Ok(v),
            Outcome::Fatal(e) => return Err(e),
            Outcome::Retry => {}
        }

        if n == total {
            break;
        }

        let delay = policy.next_delay();
        debug!("attempt {n}/{total} asked for retry, pause for {delay:?}");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Err(MaxRetryAttemptsError::new("Failed", policy.max_retry_attempts).into())
}
