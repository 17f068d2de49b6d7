use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Classify, ErrorKind};

/// Upper bound for the pause between attempts, whatever the backoff says.
pub const MAX_DELAY: Duration = Duration::from_secs(300);

/// Bounded retry with a fixed (optionally growing) delay between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Multiplier applied to `delay` after each retry. 0 or 1 keeps it fixed.
    pub backoff_factor: f64,
    pub retryable: HashSet<ErrorKind>,
}

impl RetryPolicy {
    /// Kinds that are worth another attempt when talking to remote sites.
    pub fn transient_kinds() -> HashSet<ErrorKind> {
        [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::ServerError,
            ErrorKind::RedirectLimit,
        ]
        .into_iter()
        .collect()
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.delay_ms),
            backoff_factor: config.backoff_factor,
            retryable: Self::transient_kinds(),
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        if self.backoff_factor.is_nan() || self.backoff_factor <= 1.0 {
            return current;
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .map_or(MAX_DELAY, |grown| grown.min(MAX_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(1),
            backoff_factor: 0.0,
            retryable: Self::transient_kinds(),
        }
    }
}

/// Run `op` until it succeeds, fails with a kind outside
/// `policy.retryable`, or the attempt budget runs out. The last error is
/// returned untouched.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts || !policy.retryable.contains(&e.kind()) {
                    return Err(e);
                }
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
                attempt += 1;
            }
        }
    }
}
