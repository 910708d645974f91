//! Bounded retry of operation attempts

use crate::config::Timeouts;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Attempt count and fixed pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl From<&Timeouts> for RetryPolicy {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            max_attempts: timeouts.max_attempts,
            backoff: timeouts.retry_backoff(),
        }
    }
}

/// Run `attempt` until it succeeds, fails fatally, or the attempts run out.
///
/// Attempts are numbered from 1. The pause only happens between attempts.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    info!(operation, attempt = n, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retriable() => {
                warn!(operation, attempt = n, error = %e, "Fatal error, not retrying");
                return Err(e);
            }
            Err(e) => {
                warn!(operation, attempt = n, max_attempts, error = %e, "Attempt failed");
                last_error = Some(e);
                if n < max_attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }

    Err(Error::AttemptsExhausted {
        operation: operation.to_string(),
        attempts: max_attempts,
        source: Box::new(
            last_error.unwrap_or_else(|| Error::Internal("no attempt was made".into())),
        ),
    })
}
