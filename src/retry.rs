//! Retry policy for paginated fetch calls.
//!
//! Backoff control flow is expressed as a policy object consumed by the API
//! client rather than nested loops at every call site: max attempts, an
//! exponential delay schedule, and the retryable-error predicate from the
//! error taxonomy. 429 responses get an extended schedule since they mean
//! the limiter itself is mis-calibrated.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::SyncError;

/// Bounded exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Total attempts including the first one.
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Extra multiplier applied when the remote answered 429.
  pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 4,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
      rate_limit_multiplier: 4,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based: the delay after the
  /// first failure is `delay_for(1, ..)`).
  pub fn delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
    let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
    let delay = if rate_limited {
      exp.saturating_mul(self.rate_limit_multiplier)
    } else {
      exp
    };
    delay.min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// attempt cap is reached. Only the terminal outcome is surfaced.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let mut attempt = 1u32;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_retryable() => {
          let rate_limited = matches!(err, SyncError::RateLimitExceeded(_));
          // A 429 means the limiter is mis-calibrated, not that the remote
          // is down; it gets at least one retry regardless of the cap.
          let cap = if rate_limited {
            self.max_attempts.max(2)
          } else {
            self.max_attempts
          };
          if attempt >= cap {
            return Err(err);
          }
          let delay = self.delay_for(attempt, rate_limited);
          warn!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after failure"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
