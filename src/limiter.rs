//! Token-bucket throttle guarding all outbound API calls.
//!
//! The remote enforces one global rate limit, not per-query limits, so a
//! single process-wide limiter is shared by every client instance. `acquire`
//! is the only suspension point in the fetch path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::SyncError;

#[derive(Debug)]
struct BucketState {
  tokens: f64,
  last_refill: Instant,
}

/// Token-bucket rate limiter with lazy refill.
///
/// Tokens accumulate at `refill_per_sec` up to `capacity`. An `acquire`
/// debits its cost, sleeping until enough tokens are available. Tokens never
/// go negative and never exceed capacity.
#[derive(Debug, Clone)]
pub struct RateLimiter {
  capacity: f64,
  refill_per_sec: f64,
  state: Arc<Mutex<BucketState>>,
}

impl RateLimiter {
  /// Build a limiter. Both parameters must be positive and finite; a
  /// bucket that never refills would suspend acquirers forever, so such
  /// configurations are rejected here instead of failing mid-sync.
  pub fn new(capacity: f64, refill_per_sec: f64) -> Result<Self, SyncError> {
    if !capacity.is_finite() || capacity <= 0.0 {
      return Err(SyncError::Configuration(format!(
        "rate limit capacity must be positive, got {}",
        capacity
      )));
    }
    if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
      return Err(SyncError::Configuration(format!(
        "rate limit refill rate must be positive, got {}",
        refill_per_sec
      )));
    }

    Ok(Self {
      capacity,
      refill_per_sec,
      state: Arc::new(Mutex::new(BucketState {
        tokens: capacity,
        last_refill: Instant::now(),
      })),
    })
  }

  /// Wait until `cost` tokens are available, then debit them.
  ///
  /// A cost above capacity can never be satisfied and is rejected
  /// immediately instead of suspending forever.
  pub async fn acquire(&self, cost: u32) -> Result<(), SyncError> {
    let cost = f64::from(cost);
    if cost > self.capacity {
      return Err(SyncError::Configuration(format!(
        "rate limit cost {} exceeds bucket capacity {}",
        cost, self.capacity
      )));
    }

    loop {
      let wait = {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= cost {
          state.tokens -= cost;
          return Ok(());
        }

        // Not enough tokens; sleep for the exact deficit, then re-check.
        let deficit = cost - state.tokens;
        Duration::from_secs_f64(deficit / self.refill_per_sec)
      };

      tokio::time::sleep(wait).await;
    }
  }

  fn refill(&self, state: &mut BucketState) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    state.last_refill = now;
  }

  /// Current token count, refilled to the present moment. Used by tests and
  /// diagnostics, never by the fetch path.
  pub async fn available(&self) -> f64 {
    let mut state = self.state.lock().await;
    self.refill(&mut state);
    state.tokens
  }
}
