//! Error taxonomy for the sync path.
//!
//! Every failure inside fetch/merge/persist maps to one of these variants so
//! the orchestrator and retry policy can decide what to do without string
//! matching. The binary and storage edges still use color-eyre for context.

use serde::{Deserialize, Serialize};

/// Errors produced by the sync path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
  /// Network/timeout failure. Retried with bounded exponential backoff.
  #[error("transient fetch failure: {0}")]
  Transient(String),

  /// HTTP 429 from the remote. The limiter is mis-calibrated; retried with
  /// extended backoff.
  #[error("remote rate limit exceeded: {0}")]
  RateLimitExceeded(String),

  /// Auth/permission failure (401/403). Never retried.
  #[error("fatal fetch failure: {0}")]
  Fatal(String),

  /// Malformed configuration (impossible limiter cost, bad fingerprint
  /// inputs). Never retried.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// A sync for the same (profile, query) key is already running.
  #[error("sync already in progress for {profile_id}/{query_id}")]
  SyncInProgress { profile_id: String, query_id: String },

  /// Local cache store failure. Never retried by the fetch path; the
  /// caller decides.
  #[error("cache store failure: {0}")]
  Storage(String),
}

impl SyncError {
  /// Whether the retry policy may attempt this operation again.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Transient(_) | Self::RateLimitExceeded(_))
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Transient(_) => ErrorKind::Transient,
      Self::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
      Self::Fatal(_) => ErrorKind::Fatal,
      Self::Configuration(_) => ErrorKind::Configuration,
      Self::SyncInProgress { .. } => ErrorKind::SyncInProgress,
      Self::Storage(_) => ErrorKind::Storage,
    }
  }
}

/// Serializable tag carried in a sync summary when the run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Transient,
  RateLimitExceeded,
  Fatal,
  Configuration,
  SyncInProgress,
  Storage,
}
