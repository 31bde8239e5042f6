//! Sync core for issue-tracker dashboards.
//!
//! Keeps a durable local cache of issues, changelog entries, and parent
//! records per (profile, query) pair, and decides on every refresh whether
//! a full re-fetch, an incremental fetch, or no network call is required,
//! all while staying inside the remote API's rate limit.

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod jira;
pub mod limiter;
pub mod merge;
pub mod retry;
pub mod sync;

pub use cache::{CacheEntry, CacheStore, MemoryStore, SqliteStore};
pub use error::{ErrorKind, SyncError};
pub use fingerprint::ConfigFingerprint;
pub use jira::{ChangelogEntry, Issue, IssueSource, JiraClient};
pub use limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use sync::{Orchestrator, QueryDefinition, SyncResult, SyncStrategy};
