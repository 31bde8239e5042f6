//! Configuration fingerprinting for cache-drift detection.
//!
//! A fingerprint summarizes the parts of a query definition that affect the
//! shape of fetched data: the query text, the tracked field mappings, and
//! the parent-field selection. If the fingerprint stored with a cache entry
//! differs from the incoming request's fingerprint, the cached data cannot
//! serve as a baseline for incremental fetching and a full re-fetch is
//! required.

use sha2::{Digest, Sha256};

/// Deterministic token over the data-shaping parts of a query definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
  /// Compute a fingerprint. Pure: no I/O, no clock.
  ///
  /// Tracked fields are sorted before hashing so their configured order is
  /// irrelevant. The parent field participates even when absent, so turning
  /// parent tracking on or off changes the fingerprint.
  pub fn compute(query_text: &str, tracked_fields: &[String], parent_field: Option<&str>) -> Self {
    let mut fields: Vec<&str> = tracked_fields.iter().map(String::as_str).collect();
    fields.sort_unstable();
    fields.dedup();

    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query_text).as_bytes());
    hasher.update([0u8]);
    for field in fields {
      hasher.update(field.as_bytes());
      hasher.update([0u8]);
    }
    hasher.update([0u8]);
    match parent_field {
      Some(name) => hasher.update(name.as_bytes()),
      None => hasher.update(b"\x01"),
    }

    Self(hex::encode(hasher.finalize()))
  }

  /// Rehydrate a fingerprint previously persisted by the cache store.
  pub fn from_stored(token: String) -> Self {
    Self(token)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Normalize query text for consistent hashing.
/// Trims whitespace and lowercases for case-insensitive matching.
fn normalize_query(text: &str) -> String {
  text.trim().to_lowercase()
}
