//! Domain types for synced issue-tracker data.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single issue as held in the cache.
///
/// The remote field schema varies per deployment, so `fields` is an open
/// mapping accessed by configured name rather than a fixed struct. An issue
/// update always replaces the whole record for its key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
  /// Stable external identifier, unique within a query's corpus.
  pub key: String,
  /// Story, Task, Bug, Epic, ... (open set).
  pub issue_type: String,
  pub fields: HashMap<String, serde_json::Value>,
  /// True for records fetched only for display context (epics/parents);
  /// excluded from all downstream calculations.
  #[serde(default)]
  pub is_parent: bool,
}

impl Issue {
  /// Key of the parent record referenced by this issue, read from the
  /// configured parent field. None when the field is absent, null, or not
  /// a string.
  pub fn parent_key(&self, parent_field: &str) -> Option<&str> {
    self.fields.get(parent_field).and_then(|v| v.as_str())
  }
}

/// One field change from an issue's changelog.
///
/// Immutable once stored; two fetches returning the same identity tuple
/// collapse to one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
  pub issue_key: String,
  pub change_date: DateTime<Utc>,
  pub field_name: String,
  pub old_value: String,
  pub new_value: String,
  /// Source-system tag used for downstream interpretation.
  pub field_type: String,
}

impl ChangelogEntry {
  /// Deduplication identity: `(issue_key, change_date, field_name,
  /// old_value, new_value)`.
  pub fn dedup_key(&self) -> (String, DateTime<Utc>, String, String, String) {
    (
      self.issue_key.clone(),
      self.change_date,
      self.field_name.clone(),
      self.old_value.clone(),
      self.new_value.clone(),
    )
  }
}
