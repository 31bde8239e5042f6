//! Merge engine: folds freshly fetched deltas into an existing cache entry.
//!
//! Deltas are always strictly newer than the state that produced the
//! existing entry, so issue merging is last-write-wins by key with no
//! timestamp comparison. Changelog entries are immutable facts: they are
//! deduplicated by identity, never overwritten. The result is a new entry;
//! persisting it (and discarding the old one) is the store's job.

use std::collections::HashSet;

use crate::cache::CacheEntry;
use crate::jira::types::{ChangelogEntry, Issue};

/// Canonical label for tracked sprint-like fields, so the same underlying
/// change is not double-counted across configuration changes that renamed
/// the tracked field.
pub const SPRINT_LABEL: &str = "Sprint";

/// Merge fetched deltas into `existing`, producing a new entry.
///
/// `tracked_fields` drives changelog field-name normalization: any tracked
/// field other than `status` is folded into the canonical sprint label
/// before dedup-key comparison. Validity metadata (`last_fetch_at`,
/// `valid_through`) is carried over unchanged; the orchestrator advances it
/// after a successful persist.
pub fn merge(
  existing: CacheEntry,
  delta_issues: Vec<Issue>,
  delta_changelog: Vec<ChangelogEntry>,
  delta_parents: Vec<Issue>,
  tracked_fields: &[String],
) -> CacheEntry {
  let mut merged = existing;

  // 1. Issues: the delta is authoritative; replace whole records by key.
  for issue in delta_issues {
    merged.issues.insert(issue.key.clone(), issue);
  }

  // 2. Changelog: identity-based set union. Stored entries are already
  // normalized, but normalize again so entries persisted under an older
  // field configuration still collapse.
  for entry in &mut merged.changelog {
    normalize_field_name(entry, tracked_fields);
  }
  let mut seen: HashSet<_> = merged.changelog.iter().map(|e| e.dedup_key()).collect();
  for mut entry in delta_changelog {
    normalize_field_name(&mut entry, tracked_fields);
    if seen.insert(entry.dedup_key()) {
      merged.changelog.push(entry);
    }
  }

  // 3. Parents: union by key. A parent no longer referenced by any issue is
  // kept; pruning is an explicit maintenance operation so parents churned
  // in and out across syncs are not re-fetched every time.
  for parent in delta_parents {
    merged.parents.insert(parent.key.clone(), parent);
  }

  // Orphaned changelog entries reference issues that left the corpus;
  // dropping them keeps the referenced-issue invariant.
  merged
    .changelog
    .retain(|entry| merged.issues.contains_key(&entry.issue_key));

  merged
}

/// Rename tracked sprint-like fields to the canonical label. `status` keeps
/// its own identity.
fn normalize_field_name(entry: &mut ChangelogEntry, tracked_fields: &[String]) {
  if entry.field_name != "status" && tracked_fields.iter().any(|f| f == &entry.field_name) {
    entry.field_name = SPRINT_LABEL.to_string();
  }
}

/// Explicit maintenance operation: drop parents no longer referenced by any
/// non-parent issue through the configured parent field.
pub fn prune_parents(entry: &mut CacheEntry, parent_field: &str) -> usize {
  let referenced: HashSet<&str> = entry
    .issues
    .values()
    .filter_map(|issue| issue.parent_key(parent_field))
    .collect();

  let before = entry.parents.len();
  entry.parents.retain(|key, _| referenced.contains(key.as_str()));
  before - entry.parents.len()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fingerprint::ConfigFingerprint;
  use chrono::{TimeZone, Utc};
  use std::collections::HashMap;

  fn issue(key: &str) -> Issue {
    Issue {
      key: key.to_string(),
      issue_type: "Story".to_string(),
      fields: HashMap::new(),
      is_parent: false,
    }
  }

  fn issue_with_parent(key: &str, parent: &str) -> Issue {
    let mut fields = HashMap::new();
    fields.insert("epic_link".to_string(), serde_json::json!(parent));
    Issue {
      key: key.to_string(),
      issue_type: "Story".to_string(),
      fields,
      is_parent: false,
    }
  }

  fn parent(key: &str) -> Issue {
    Issue {
      key: key.to_string(),
      issue_type: "Epic".to_string(),
      fields: HashMap::new(),
      is_parent: true,
    }
  }

  fn change(key: &str, day: u32, field: &str, new_value: &str) -> ChangelogEntry {
    ChangelogEntry {
      issue_key: key.to_string(),
      change_date: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
      field_name: field.to_string(),
      old_value: String::new(),
      new_value: new_value.to_string(),
      field_type: "jira".to_string(),
    }
  }

  fn empty_entry() -> CacheEntry {
    CacheEntry {
      issues: HashMap::new(),
      changelog: Vec::new(),
      parents: HashMap::new(),
      last_fetch_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
      fingerprint: ConfigFingerprint::compute("project = A", &[], None),
      valid_through: None,
    }
  }

  #[test]
  fn test_delta_issue_replaces_existing_by_key() {
    let mut existing = empty_entry();
    let mut old = issue("A-1");
    old.fields.insert("summary".to_string(), serde_json::json!("old"));
    existing.issues.insert("A-1".to_string(), old);

    let mut new = issue("A-1");
    new.fields.insert("summary".to_string(), serde_json::json!("new"));
    let merged = merge(existing, vec![new], vec![], vec![], &[]);

    assert_eq!(merged.issues.len(), 1);
    assert_eq!(merged.issues["A-1"].fields["summary"], "new");
  }

  #[test]
  fn test_changelog_dedup_by_identity_tuple() {
    let mut existing = empty_entry();
    existing.issues.insert("A-1".to_string(), issue("A-1"));
    existing.changelog.push(change("A-1", 7, "status", "Done"));

    // Re-sent day-7 entry plus a genuinely new one.
    let merged = merge(
      existing,
      vec![],
      vec![change("A-1", 7, "status", "Done"), change("A-1", 8, "status", "Closed")],
      vec![],
      &[],
    );

    assert_eq!(merged.changelog.len(), 2);
    let keys: HashSet<_> = merged.changelog.iter().map(|e| e.dedup_key()).collect();
    assert_eq!(keys.len(), 2);
  }

  #[test]
  fn test_tracked_field_normalized_to_sprint_before_dedup() {
    let tracked = vec!["customfield_10020".to_string()];

    let mut existing = empty_entry();
    existing.issues.insert("A-1".to_string(), issue("A-1"));
    existing.changelog.push({
      let mut e = change("A-1", 5, "Sprint", "Sprint 9");
      e.field_name = SPRINT_LABEL.to_string();
      e
    });

    // Same underlying change re-fetched under the raw field name.
    let merged = merge(
      existing,
      vec![],
      vec![change("A-1", 5, "customfield_10020", "Sprint 9")],
      vec![],
      &tracked,
    );

    assert_eq!(merged.changelog.len(), 1);
    assert_eq!(merged.changelog[0].field_name, SPRINT_LABEL);
  }

  #[test]
  fn test_status_field_never_renamed() {
    let tracked = vec!["status".to_string(), "customfield_10020".to_string()];

    let mut existing = empty_entry();
    existing.issues.insert("A-1".to_string(), issue("A-1"));

    let merged = merge(
      existing,
      vec![],
      vec![change("A-1", 5, "status", "Done")],
      vec![],
      &tracked,
    );

    assert_eq!(merged.changelog[0].field_name, "status");
  }

  #[test]
  fn test_orphaned_changelog_discarded() {
    let existing = empty_entry();

    let merged = merge(
      existing,
      vec![issue("A-1")],
      vec![change("A-1", 5, "status", "Done"), change("A-999", 5, "status", "Done")],
      vec![],
      &[],
    );

    assert_eq!(merged.changelog.len(), 1);
    assert_eq!(merged.changelog[0].issue_key, "A-1");
  }

  #[test]
  fn test_unreferenced_parent_not_eagerly_pruned() {
    let mut existing = empty_entry();
    existing.parents.insert("A-100".to_string(), parent("A-100"));
    existing
      .issues
      .insert("A-1".to_string(), issue_with_parent("A-1", "A-200"));

    let merged = merge(existing, vec![], vec![], vec![parent("A-200")], &[]);

    assert_eq!(merged.parents.len(), 2);
    assert!(merged.parents.contains_key("A-100"));
  }

  #[test]
  fn test_prune_parents_drops_only_unreferenced() {
    let mut entry = empty_entry();
    entry
      .issues
      .insert("A-1".to_string(), issue_with_parent("A-1", "A-200"));
    entry.parents.insert("A-100".to_string(), parent("A-100"));
    entry.parents.insert("A-200".to_string(), parent("A-200"));

    let pruned = prune_parents(&mut entry, "epic_link");

    assert_eq!(pruned, 1);
    assert!(entry.parents.contains_key("A-200"));
    assert!(!entry.parents.contains_key("A-100"));
  }

  #[test]
  fn test_merge_is_idempotent() {
    let mut existing = empty_entry();
    existing.issues.insert("A-1".to_string(), issue("A-1"));
    existing.changelog.push(change("A-1", 5, "status", "Done"));

    let delta_issues = vec![issue("A-1")];
    let delta_changelog = vec![change("A-1", 5, "status", "Done")];

    let once = merge(
      existing,
      delta_issues.clone(),
      delta_changelog.clone(),
      vec![],
      &[],
    );
    let twice = merge(once.clone(), delta_issues, delta_changelog, vec![], &[]);

    assert_eq!(once.issues.len(), twice.issues.len());
    assert_eq!(once.changelog.len(), twice.changelog.len());
    assert_eq!(once.parents.len(), twice.parents.len());
  }
}
