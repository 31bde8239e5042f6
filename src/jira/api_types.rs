//! Serde-deserializable types matching Jira API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use std::collections::HashMap;

use serde::Deserialize;

use super::types::Issue;

// ============================================================================
// Search endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiIssue {
  pub key: String,
  #[serde(default)]
  pub fields: HashMap<String, serde_json::Value>,
}

impl ApiIssue {
  /// Convert to a domain issue. The issue type lives inside the open field
  /// map as `issuetype.name`.
  pub fn into_issue(self, is_parent: bool) -> Issue {
    let issue_type = self
      .fields
      .get("issuetype")
      .and_then(|v| v.get("name"))
      .and_then(|v| v.as_str())
      .unwrap_or("Unknown")
      .to_string();

    Issue {
      key: self.key,
      issue_type,
      fields: self.fields,
      is_parent,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiSearchResponse {
  #[serde(default)]
  pub issues: Vec<ApiIssue>,
  #[serde(rename = "startAt", default)]
  pub start_at: u64,
  #[serde(rename = "maxResults", default)]
  pub max_results: u64,
  #[serde(default)]
  pub total: u64,
}

// ============================================================================
// Changelog endpoint response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiChangelogItem {
  #[serde(default)]
  pub field: String,
  #[serde(rename = "fieldtype", default)]
  pub field_type: String,
  #[serde(rename = "fromString")]
  pub from_string: Option<String>,
  #[serde(rename = "toString")]
  pub to_string: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiChangelogHistory {
  #[serde(default)]
  pub created: String,
  #[serde(default)]
  pub items: Vec<ApiChangelogItem>,
}

#[derive(Debug, Deserialize)]
pub struct ApiChangelogResponse {
  #[serde(default)]
  pub values: Vec<ApiChangelogHistory>,
  #[serde(rename = "startAt", default)]
  pub start_at: u64,
  #[serde(rename = "maxResults", default)]
  pub max_results: u64,
  #[serde(default)]
  pub total: u64,
}
