//! HTTP client for the remote issue-tracker API.
//!
//! All page requests pass through the shared rate limiter first, then run
//! under the retry policy. Pagination restarts from the failing page offset
//! on retry, never from the beginning.

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use crate::error::SyncError;
use crate::limiter::RateLimiter;
use crate::retry::RetryPolicy;

use super::api_types::{ApiChangelogResponse, ApiSearchResponse};
use super::types::{ChangelogEntry, Issue};

/// Source of remote issue-tracker data.
///
/// The orchestrator is generic over this trait so tests can script a fake
/// source without a network.
pub trait IssueSource {
  /// Fetch all issues matching `jql`, optionally restricted to those
  /// updated since the given instant.
  fn fetch_issues(
    &self,
    jql: &str,
    since: Option<DateTime<Utc>>,
    fields: &[String],
  ) -> impl std::future::Future<Output = Result<Vec<Issue>, SyncError>> + Send;

  /// Fetch changelog entries for the given issues, restricted to tracked
  /// fields (status is always included).
  fn fetch_changelog(
    &self,
    issue_keys: &[String],
    tracked_fields: &[String],
  ) -> impl std::future::Future<Output = Result<Vec<ChangelogEntry>, SyncError>> + Send;

  /// Fetch parent/epic records by key, marked `is_parent = true`.
  fn fetch_parents(
    &self,
    parent_keys: &[String],
  ) -> impl std::future::Future<Output = Result<Vec<Issue>, SyncError>> + Send;
}

/// Jira REST client: paginated search and changelog fetching.
#[derive(Clone)]
pub struct JiraClient {
  http: reqwest::Client,
  base_url: Url,
  token: String,
  limiter: RateLimiter,
  retry: RetryPolicy,
  page_size: u64,
}

impl JiraClient {
  pub fn new(
    base_url: &str,
    token: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
    page_size: u64,
    http_timeout: std::time::Duration,
  ) -> Result<Self, SyncError> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Configuration(format!("invalid base url {}: {}", base_url, e)))?;

    // Timeout applies per HTTP call, not per sync; a many-page sync may
    // legitimately run long.
    let http = reqwest::Client::builder()
      .timeout(http_timeout)
      .build()
      .map_err(|e| SyncError::Configuration(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      http,
      base_url,
      token,
      limiter,
      retry,
      page_size,
    })
  }

  /// One throttled, retried GET returning deserialized JSON.
  async fn get_page<T: serde::de::DeserializeOwned>(
    &self,
    what: &str,
    url: &Url,
  ) -> Result<T, SyncError> {
    self.retry.run(what, || self.get_once(url)).await
  }

  async fn get_once<T: serde::de::DeserializeOwned>(&self, url: &Url) -> Result<T, SyncError> {
    self.limiter.acquire(1).await?;

    let response = self
      .http
      .get(url.clone())
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(classify_transport_error)?;

    classify_status(response.status(), url.path())?;

    response
      .json::<T>()
      .await
      .map_err(|e| SyncError::Transient(format!("failed to decode response: {}", e)))
  }

  fn search_url(&self, jql: &str, start_at: u64, fields: &[String]) -> Result<Url, SyncError> {
    let mut url = self
      .base_url
      .join("rest/api/2/search")
      .map_err(|e| SyncError::Configuration(format!("invalid search url: {}", e)))?;

    let field_list = if fields.is_empty() {
      "*all".to_string()
    } else {
      // issuetype is always needed for classification.
      let mut names = vec!["issuetype".to_string()];
      names.extend(fields.iter().cloned());
      names.join(",")
    };

    url
      .query_pairs_mut()
      .append_pair("jql", jql)
      .append_pair("startAt", &start_at.to_string())
      .append_pair("maxResults", &self.page_size.to_string())
      .append_pair("fields", &field_list);
    Ok(url)
  }

  /// Run the paginated search loop, converting pages to domain issues.
  async fn search_all(
    &self,
    jql: &str,
    fields: &[String],
    is_parent: bool,
  ) -> Result<Vec<Issue>, SyncError> {
    let mut all = Vec::new();
    let mut start_at = 0u64;

    loop {
      let url = self.search_url(jql, start_at, fields)?;
      let page: ApiSearchResponse = self.get_page("search", &url).await?;

      let count = page.issues.len() as u64;
      debug!(jql, start_at, count, total = page.total, "fetched search page");

      all.extend(page.issues.into_iter().map(|i| i.into_issue(is_parent)));

      // Done when the server-reported total is reached or a short page
      // comes back.
      if start_at + count >= page.total || count < self.page_size {
        break;
      }
      start_at += count;
    }

    Ok(all)
  }
}

impl IssueSource for JiraClient {
  async fn fetch_issues(
    &self,
    jql: &str,
    since: Option<DateTime<Utc>>,
    fields: &[String],
  ) -> Result<Vec<Issue>, SyncError> {
    let effective_jql = match since {
      Some(since) => format!("({}) AND updated >= \"{}\"", jql, since.format("%Y-%m-%d %H:%M")),
      None => jql.to_string(),
    };

    self.search_all(&effective_jql, fields, false).await
  }

  async fn fetch_changelog(
    &self,
    issue_keys: &[String],
    tracked_fields: &[String],
  ) -> Result<Vec<ChangelogEntry>, SyncError> {
    let mut entries = Vec::new();

    for key in issue_keys {
      let mut start_at = 0u64;
      loop {
        let mut url = self
          .base_url
          .join(&format!("rest/api/2/issue/{}/changelog", key))
          .map_err(|e| SyncError::Configuration(format!("invalid changelog url: {}", e)))?;
        url
          .query_pairs_mut()
          .append_pair("startAt", &start_at.to_string())
          .append_pair("maxResults", &self.page_size.to_string());

        let page: ApiChangelogResponse = self.get_page("changelog", &url).await?;
        let count = page.values.len() as u64;
        debug!(issue = %key, start_at, count, total = page.total, "fetched changelog page");

        for history in page.values {
          let change_date = match parse_api_datetime(&history.created) {
            Some(dt) => dt,
            None => continue,
          };
          for item in history.items {
            let tracked =
              item.field == "status" || tracked_fields.iter().any(|f| f == &item.field);
            if !tracked {
              continue;
            }
            entries.push(ChangelogEntry {
              issue_key: key.clone(),
              change_date,
              field_name: item.field,
              old_value: item.from_string.unwrap_or_default(),
              new_value: item.to_string.unwrap_or_default(),
              field_type: item.field_type,
            });
          }
        }

        if start_at + count >= page.total || count < self.page_size {
          break;
        }
        start_at += count;
      }
    }

    Ok(entries)
  }

  async fn fetch_parents(&self, parent_keys: &[String]) -> Result<Vec<Issue>, SyncError> {
    let mut parents = Vec::new();

    // Key-list queries are bounded by JQL length limits; batch them.
    for batch in parent_keys.chunks(50) {
      if batch.is_empty() {
        continue;
      }
      let jql = format!("key in ({})", batch.join(","));
      parents.extend(self.search_all(&jql, &[], true).await?);
    }

    Ok(parents)
  }
}

/// Map a transport-level reqwest error into the taxonomy. Timeouts and
/// connection failures are transient; anything else at this layer is too,
/// since status-code classification already happened.
fn classify_transport_error(err: reqwest::Error) -> SyncError {
  SyncError::Transient(format!("transport failure: {}", err))
}

/// Map a response status into the error taxonomy: 429 means the limiter is
/// mis-calibrated, 401/403 mean retrying is pointless, any other failure
/// status is worth another attempt.
fn classify_status(status: reqwest::StatusCode, path: &str) -> Result<(), SyncError> {
  if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
    return Err(SyncError::RateLimitExceeded(format!("429 from {}", path)));
  }
  if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
    return Err(SyncError::Fatal(format!("{} from {}", status, path)));
  }
  if !status.is_success() {
    return Err(SyncError::Transient(format!("{} from {}", status, path)));
  }
  Ok(())
}

/// Jira emits `2024-01-15T10:30:00.000+0000`; tolerate plain RFC 3339 too.
fn parse_api_datetime(raw: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3f%z")
    .or_else(|_| DateTime::parse_from_rfc3339(raw))
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_api_datetime_jira_format() {
    let dt = parse_api_datetime("2024-01-15T10:30:00.000+0000").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
  }

  #[test]
  fn test_parse_api_datetime_rfc3339() {
    assert!(parse_api_datetime("2024-01-15T10:30:00Z").is_some());
  }

  #[test]
  fn test_parse_api_datetime_garbage() {
    assert!(parse_api_datetime("yesterday").is_none());
  }

  #[test]
  fn test_classify_status_rate_limited() {
    let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "/rest/api/2/search")
      .unwrap_err();
    assert!(matches!(err, SyncError::RateLimitExceeded(_)));
    assert!(err.is_retryable());
  }

  #[test]
  fn test_classify_status_auth_failures_fatal() {
    for status in [reqwest::StatusCode::UNAUTHORIZED, reqwest::StatusCode::FORBIDDEN] {
      let err = classify_status(status, "/rest/api/2/search").unwrap_err();
      assert!(matches!(err, SyncError::Fatal(_)));
      assert!(!err.is_retryable());
    }
  }

  #[test]
  fn test_classify_status_server_errors_transient() {
    for status in [
      reqwest::StatusCode::INTERNAL_SERVER_ERROR,
      reqwest::StatusCode::BAD_GATEWAY,
      reqwest::StatusCode::SERVICE_UNAVAILABLE,
    ] {
      let err = classify_status(status, "/rest/api/2/search").unwrap_err();
      assert!(matches!(err, SyncError::Transient(_)));
      assert!(err.is_retryable());
    }
  }

  #[test]
  fn test_classify_status_success_passes() {
    assert!(classify_status(reqwest::StatusCode::OK, "/rest/api/2/search").is_ok());
  }
}
