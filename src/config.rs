use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

use crate::sync::QueryDefinition;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Named external-system connections.
  pub profiles: BTreeMap<String, ProfileConfig>,
  #[serde(default)]
  pub rate_limit: RateLimitConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  /// Minutes before a validity window counts as stale.
  #[serde(default = "default_freshness_minutes")]
  pub freshness_minutes: i64,
  #[serde(default = "default_page_size")]
  pub page_size: u64,
  #[serde(default = "default_http_timeout_secs")]
  pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
  pub url: String,
  /// Saved queries scoped to this profile, by query id.
  pub queries: BTreeMap<String, QueryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  pub jql: String,
  /// Sprint-like fields tracked in the changelog (e.g., "customfield_10020").
  #[serde(default)]
  pub tracked_fields: Vec<String>,
  /// Field holding the parent/epic reference (e.g., "customfield_10014").
  pub parent_field: Option<String>,
  /// Cold-start window bound; omit to fetch from the beginning.
  pub since: Option<DateTime<Utc>>,
}

impl QueryConfig {
  pub fn to_definition(&self) -> QueryDefinition {
    QueryDefinition {
      jql: self.jql.clone(),
      tracked_fields: self.tracked_fields.clone(),
      parent_field: self.parent_field.clone(),
      since: self.since,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
  pub capacity: f64,
  pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      capacity: 10.0,
      refill_per_sec: 5.0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub rate_limit_multiplier: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 4,
      base_delay_ms: 500,
      max_delay_ms: 30_000,
      rate_limit_multiplier: 4,
    }
  }
}

impl RetryConfig {
  pub fn to_policy(&self) -> crate::retry::RetryPolicy {
    crate::retry::RetryPolicy {
      max_attempts: self.max_attempts,
      base_delay: std::time::Duration::from_millis(self.base_delay_ms),
      max_delay: std::time::Duration::from_millis(self.max_delay_ms),
      rate_limit_multiplier: self.rate_limit_multiplier,
    }
  }
}

fn default_freshness_minutes() -> i64 {
  5
}

fn default_page_size() -> u64 {
  50
}

fn default_http_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracksync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracksync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tracksync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tracksync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tracksync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks TRACKSYNC_TOKEN first, then JIRA_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("TRACKSYNC_TOKEN")
      .or_else(|_| std::env::var("JIRA_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set TRACKSYNC_TOKEN or JIRA_API_TOKEN environment variable.")
      })
  }
}
