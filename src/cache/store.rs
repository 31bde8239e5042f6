//! Cache storage trait and SQLite implementation.
//!
//! One entry per (profile, query) pair, holding issues, changelog entries,
//! parent records, the validity window, and the fingerprint of the query
//! configuration that produced them. A store replaces the whole entry inside
//! a single transaction, so a crash between fetch and persist always leaves
//! the previous entry intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};

use crate::fingerprint::ConfigFingerprint;
use crate::jira::types::{ChangelogEntry, Issue};

/// Cached state for one (profile, query) pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// Non-parent issues by key.
  pub issues: HashMap<String, Issue>,
  pub changelog: Vec<ChangelogEntry>,
  /// Parent/epic records by key, `is_parent = true`.
  pub parents: HashMap<String, Issue>,
  pub last_fetch_at: DateTime<Utc>,
  /// Fingerprint of the query configuration that produced this entry.
  pub fingerprint: ConfigFingerprint,
  /// How far forward data is known-complete. Never regresses except on
  /// explicit invalidation.
  pub valid_through: Option<DateTime<Utc>>,
}

/// Trait for cache storage backends.
pub trait CacheStore: Send + Sync {
  /// Load the entry for a key, if one exists.
  fn load(&self, profile_id: &str, query_id: &str) -> Result<Option<CacheEntry>>;

  /// Durably replace the entry for a key. All-or-nothing: on failure the
  /// previously stored entry survives unchanged.
  fn store(&self, profile_id: &str, query_id: &str, entry: &CacheEntry) -> Result<()>;

  /// Drop all cached state for a key.
  fn purge(&self, profile_id: &str, query_id: &str) -> Result<()>;
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    Self::open(&path)
  }

  /// Open the store at an explicit path.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tracksync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Per-(profile, query) sync metadata
CREATE TABLE IF NOT EXISTS sync_state (
    profile_id TEXT NOT NULL,
    query_id TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    last_fetch_at TEXT NOT NULL,
    valid_through TEXT,
    PRIMARY KEY (profile_id, query_id)
);

-- Issues and parent records (open field map stored as JSON)
CREATE TABLE IF NOT EXISTS issues (
    profile_id TEXT NOT NULL,
    query_id TEXT NOT NULL,
    issue_key TEXT NOT NULL,
    issue_type TEXT NOT NULL,
    is_parent INTEGER NOT NULL DEFAULT 0,
    fields BLOB NOT NULL,
    PRIMARY KEY (profile_id, query_id, issue_key)
);

-- Changelog entries; the primary key is the dedup identity tuple
CREATE TABLE IF NOT EXISTS changelog (
    profile_id TEXT NOT NULL,
    query_id TEXT NOT NULL,
    issue_key TEXT NOT NULL,
    change_date TEXT NOT NULL,
    field_name TEXT NOT NULL,
    old_value TEXT NOT NULL,
    new_value TEXT NOT NULL,
    field_type TEXT NOT NULL,
    PRIMARY KEY (profile_id, query_id, issue_key, change_date, field_name, old_value, new_value)
);

CREATE INDEX IF NOT EXISTS idx_changelog_issue
    ON changelog(profile_id, query_id, issue_key);
"#;

impl CacheStore for SqliteStore {
  fn load(&self, profile_id: &str, query_id: &str) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT fingerprint, last_fetch_at, valid_through FROM sync_state
         WHERE profile_id = ? AND query_id = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let meta: Option<(String, String, Option<String>)> = stmt
      .query_row(params![profile_id, query_id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .ok();

    let (fingerprint, last_fetch_at, valid_through) = match meta {
      Some(meta) => meta,
      None => return Ok(None),
    };

    let mut issues = HashMap::new();
    let mut parents = HashMap::new();
    {
      let mut stmt = conn
        .prepare(
          "SELECT issue_key, issue_type, is_parent, fields FROM issues
           WHERE profile_id = ? AND query_id = ?",
        )
        .map_err(|e| eyre!("Failed to prepare issue query: {}", e))?;

      let rows = stmt
        .query_map(params![profile_id, query_id], |row| {
          let key: String = row.get(0)?;
          let issue_type: String = row.get(1)?;
          let is_parent: bool = row.get(2)?;
          let fields: Vec<u8> = row.get(3)?;
          Ok((key, issue_type, is_parent, fields))
        })
        .map_err(|e| eyre!("Failed to query issues: {}", e))?;

      for row in rows {
        let (key, issue_type, is_parent, fields) =
          row.map_err(|e| eyre!("Failed to read issue row: {}", e))?;
        let fields = serde_json::from_slice(&fields)
          .map_err(|e| eyre!("Failed to deserialize issue fields: {}", e))?;
        let issue = Issue {
          key: key.clone(),
          issue_type,
          fields,
          is_parent,
        };
        if is_parent {
          parents.insert(key, issue);
        } else {
          issues.insert(key, issue);
        }
      }
    }

    let mut changelog = Vec::new();
    {
      let mut stmt = conn
        .prepare(
          "SELECT issue_key, change_date, field_name, old_value, new_value, field_type
           FROM changelog WHERE profile_id = ? AND query_id = ?
           ORDER BY change_date, issue_key",
        )
        .map_err(|e| eyre!("Failed to prepare changelog query: {}", e))?;

      let rows = stmt
        .query_map(params![profile_id, query_id], |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
          ))
        })
        .map_err(|e| eyre!("Failed to query changelog: {}", e))?;

      for row in rows {
        let (issue_key, change_date, field_name, old_value, new_value, field_type) =
          row.map_err(|e| eyre!("Failed to read changelog row: {}", e))?;
        changelog.push(ChangelogEntry {
          issue_key,
          change_date: parse_datetime(&change_date)?,
          field_name,
          old_value,
          new_value,
          field_type,
        });
      }
    }

    Ok(Some(CacheEntry {
      issues,
      changelog,
      parents,
      last_fetch_at: parse_datetime(&last_fetch_at)?,
      fingerprint: ConfigFingerprint::from_stored(fingerprint),
      valid_through: valid_through.as_deref().map(parse_datetime).transpose()?,
    }))
  }

  fn store(&self, profile_id: &str, query_id: &str, entry: &CacheEntry) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Whole-entry replace in one transaction; rollback on any failure
    // leaves the previous entry untouched.
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM issues WHERE profile_id = ? AND query_id = ?",
      params![profile_id, query_id],
    )
    .map_err(|e| eyre!("Failed to clear issues: {}", e))?;
    tx.execute(
      "DELETE FROM changelog WHERE profile_id = ? AND query_id = ?",
      params![profile_id, query_id],
    )
    .map_err(|e| eyre!("Failed to clear changelog: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO sync_state (profile_id, query_id, fingerprint, last_fetch_at, valid_through)
       VALUES (?, ?, ?, ?, ?)",
      params![
        profile_id,
        query_id,
        entry.fingerprint.as_str(),
        format_datetime(entry.last_fetch_at),
        entry.valid_through.map(format_datetime),
      ],
    )
    .map_err(|e| eyre!("Failed to store sync state: {}", e))?;

    for issue in entry.issues.values().chain(entry.parents.values()) {
      let fields = serde_json::to_vec(&issue.fields)
        .map_err(|e| eyre!("Failed to serialize issue fields: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO issues (profile_id, query_id, issue_key, issue_type, is_parent, fields)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          profile_id,
          query_id,
          issue.key,
          issue.issue_type,
          issue.is_parent,
          fields
        ],
      )
      .map_err(|e| eyre!("Failed to store issue: {}", e))?;
    }

    for change in &entry.changelog {
      tx.execute(
        "INSERT OR IGNORE INTO changelog (profile_id, query_id, issue_key, change_date, field_name, old_value, new_value, field_type)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          profile_id,
          query_id,
          change.issue_key,
          format_datetime(change.change_date),
          change.field_name,
          change.old_value,
          change.new_value,
          change.field_type
        ],
      )
      .map_err(|e| eyre!("Failed to store changelog entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn purge(&self, profile_id: &str, query_id: &str) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for table in ["sync_state", "issues", "changelog"] {
      tx.execute(
        &format!("DELETE FROM {} WHERE profile_id = ? AND query_id = ?", table),
        params![profile_id, query_id],
      )
      .map_err(|e| eyre!("Failed to purge {}: {}", table, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit purge: {}", e))?;

    Ok(())
  }
}

/// In-memory store. Used by tests and by callers that opt out of
/// persistence; all data is lost on drop.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn load(&self, profile_id: &str, query_id: &str) -> Result<Option<CacheEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(&(profile_id.to_string(), query_id.to_string())).cloned())
  }

  fn store(&self, profile_id: &str, query_id: &str, entry: &CacheEntry) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(
      (profile_id.to_string(), query_id.to_string()),
      entry.clone(),
    );
    Ok(())
  }

  fn purge(&self, profile_id: &str, query_id: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(&(profile_id.to_string(), query_id.to_string()));
    Ok(())
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339()
}

/// Parse a datetime string stored by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
