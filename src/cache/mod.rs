//! Durable per-(profile, query) cache of synced issue-tracker data.
//!
//! This module provides the storage half of the sync core:
//! - One `CacheEntry` per (profile, query) pair
//! - Whole-entry atomic replace, so partial failures never corrupt state
//! - A SQLite backend for durability and an in-memory backend for tests

mod store;

pub use store::{CacheEntry, CacheStore, MemoryStore, SqliteStore};
