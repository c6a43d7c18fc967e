//! In-memory cache for remote responses
//!
//! This module provides a key/value store with a per-entry TTL. Stale entries
//! are still returned (flagged with `is_fresh = false`) so that callers can
//! keep showing old data while a refresh is pending.

mod store;

pub use store::{CacheStore, CachedData};
