//! Cache store keeping the last good response for every fetch key
//!
//! Values are kept as JSON so one store can hold every resource type; callers
//! read them back into their own types and always receive an owned copy.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A stored value together with its freshness window
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Result of reading from the cache, including freshness metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CachedData<T> {
    /// The cached value
    pub data: T,
    /// When the value was stored
    pub stored_at: Instant,
    /// Whether the entry is still inside its TTL
    pub is_fresh: bool,
}

/// Thread-safe TTL cache shared by the coordinator and the engine
///
/// Writes are last-writer-wins: when two fetches for the same key complete
/// close together, the one completing last replaces the other.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl CacheStore {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a value from the cache
    ///
    /// Returns `None` if the key is absent or the stored value does not
    /// decode into `T`. Expired entries are returned with `is_fresh = false`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CachedData<T>> {
        let entry = self.lock().get(key).cloned()?;
        let data = serde_json::from_value(entry.value.clone()).ok()?;

        Some(CachedData {
            data,
            stored_at: entry.stored_at,
            is_fresh: entry.is_fresh(Instant::now()),
        })
    }

    /// Whether `key` holds a value inside its TTL
    pub fn is_fresh(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(key)
            .map(|entry| entry.is_fresh(now))
            .unwrap_or(false)
    }

    /// Stores a value under `key`, replacing any previous entry
    pub fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(data)?;
        self.set_value(key, value, ttl);
        Ok(())
    }

    /// Stores an already-encoded value under `key`
    pub fn set_value(&self, key: &str, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl,
        };
        self.lock().insert(key.to_string(), entry);
    }

    /// Removes a single key
    pub fn invalidate(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Removes every key
    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    /// Drops entries whose TTL has elapsed
    pub fn remove_expired(&self) {
        let now = Instant::now();
        self.lock().retain(|_, entry| entry.is_fresh(now));
    }

    /// Number of stored entries, fresh or not
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_get_returns_none_for_missing_key() {
        let cache = CacheStore::new();
        let result: Option<CachedData<TestData>> = cache.get("nonexistent_key");
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_is_fresh_then_stale_but_still_returned() {
        let cache = CacheStore::new();
        cache
            .set("m", &42u64, Duration::from_millis(1000))
            .expect("Set should succeed");

        tokio::time::advance(Duration::from_millis(500)).await;
        let cached: CachedData<u64> = cache.get("m").expect("Should be present");
        assert_eq!(cached.data, 42);
        assert!(cached.is_fresh);

        tokio::time::advance(Duration::from_millis(1000)).await;
        let cached: CachedData<u64> = cache.get("m").expect("Stale value is still returned");
        assert_eq!(cached.data, 42);
        assert!(!cached.is_fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_turns_stale_exactly_at_ttl() {
        let cache = CacheStore::new();
        cache
            .set("k", &1u8, Duration::from_millis(100))
            .expect("Set should succeed");

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(cache.is_fresh("k"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.is_fresh("k"));
    }

    #[test]
    fn test_overwrite_replaces_whole_entry() {
        let cache = CacheStore::new();
        let first = TestData {
            name: "first".to_string(),
            value: 1,
        };
        let second = TestData {
            name: "second".to_string(),
            value: 2,
        };

        cache.set("key", &first, Duration::from_secs(30)).expect("First set");
        cache.set("key", &second, Duration::from_secs(30)).expect("Second set");

        let result: CachedData<TestData> = cache.get("key").expect("Should read cache");
        assert_eq!(result.data, second);
    }

    #[test]
    fn test_invalidate_removes_only_that_key() {
        let cache = CacheStore::new();
        cache.set("a", &1u8, Duration::from_secs(30)).expect("Set a");
        cache.set("b", &2u8, Duration::from_secs(30)).expect("Set b");

        cache.invalidate("a");

        assert!(cache.get::<u8>("a").is_none());
        assert_eq!(cache.get::<u8>("b").map(|c| c.data), Some(2));
    }

    #[test]
    fn test_invalidate_all_empties_cache() {
        let cache = CacheStore::new();
        cache.set("a", &1u8, Duration::from_secs(30)).expect("Set a");
        cache.set("b", &2u8, Duration::from_secs(30)).expect("Set b");

        cache.invalidate_all();

        assert!(cache.is_empty());
    }

    #[test]
    fn test_type_mismatch_reads_as_absent() {
        let cache = CacheStore::new();
        cache
            .set("text", &"hello", Duration::from_secs(30))
            .expect("Set should succeed");

        assert!(cache.get::<u64>("text").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired_keeps_fresh_entries() {
        let cache = CacheStore::new();
        cache.set("short", &1u8, Duration::from_millis(10)).expect("Set short");
        cache.set("long", &2u8, Duration::from_secs(60)).expect("Set long");

        tokio::time::advance(Duration::from_millis(50)).await;
        cache.remove_expired();

        assert_eq!(cache.len(), 1);
        assert!(cache.get::<u8>("long").is_some());
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = CacheStore::new();
        let other = cache.clone();
        cache.set("shared", &7u8, Duration::from_secs(30)).expect("Set");
        assert_eq!(other.get::<u8>("shared").map(|c| c.data), Some(7));
    }
}
