//! Working store: per-run short-term state
//!
//! Holds intermediate phase outputs for the duration of one run. Entries
//! carry a TTL relative to insertion; an expired entry is never returned,
//! only lazily evicted. Exclusively owned by one run, so no locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

struct WorkingEntry {
    value: Value,
    expires_at: Instant,
}

/// TTL key/value cache scoped to exactly one run.
pub struct WorkingStore {
    entries: HashMap<String, WorkingEntry>,
    default_ttl: Duration,
}

impl WorkingStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    /// Insert with the store's default TTL. Overwrites atomically.
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.put_with_ttl(key, value, self.default_ttl)
    }

    /// Insert with an explicit TTL relative to now.
    pub fn put_with_ttl(&mut self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.entries.insert(
            key.into(),
            WorkingEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Read a live value. A read at or after expiry returns None and evicts.
    pub fn get(&mut self, key: &str) -> Option<&Value> {
        let expired = match self.entries.get(key) {
            Some(entry) => Instant::now() >= entry.expires_at,
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|e| &e.value)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keys with unexpired entries.
    pub fn active_keys(&mut self) -> Vec<String> {
        self.evict_expired();
        self.entries.keys().cloned().collect()
    }

    pub fn len(&mut self) -> usize {
        self.evict_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_roundtrip() {
        let mut store = WorkingStore::new(Duration::from_secs(60));
        store.put("opinion:technical", json!({ "confidence": 0.8 }));

        let value = store.get("opinion:technical").unwrap();
        assert_eq!(value["confidence"], 0.8);
    }

    #[test]
    fn test_zero_ttl_is_absent_immediately() {
        let mut store = WorkingStore::new(Duration::from_secs(60));
        store.put_with_ttl("ephemeral", json!(1), Duration::ZERO);
        assert!(store.get("ephemeral").is_none());
    }

    #[test]
    fn test_value_live_just_before_expiry() {
        let mut store = WorkingStore::new(Duration::from_secs(60));
        store.put_with_ttl("short", json!("v"), Duration::from_millis(200));
        // Well inside the TTL window.
        assert!(store.get("short").is_some());
    }

    #[test]
    fn test_expired_entry_never_returned_stale() {
        let mut store = WorkingStore::new(Duration::from_secs(60));
        store.put_with_ttl("short", json!("v"), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get("short").is_none());
        // And it was evicted, not just hidden.
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_overwrite_replaces_value_and_ttl() {
        let mut store = WorkingStore::new(Duration::from_secs(60));
        store.put_with_ttl("k", json!("old"), Duration::from_millis(5));
        store.put_with_ttl("k", json!("new"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("k").unwrap(), &json!("new"));
    }

    #[test]
    fn test_clear() {
        let mut store = WorkingStore::new(Duration::from_secs(60));
        store.put("a", json!(1));
        store.put("b", json!(2));
        store.clear();
        assert!(store.is_empty());
    }
}
