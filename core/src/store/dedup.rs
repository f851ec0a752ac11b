//! TTL'd key-value dedup store.
//!
//! Keyed by `(agency_id, external_event_id)`. Check-and-set is atomic: the
//! first caller wins and proceeds to publish, later callers see a duplicate.
//! Keys expire after the configured TTL (7 days by default), long enough to
//! cover any raw-topic redelivery.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait DedupStore: Send + Sync {
    /// Returns `true` if the key was inserted (first sighting), `false` if
    /// it already existed (duplicate).
    fn check_and_set(&self, key: &str) -> bool;

    /// Whether the key is currently present.
    fn contains(&self, key: &str) -> bool;

    /// Drop expired keys; returns how many were removed.
    fn purge_expired(&self) -> usize;
}

pub struct InMemoryDedupStore {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl InMemoryDedupStore {
    pub fn new(ttl_days: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::days(ttl_days.max(1)),
        }
    }

    fn is_expired(&self, inserted_at: &DateTime<Utc>) -> bool {
        Utc::now() - *inserted_at > self.ttl
    }
}

impl DedupStore for InMemoryDedupStore {
    fn check_and_set(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(inserted_at) if !self.is_expired(inserted_at) => false,
            _ => {
                // Fresh key, or an expired one being reclaimed.
                entries.insert(key.to_string(), Utc::now());
                true
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries.get(key).map(|t| !self.is_expired(t)).unwrap_or(false)
    }

    fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        let now = Utc::now();
        entries.retain(|_, inserted_at| now - *inserted_at <= ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_check_wins_second_is_duplicate() {
        let store = InMemoryDedupStore::new(7);
        assert!(store.check_and_set("etoll:e1"));
        assert!(!store.check_and_set("etoll:e1"));
        assert!(store.check_and_set("etoll:e2"));
    }

    #[test]
    fn contains_matches_check_state() {
        let store = InMemoryDedupStore::new(7);
        assert!(!store.contains("etoll:e1"));
        store.check_and_set("etoll:e1");
        assert!(store.contains("etoll:e1"));
    }

    #[test]
    fn purge_keeps_live_keys() {
        let store = InMemoryDedupStore::new(7);
        store.check_and_set("etoll:e1");
        assert_eq!(store.purge_expired(), 0);
        assert!(store.contains("etoll:e1"));
    }
}
