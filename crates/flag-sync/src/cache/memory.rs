//! # In-Memory TTL Cache
//!
//! HashMap-backed cache keyed by flag key. Entries expire a fixed duration
//! after they were written; expired entries are removed on the next `get`.
//! There is no background sweep.

use crate::model::ChangeEvent;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: HashMap<String, CacheEntry<V>>,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Stores `value`, replacing any previous entry for `key`.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.insert(key.into(), entry);
    }

    pub fn get(&mut self, key: &str) -> Option<&V> {
        let expired = Instant::now() >= self.entries.get(key)?.expires_at;
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Removes `key`, or every entry when `key` is `None`.
    pub fn invalidate(&mut self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.entries.remove(key);
            }
            None => self.entries.clear(),
        }
    }

    pub fn handle_change_event(&mut self, event: &ChangeEvent) {
        self.invalidate(event.flag_key());
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
