//! # Durable Flag Store
//!
//! Contract for a persistence layer that survives restarts (browser storage,
//! a file, a key/value database). Every operation must be a no-op when the
//! backing store is unavailable; nothing here returns an error.

use crate::model::EvaluatedFlag;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub trait DurableStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<EvaluatedFlag>;
    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        variant: Option<&str>,
        reason: Option<&str>,
    );
    fn set_all(&self, flags: &[EvaluatedFlag]);
    /// Removes `key`, or every entry when `key` is `None`.
    fn invalidate(&self, key: Option<&str>);
    fn is_available(&self) -> bool;
    /// Time since `key` was last written.
    fn get_age(&self, key: &str) -> Option<Duration>;
    /// `true` when `key` is missing or older than `max_age`.
    fn is_stale(&self, key: &str, max_age: Duration) -> bool {
        self.get_age(key).is_none_or(|age| age > max_age)
    }
    fn clear(&self);
}

/// Store used when no persistence is configured. Always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl DurableStore for NoopStore {
    fn get(&self, _key: &str) -> Option<EvaluatedFlag> {
        None
    }

    fn set(
        &self,
        _key: &str,
        _value: serde_json::Value,
        _variant: Option<&str>,
        _reason: Option<&str>,
    ) {
    }

    fn set_all(&self, _flags: &[EvaluatedFlag]) {}

    fn invalidate(&self, _key: Option<&str>) {}

    fn is_available(&self) -> bool {
        false
    }

    fn get_age(&self, _key: &str) -> Option<Duration> {
        None
    }

    fn clear(&self) {}
}

#[derive(Debug)]
struct StoredFlag {
    flag: EvaluatedFlag,
    written_at: Instant,
}

/// Process-local store. Availability can be toggled to simulate a storage
/// backend that went away (quota exceeded, private browsing, ...).
#[derive(Debug)]
pub struct MemoryStore {
    available: Mutex<bool>,
    flags: Mutex<HashMap<String, StoredFlag>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            available: Mutex::new(true),
            flags: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        *self.available.lock() = available;
    }

    pub fn len(&self) -> usize {
        self.flags.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.lock().is_empty()
    }

    fn insert(&self, flag: EvaluatedFlag) {
        let stored = StoredFlag {
            flag,
            written_at: Instant::now(),
        };
        self.flags.lock().insert(stored.flag.key.clone(), stored);
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Option<EvaluatedFlag> {
        if !self.is_available() {
            return None;
        }
        self.flags.lock().get(key).map(|stored| stored.flag.clone())
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        variant: Option<&str>,
        reason: Option<&str>,
    ) {
        if !self.is_available() {
            return;
        }
        self.insert(EvaluatedFlag {
            key: key.to_string(),
            value,
            variant: variant.map(String::from),
            reason: reason.map(String::from),
        });
    }

    fn set_all(&self, flags: &[EvaluatedFlag]) {
        if !self.is_available() {
            return;
        }
        for flag in flags {
            self.insert(flag.clone());
        }
    }

    fn invalidate(&self, key: Option<&str>) {
        if !self.is_available() {
            return;
        }
        let mut flags = self.flags.lock();
        match key {
            Some(key) => {
                flags.remove(key);
            }
            None => flags.clear(),
        }
    }

    fn is_available(&self) -> bool {
        *self.available.lock()
    }

    fn get_age(&self, key: &str) -> Option<Duration> {
        if !self.is_available() {
            return None;
        }
        self.flags
            .lock()
            .get(key)
            .map(|stored| stored.written_at.elapsed())
    }

    fn clear(&self) {
        if self.is_available() {
            self.flags.lock().clear();
        }
    }
}
