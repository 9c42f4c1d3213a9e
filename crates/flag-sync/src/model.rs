//! # Synchronization Data Model
//!
//! Value objects shared by the stream client, the caches and the coordinator.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A change notification received from the events stream.
///
/// `flag_key == None` is a bulk change: every cached flag must be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    flag_key: Option<String>,
    timestamp: String,
}

impl ChangeEvent {
    pub(crate) fn flag(flag_key: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            flag_key: Some(flag_key.into()),
            timestamp: timestamp.into(),
        }
    }

    pub(crate) fn bulk(timestamp: impl Into<String>) -> Self {
        Self {
            flag_key: None,
            timestamp: timestamp.into(),
        }
    }

    pub fn flag_key(&self) -> Option<&str> {
        self.flag_key.as_deref()
    }

    /// ISO 8601 timestamp as sent by the server.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn is_bulk(&self) -> bool {
        self.flag_key.is_none()
    }

    /// Parses the timestamp, returning `None` if the server sent something
    /// that is not RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

/// A flag value as returned by the bulk evaluation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedFlag {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EvaluatedFlag {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            variant: None,
            reason: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// State of the events stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Readiness of the synchronization layer as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncStatus {
    #[default]
    NotReady,
    Ready,
    Error,
    /// Cached values are served without a freshness guarantee.
    Stale,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::NotReady => write!(f, "NOT_READY"),
            SyncStatus::Ready => write!(f, "READY"),
            SyncStatus::Error => write!(f, "ERROR"),
            SyncStatus::Stale => write!(f, "STALE"),
        }
    }
}

/// Notifications raised towards the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    ConnectionStatusChanged(ConnectionStatus),
    FlagChanged(ChangeEvent),
    /// Flag data changed; the host should re-run its evaluations.
    ConfigurationChanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_accessors() {
        let event = ChangeEvent::flag("my-flag", "2025-01-01T00:00:00Z");
        assert_eq!(event.flag_key(), Some("my-flag"));
        assert!(!event.is_bulk());
        assert_eq!(event.timestamp(), "2025-01-01T00:00:00Z");
        assert!(event.parsed_timestamp().is_some());

        let bulk = ChangeEvent::bulk("yesterday");
        assert!(bulk.is_bulk());
        assert_eq!(bulk.parsed_timestamp(), None);
    }

    #[test]
    fn test_evaluated_flag_deserialize() {
        let flag: EvaluatedFlag = serde_json::from_value(json!({
            "key": "dark-mode",
            "value": true,
            "variant": "on"
        }))
        .unwrap();

        assert_eq!(
            flag,
            EvaluatedFlag::new("dark-mode", json!(true)).with_variant("on")
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(SyncStatus::NotReady.to_string(), "NOT_READY");
    }
}
