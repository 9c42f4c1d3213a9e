//! # Event-Stream Parser
//!
//! Incremental line assembler for `text/event-stream` bodies. Bytes are fed
//! in whatever chunks the transport delivers; complete lines are consumed and
//! any trailing partial line (including a split UTF-8 sequence) waits for the
//! next chunk.
//!
//! Framing:
//!
//! * `event: <type>` sets the type of the pending event
//! * `data: <payload>` sets its payload (several `data:` lines are joined
//!   with `\n`)
//! * a blank line dispatches the pending event
//! * lines starting with `:` are comments; `id:` and `retry:` are ignored

use crate::error::SyncError;
use crate::model::ChangeEvent;
use serde::Deserialize;

/// One framed event, before its payload is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: String,
    pub data: String,
}

#[derive(Debug, Default)]
struct PendingEvent {
    event_type: Option<String>,
    data: Option<String>,
}

impl PendingEvent {
    fn take(&mut self) -> Option<RawEvent> {
        let event_type = self.event_type.take();
        let data = self.data.take();
        if event_type.is_none() && data.is_none() {
            return None;
        }
        Some(RawEvent {
            event_type: event_type.unwrap_or_else(|| "message".to_string()),
            data: data.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
    pending: PendingEvent,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every event completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let end = self.scanned + offset;
            let mut line = &self.buffer[consumed..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line);
            if let Some(event) = process_line(&mut self.pending, &line) {
                events.push(event);
            }
            consumed = end + 1;
            self.scanned = consumed;
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        events
    }
}

fn process_line(pending: &mut PendingEvent, line: &str) -> Option<RawEvent> {
    if line.is_empty() {
        return pending.take();
    }
    if line.starts_with(':') {
        return None;
    }

    let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    };

    match field {
        "event" => pending.event_type = Some(value.to_string()),
        "data" => match pending.data.as_mut() {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => pending.data = Some(value.to_string()),
        },
        _ => {}
    }
    None
}

/// Interpretation of a [`RawEvent`] against the change-notification contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Heartbeat,
    Change(ChangeEvent),
    ApiKeyRotated {
        valid_until: String,
        timestamp: String,
    },
    Unknown(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagUpdatedPayload {
    flag_key: String,
    timestamp: String,
}

#[derive(Deserialize)]
struct ConfigUpdatedPayload {
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyRotatedPayload {
    valid_until: String,
    timestamp: String,
}

impl StreamMessage {
    /// Fails only for a recognized event type whose payload is malformed.
    pub fn from_raw(raw: &RawEvent) -> Result<Self, SyncError> {
        match raw.event_type.as_str() {
            "heartbeat" => Ok(StreamMessage::Heartbeat),
            "flag-updated" => {
                let payload: FlagUpdatedPayload = serde_json::from_str(&raw.data)?;
                Ok(StreamMessage::Change(ChangeEvent::flag(
                    payload.flag_key,
                    payload.timestamp,
                )))
            }
            "config-updated" => {
                let payload: ConfigUpdatedPayload = serde_json::from_str(&raw.data)?;
                Ok(StreamMessage::Change(ChangeEvent::bulk(payload.timestamp)))
            }
            "api-key-rotated" => {
                let payload: ApiKeyRotatedPayload = serde_json::from_str(&raw.data)?;
                Ok(StreamMessage::ApiKeyRotated {
                    valid_until: payload.valid_until,
                    timestamp: payload.timestamp,
                })
            }
            other => Ok(StreamMessage::Unknown(other.to_string())),
        }
    }
}
