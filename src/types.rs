//! Core event types for the a3s-eventstream client

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Broker-assigned entry id (`<millis>-<seq>`)
///
/// Ordered numerically, so `"10-0" > "9-5"`. Well-formed ids are stored
/// as `<millis>-<seq>`, so `"5"` and `"5-0"` are the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// Wrap a broker id string
    pub fn new(id: impl Into<String>) -> Self {
        let id = Self(id.into());
        match id.parts() {
            Some((millis, seq)) => Self::from_parts(millis, seq),
            None => id,
        }
    }

    /// The id before any entry (`0-0`)
    pub fn zero() -> Self {
        Self("0-0".to_string())
    }

    /// Build an id from its numeric parts
    pub fn from_parts(millis: u64, seq: u64) -> Self {
        Self(format!("{}-{}", millis, seq))
    }

    /// Numeric `(millis, seq)` parts, if well-formed
    pub fn parts(&self) -> Option<(u64, u64)> {
        let (millis, seq) = match self.0.split_once('-') {
            Some((m, s)) => (m, s),
            None => (self.0.as_str(), "0"),
        };
        Some((millis.parse().ok()?, seq.parse().ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.parts(), other.parts()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

/// An entry read from the broker, already unpacked to canonical JSON
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Channel the entry was read from
    pub channel: String,

    /// Broker id, needed for ack and dead-letter routing
    pub id: EntryId,

    /// Canonical JSON of the message
    pub message: Bytes,
}

/// A typed event delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    /// Channel the event was published to
    pub channel: String,

    /// Decoded message
    pub message: T,

    /// Broker id of the underlying entry
    pub id: EntryId,
}

/// Item carried by a subscriber's delivery queue
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A received event, shared between every subscriber of the channel
    Event(std::sync::Arc<RawEvent>),

    /// The subscription ended; no further items follow
    Closed,
}

/// Entry stored on the dead-letter channel
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    /// Broker id of the dead-letter entry itself
    pub id: EntryId,

    /// Channel the message was originally read from
    pub original_channel: String,

    /// The original message: canonical JSON, or the raw payload if it
    /// could not be decoded
    pub message: Bytes,
}

/// Field under which a packed message is stored on the broker
pub const MESSAGE_FIELD: &str = "message";

/// Field naming the source channel of a dead-letter entry
pub const ORIGINAL_CHANNEL_FIELD: &str = "original_channel";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_ordering() {
        assert!(EntryId::new("10-0") > EntryId::new("9-5"));
        assert!(EntryId::new("9-10") > EntryId::new("9-9"));
        assert!(EntryId::zero() < EntryId::new("0-1"));
        assert_eq!(EntryId::from_parts(5, 2), EntryId::new("5-2"));
    }

    #[test]
    fn test_entry_id_parts() {
        assert_eq!(EntryId::new("1700000000000-3").parts(), Some((1_700_000_000_000, 3)));
        assert_eq!(EntryId::new("42").parts(), Some((42, 0)));
        assert_eq!(EntryId::new(">").parts(), None);
    }

    #[test]
    fn test_entry_id_equality_follows_ordering() {
        use std::collections::BTreeSet;

        let short = EntryId::new("5");
        let padded = EntryId::new("005-0");
        assert_eq!(short.cmp(&EntryId::new("5-0")), Ordering::Equal);
        assert_eq!(short, EntryId::new("5-0"));
        assert_eq!(padded, short);
        assert_eq!(short.as_str(), "5-0");
        assert_eq!(EntryId::from(">".to_string()).as_str(), ">");

        let ids: BTreeSet<EntryId> = [short, padded, EntryId::new("5-0")].into_iter().collect();
        assert_eq!(ids.len(), 1);

        let parsed: EntryId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(parsed.as_str(), "7-0");
    }

    #[test]
    fn test_event_serialization() {
        let event = Event {
            channel: "orders".to_string(),
            message: "A".to_string(),
            id: EntryId::new("1-0"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"channel":"orders","message":"A","id":"1-0"}"#);

        let parsed: Event<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
