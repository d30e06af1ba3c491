//! Backend trait: the core abstraction over stream brokers
//!
//! A backend owns the broker connection and the wire codec. It works on
//! canonical message bytes only; the message type is chosen by whoever
//! publishes or subscribes through the client.

use crate::config::ReadMode;
use crate::error::{EventError, Result};
use crate::types::{EntryId, RawEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;

pub mod cursor;
pub mod memory;
pub mod redis;

pub use cursor::{Cursor, GroupCursor};

/// Core trait for stream backends
///
/// Implementations handle cursor bookkeeping, consumer groups, payload
/// packing and dead-letter routing. The `EventStreamClient` is the only
/// caller of `next_batch`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Acquire the broker connection
    async fn open(&self) -> Result<()>;

    /// Release the broker connection
    async fn close(&self) -> Result<()>;

    /// Pack `message` (canonical JSON) and append it to the channel log
    async fn publish(&self, channel: &str, message: &[u8]) -> Result<EntryId>;

    /// Start reading a channel; calling it again is a no-op
    async fn subscribe(&self, channel: &str) -> Result<()>;

    /// Stop reading a channel; unknown channels are ignored
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Wait until at least one entry is available on a subscribed channel
    ///
    /// Cursors are advanced past every returned entry before this
    /// returns. Entries that fail to unpack come back as
    /// `Received::Corrupt` rather than failing the whole batch.
    async fn next_batch(&self) -> Result<Vec<Received>>;

    /// Id of the newest entry in a channel log, `None` when empty
    async fn last_id(&self, channel: &str) -> Result<Option<EntryId>>;

    /// Acknowledge an entry (no-op for direct reads)
    async fn ack(&self, channel: &str, id: &EntryId) -> Result<()>;

    /// Append `{original_channel, message}` to the dead-letter channel,
    /// then acknowledge the source entry
    async fn move_to_dead_letter(&self, channel: &str, id: &EntryId, message: &[u8]) -> Result<()>;

    /// Number of entries in a channel log
    async fn stream_len(&self, channel: &str) -> Result<u64>;

    /// Read mode in use
    fn mode(&self) -> ReadMode;

    /// Backend name (e.g., "redis", "memory")
    fn name(&self) -> &str;
}

/// One entry returned by `Backend::next_batch`
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// Entry unpacked to canonical JSON
    Event(RawEvent),

    /// Entry whose payload failed the integrity check or was missing
    Corrupt(CorruptEntry),
}

/// An entry that could not be unpacked
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptEntry {
    pub channel: String,
    pub id: EntryId,

    /// Payload exactly as stored on the broker (may be empty)
    pub payload: Bytes,

    pub reason: String,
}

impl CorruptEntry {
    /// Classified error describing this entry
    pub fn error(&self) -> EventError {
        EventError::Deserialization {
            channel: self.channel.clone(),
            id: self.id.to_string(),
            reason: self.reason.clone(),
        }
    }
}

impl Received {
    pub fn channel(&self) -> &str {
        match self {
            Received::Event(event) => &event.channel,
            Received::Corrupt(entry) => &entry.channel,
        }
    }

    pub fn id(&self) -> &EntryId {
        match self {
            Received::Event(event) => &event.id,
            Received::Corrupt(entry) => &entry.id,
        }
    }
}

/// Lazy, infinite sequence of everything a backend receives
///
/// Pulls one batch at a time and yields its entries in broker order.
/// A broker error is yielded once and then the sequence ends; it cannot
/// be restarted.
pub fn next_published(backend: Arc<dyn Backend>) -> impl Stream<Item = Result<Received>> + Send {
    futures::stream::unfold(
        (backend, VecDeque::new(), false),
        |(backend, mut pending, failed)| async move {
            if failed {
                return None;
            }
            loop {
                if let Some(received) = pending.pop_front() {
                    return Some((Ok(received), (backend, pending, false)));
                }
                match backend.next_batch().await {
                    Ok(batch) => pending.extend(batch),
                    Err(e) => return Some((Err(e), (backend, pending, true))),
                }
            }
        },
    )
}
