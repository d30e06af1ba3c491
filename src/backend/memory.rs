//! In-memory stream backend
//!
//! Keeps append-only per-channel logs, direct cursors and consumer groups
//! with pending entries inside the process. Payloads go through the same
//! codec as the Redis backend, so corruption and dead-letter paths behave
//! identically. Useful for tests and single-process deployments.

use super::cursor::{Cursor, GroupCursor};
use super::{Backend, CorruptEntry, Received};
use crate::codec::{Codec, JsonZstdCodec};
use crate::config::{ConsumerGroup, ReadMode};
use crate::error::{EventError, Result};
use crate::types::{DeadLetterEntry, EntryId, RawEvent, MESSAGE_FIELD, ORIGINAL_CHANNEL_FIELD};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// One stored log entry: field/value pairs like a Redis stream entry
#[derive(Debug, Clone)]
struct StoredEntry {
    id: EntryId,
    fields: Vec<(String, Bytes)>,
}

impl StoredEntry {
    fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: Option<EntryId>,
    pending: BTreeSet<EntryId>,
}

#[derive(Debug, Default)]
struct Log {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

impl Log {
    fn last_id(&self) -> Option<&EntryId> {
        self.entries.last().map(|e| &e.id)
    }
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    logs: HashMap<String, Log>,
    cursors: HashMap<String, Cursor>,
    last_id: (u64, u64),
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(EventError::Connection("memory backend is not open".to_string()))
        }
    }

    fn next_id(&mut self) -> EntryId {
        let now = now_millis();
        self.last_id = if now > self.last_id.0 {
            (now, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        EntryId::from_parts(self.last_id.0, self.last_id.1)
    }

    fn append(&mut self, channel: &str, fields: Vec<(String, Bytes)>) -> EntryId {
        let id = self.next_id();
        self.logs
            .entry(channel.to_string())
            .or_default()
            .entries
            .push(StoredEntry { id: id.clone(), fields });
        id
    }
}

/// In-memory stream backend
pub struct MemoryBackend {
    state: Mutex<State>,
    notify: Notify,
    mode: ReadMode,
    group: ConsumerGroup,
    codec: Box<dyn Codec>,
    batch_size: usize,
    poll_interval: Duration,
}

impl MemoryBackend {
    /// Create a backend with the default group and codec
    pub fn new(mode: ReadMode) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            mode,
            group: ConsumerGroup::default(),
            codec: Box::new(JsonZstdCodec::default()),
            batch_size: 64,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Use a specific consumer group / dead-letter channel
    pub fn with_group(mut self, group: ConsumerGroup) -> Self {
        self.group = group;
        self
    }

    /// Use a specific wire codec
    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Maximum entries returned per channel per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Consumer group in use
    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    /// Append a payload exactly as given, bypassing the codec
    pub async fn inject_raw(&self, channel: &str, payload: impl Into<Bytes>) -> Result<EntryId> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let id = state.append(channel, vec![(MESSAGE_FIELD.to_string(), payload.into())]);
        drop(state);
        self.notify.notify_one();
        Ok(id)
    }

    /// Most recent dead-letter entries, newest first
    pub async fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry> {
        let state = self.state.lock().await;
        state
            .logs
            .get(&self.group.dead_letter_channel)
            .map(|log| {
                log.entries
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|entry| DeadLetterEntry {
                        id: entry.id.clone(),
                        original_channel: entry
                            .field(ORIGINAL_CHANNEL_FIELD)
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_default(),
                        message: entry.field(MESSAGE_FIELD).cloned().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids delivered to the group but not yet acknowledged
    pub async fn pending(&self, channel: &str) -> Vec<EntryId> {
        let state = self.state.lock().await;
        state
            .logs
            .get(channel)
            .and_then(|log| log.groups.get(&self.group.name))
            .map(|group| group.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels with an active read position
    pub async fn subscribed_channels(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut channels: Vec<String> = state.cursors.keys().cloned().collect();
        channels.sort();
        channels
    }

    fn unpack(&self, channel: &str, entry: &StoredEntry) -> Received {
        let payload = match entry.field(MESSAGE_FIELD) {
            Some(payload) => payload.clone(),
            None => {
                return Received::Corrupt(CorruptEntry {
                    channel: channel.to_string(),
                    id: entry.id.clone(),
                    payload: Bytes::new(),
                    reason: format!("missing '{}' field", MESSAGE_FIELD),
                })
            }
        };
        match self.codec.unpack(&payload) {
            Ok(message) => Received::Event(RawEvent {
                channel: channel.to_string(),
                id: entry.id.clone(),
                message,
            }),
            Err(e) => Received::Corrupt(CorruptEntry {
                channel: channel.to_string(),
                id: entry.id.clone(),
                payload,
                reason: e.to_string(),
            }),
        }
    }

    /// Read every subscribed channel once, advancing cursors
    fn read_once(&self, state: &mut State) -> Vec<Received> {
        let State { logs, cursors, .. } = state;
        let mut batch = Vec::new();

        let mut channels: Vec<String> = cursors.keys().cloned().collect();
        channels.sort();

        for channel in channels {
            let Some(cursor) = cursors.get_mut(&channel) else {
                continue;
            };
            let log = logs.entry(channel.clone()).or_default();

            let entries: Vec<StoredEntry> = match cursor {
                Cursor::Direct(after) => log
                    .entries
                    .iter()
                    .filter(|e| e.id > *after)
                    .take(self.batch_size)
                    .cloned()
                    .collect(),
                Cursor::Group(GroupCursor::Pending(after)) => {
                    let pending = log
                        .groups
                        .get(&self.group.name)
                        .map(|g| g.pending.clone())
                        .unwrap_or_default();
                    log.entries
                        .iter()
                        .filter(|e| e.id > *after && pending.contains(&e.id))
                        .take(self.batch_size)
                        .cloned()
                        .collect()
                }
                Cursor::Group(GroupCursor::New { .. }) => {
                    let group = log.groups.entry(self.group.name.clone()).or_default();
                    let entries: Vec<StoredEntry> = log
                        .entries
                        .iter()
                        .filter(|e| group.last_delivered.as_ref().map_or(true, |last| e.id > *last))
                        .take(self.batch_size)
                        .cloned()
                        .collect();
                    if let Some(last) = entries.last() {
                        group.last_delivered = Some(last.id.clone());
                    }
                    group.pending.extend(entries.iter().map(|e| e.id.clone()));
                    entries
                }
            };

            let replaying = cursor.is_replaying();
            cursor.advance(entries.last().map(|e| &e.id));
            if replaying && !entries.is_empty() {
                tracing::debug!(
                    channel = %channel,
                    count = entries.len(),
                    "Redelivering pending entries"
                );
            }

            batch.extend(entries.iter().map(|entry| self.unpack(&channel, entry)));
        }

        batch
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(ReadMode::Group)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(&self) -> Result<()> {
        self.state.lock().await.open = true;
        tracing::debug!(mode = ?self.mode, "Memory backend opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.open = false;
        state.cursors.clear();
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<EntryId> {
        let packed = self.codec.pack(message).map_err(|e| EventError::Publish {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let id = state.append(channel, vec![(MESSAGE_FIELD.to_string(), packed)]);
        drop(state);

        self.notify.notify_one();
        tracing::debug!(channel = %channel, id = %id, "Message published");
        Ok(id)
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let State { logs, cursors, .. } = &mut *state;
        let log = logs.entry(channel.to_string()).or_default();

        let cursor = match self.mode {
            ReadMode::Direct => {
                Cursor::Direct(log.last_id().cloned().unwrap_or_else(EntryId::zero))
            }
            ReadMode::Group => {
                log.groups.entry(self.group.name.clone()).or_default();
                Cursor::group()
            }
        };
        cursors.entry(channel.to_string()).or_insert(cursor);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.state.lock().await.cursors.remove(channel);
        Ok(())
    }

    async fn next_batch(&self) -> Result<Vec<Received>> {
        loop {
            {
                let mut state = self.state.lock().await;
                state.ensure_open()?;
                let batch = self.read_once(&mut state);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            // Bounded wait: woken early by publish/subscribe
            let _ = tokio::time::timeout(self.poll_interval, self.notify.notified()).await;
        }
    }

    async fn last_id(&self, channel: &str) -> Result<Option<EntryId>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.logs.get(channel).and_then(|log| log.last_id().cloned()))
    }

    async fn ack(&self, channel: &str, id: &EntryId) -> Result<()> {
        if self.mode == ReadMode::Direct {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        if let Some(group) = state
            .logs
            .get_mut(channel)
            .and_then(|log| log.groups.get_mut(&self.group.name))
        {
            group.pending.remove(id);
        }
        Ok(())
    }

    async fn move_to_dead_letter(&self, channel: &str, id: &EntryId, message: &[u8]) -> Result<()> {
        if channel == self.group.dead_letter_channel {
            tracing::warn!(
                channel = %channel,
                id = %id,
                "Not dead-lettering an entry of the dead-letter channel"
            );
            return self.ack(channel, id).await;
        }

        {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            let dead_letter_channel = self.group.dead_letter_channel.clone();
            state.append(
                &dead_letter_channel,
                vec![
                    (ORIGINAL_CHANNEL_FIELD.to_string(), Bytes::from(channel.to_string())),
                    (MESSAGE_FIELD.to_string(), Bytes::copy_from_slice(message)),
                ],
            );
        }

        self.ack(channel, id).await?;
        tracing::warn!(
            channel = %channel,
            id = %id,
            dead_letter_channel = %self.group.dead_letter_channel,
            "Message moved to dead-letter channel"
        );
        Ok(())
    }

    async fn stream_len(&self, channel: &str) -> Result<u64> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.logs.get(channel).map_or(0, |log| log.entries.len() as u64))
    }

    fn mode(&self) -> ReadMode {
        self.mode
    }

    fn name(&self) -> &str {
        "memory"
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_backend(mode: ReadMode) -> MemoryBackend {
        let backend = MemoryBackend::new(mode);
        backend.open().await.unwrap();
        backend
    }

    fn messages(batch: &[Received]) -> Vec<String> {
        batch
            .iter()
            .map(|r| match r {
                Received::Event(e) => String::from_utf8(e.message.to_vec()).unwrap(),
                Received::Corrupt(c) => format!("corrupt:{}", c.id),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_operations() {
        let backend = MemoryBackend::new(ReadMode::Direct);
        assert!(backend.publish("orders", b"1").await.unwrap_err().is_broker_unavailable());
        assert!(backend.subscribe("orders").await.is_err());
        assert!(backend.next_batch().await.is_err());
    }

    #[tokio::test]
    async fn test_direct_subscribe_skips_history() {
        let backend = open_backend(ReadMode::Direct).await;
        backend.publish("orders", b"\"A\"").await.unwrap();
        backend.publish("orders", b"\"B\"").await.unwrap();

        backend.subscribe("orders").await.unwrap();
        backend.publish("orders", b"\"C\"").await.unwrap();

        let batch = backend.next_batch().await.unwrap();
        assert_eq!(messages(&batch), vec!["\"C\""]);
        assert_eq!(backend.stream_len("orders").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_direct_cursor_advances() {
        let backend = open_backend(ReadMode::Direct).await;
        backend.subscribe("orders").await.unwrap();
        backend.publish("orders", b"1").await.unwrap();
        assert_eq!(messages(&backend.next_batch().await.unwrap()), vec!["1"]);

        backend.publish("orders", b"2").await.unwrap();
        assert_eq!(messages(&backend.next_batch().await.unwrap()), vec!["2"]);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let backend = open_backend(ReadMode::Direct).await;
        backend.subscribe("orders").await.unwrap();
        backend.publish("orders", b"1").await.unwrap();
        // Re-subscribing keeps the existing cursor
        backend.subscribe("orders").await.unwrap();
        assert_eq!(messages(&backend.next_batch().await.unwrap()), vec!["1"]);
        backend.unsubscribe("orders").await.unwrap();
        backend.unsubscribe("orders").await.unwrap();
        assert!(backend.subscribed_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_replays_log_and_tracks_pending() {
        let backend = open_backend(ReadMode::Group).await;
        backend.publish("orders", b"\"A\"").await.unwrap();
        backend.publish("orders", b"\"B\"").await.unwrap();

        backend.subscribe("orders").await.unwrap();
        let batch = backend.next_batch().await.unwrap();
        assert_eq!(messages(&batch), vec!["\"A\"", "\"B\""]);
        assert_eq!(backend.pending("orders").await.len(), 2);

        backend.ack("orders", batch[0].id()).await.unwrap();
        assert_eq!(backend.pending("orders").await, vec![batch[1].id().clone()]);
    }

    #[tokio::test]
    async fn test_group_redelivers_unacked_after_resubscribe() {
        let backend = open_backend(ReadMode::Group).await;
        backend.subscribe("orders").await.unwrap();
        backend.publish("orders", b"1").await.unwrap();
        backend.publish("orders", b"2").await.unwrap();

        let batch = backend.next_batch().await.unwrap();
        backend.ack("orders", batch[0].id()).await.unwrap();

        backend.unsubscribe("orders").await.unwrap();
        backend.subscribe("orders").await.unwrap();

        let redelivered = backend.next_batch().await.unwrap();
        assert_eq!(messages(&redelivered), vec!["2"]);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_classified() {
        let backend = open_backend(ReadMode::Group).await;
        backend.subscribe("orders").await.unwrap();
        backend.inject_raw("orders", Bytes::from_static(b"garbage")).await.unwrap();

        let batch = backend.next_batch().await.unwrap();
        match &batch[0] {
            Received::Corrupt(entry) => {
                assert_eq!(entry.payload.as_ref(), b"garbage");
                assert!(entry.error().is_deserialization());
            }
            other => panic!("expected corrupt entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_to_dead_letter_appends_then_acks() {
        let backend = open_backend(ReadMode::Group)
            .await
            .with_group(ConsumerGroup::new("workers", "workers-dlq"));
        backend.open().await.unwrap();
        backend.subscribe("orders").await.unwrap();
        let id = backend.publish("orders", b"{\"bad\":true}").await.unwrap();
        backend.next_batch().await.unwrap();

        backend
            .move_to_dead_letter("orders", &id, b"{\"bad\":true}")
            .await
            .unwrap();

        let dead = backend.dead_letters(10).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].original_channel, "orders");
        assert_eq!(dead[0].message.as_ref(), b"{\"bad\":true}");
        assert!(backend.pending("orders").await.is_empty());
        assert_eq!(backend.stream_len("workers-dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_next_batch_waits_for_publish() {
        let backend = std::sync::Arc::new(open_backend(ReadMode::Direct).await);
        backend.subscribe("orders").await.unwrap();

        let reader = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.next_batch().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!reader.is_finished());

        backend.publish("orders", b"\"late\"").await.unwrap();
        let batch = reader.await.unwrap().unwrap();
        assert_eq!(messages(&batch), vec!["\"late\""]);
    }
}
