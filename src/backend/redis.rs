//! Redis Streams backend: publish, consumer groups, cursor reads, DLQ

use super::cursor::Cursor;
use super::{Backend, CorruptEntry, Received};
use crate::codec::{Codec, JsonZstdCodec};
use crate::config::{ReadMode, StreamConfig};
use crate::error::{EventError, Result};
use crate::types::{DeadLetterEntry, EntryId, RawEvent, MESSAGE_FIELD, ORIGINAL_CHANNEL_FIELD};
use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, RedisError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

/// Connection handles held while the backend is open
///
/// Blocking reads get their own connection so a parked poll never
/// delays publishes and acks queued on the command connection.
struct Connections {
    commands: ConnectionManager,
    reader: ConnectionManager,
}

/// Redis Streams backend
///
/// One instance owns the broker connections, the per-channel cursors and
/// the consumer group used for every channel it reads.
pub struct RedisStreamBackend {
    config: StreamConfig,
    codec: Box<dyn Codec>,
    connections: RwLock<Option<Connections>>,
    cursors: Mutex<HashMap<String, Cursor>>,
    ready: Notify,
}

impl RedisStreamBackend {
    /// Create a backend; no connection is made until `open`
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let codec = JsonZstdCodec::new(config.compression_level);
        Ok(Self {
            config,
            codec: Box::new(codec),
            connections: RwLock::new(None),
            cursors: Mutex::new(HashMap::new()),
            ready: Notify::new(),
        })
    }

    /// Use a specific wire codec
    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Most recent dead-letter entries, newest first
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = self.commands().await?;
        let reply: StreamRangeReply = conn
            .xrevrange_count(&self.config.group.dead_letter_channel, "+", "-", limit)
            .await
            .map_err(|e| command_error(e, EventError::Broker))?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| DeadLetterEntry {
                original_channel: entry
                    .get::<String>(ORIGINAL_CHANNEL_FIELD)
                    .unwrap_or_default(),
                message: entry
                    .get::<Vec<u8>>(MESSAGE_FIELD)
                    .map(Bytes::from)
                    .unwrap_or_default(),
                id: EntryId::new(entry.id),
            })
            .collect())
    }

    async fn commands(&self) -> Result<ConnectionManager> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.commands.clone())
            .ok_or_else(not_open)
    }

    async fn reader(&self) -> Result<ConnectionManager> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|c| c.reader.clone())
            .ok_or_else(not_open)
    }

    async fn connect(&self, client: &::redis::Client) -> Result<ConnectionManager> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                EventError::Connection(format!(
                    "{}: connect timed out after {}s",
                    self.config.url, self.config.connect_timeout_secs
                ))
            })?
            .map_err(|e| EventError::Connection(format!("{}: {}", self.config.url, e)))
    }

    /// Create the consumer group on `channel`, creating the stream if needed
    async fn ensure_group(&self, channel: &str) -> Result<()> {
        let mut conn = self.commands().await?;
        let group = &self.config.group.name;
        let created: std::result::Result<(), RedisError> = conn
            .xgroup_create_mkstream(channel, group, &self.config.group_start_id)
            .await;

        match created {
            Ok(()) => {
                tracing::info!(channel = %channel, group = %group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(
                    channel = %channel,
                    group = %group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(command_error(e, |reason| EventError::Subscribe {
                channel: channel.to_string(),
                reason,
            })),
        }
    }

    fn read_options(&self) -> StreamReadOptions {
        let opts = StreamReadOptions::default()
            .count(self.config.batch_size)
            .block(self.config.block_ms as usize);
        match self.config.mode {
            ReadMode::Direct => opts,
            ReadMode::Group => opts.group(&self.config.group.name, &self.config.consumer_name),
        }
    }

    fn unpack(&self, channel: &str, entry: StreamId) -> Received {
        let id = EntryId::new(entry.id.clone());
        let payload = match entry.get::<Vec<u8>>(MESSAGE_FIELD) {
            Some(payload) => Bytes::from(payload),
            None => {
                return Received::Corrupt(CorruptEntry {
                    channel: channel.to_string(),
                    id,
                    payload: Bytes::new(),
                    reason: format!("missing '{}' field", MESSAGE_FIELD),
                })
            }
        };

        match self.codec.unpack(&payload) {
            Ok(message) => Received::Event(RawEvent {
                channel: channel.to_string(),
                id,
                message,
            }),
            Err(e) => Received::Corrupt(CorruptEntry {
                channel: channel.to_string(),
                id,
                payload,
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Backend for RedisStreamBackend {
    async fn open(&self) -> Result<()> {
        let mut connections = self.connections.write().await;
        if connections.is_some() {
            return Ok(());
        }

        let client = ::redis::Client::open(self.config.url.as_str())
            .map_err(|e| {
                EventError::Config(format!("Invalid redis url '{}': {}", self.config.url, e))
            })?;
        let commands = self.connect(&client).await?;
        let reader = self.connect(&client).await?;
        *connections = Some(Connections { commands, reader });

        tracing::info!(
            url = %self.config.url,
            mode = ?self.config.mode,
            group = %self.config.group.name,
            consumer = %self.config.consumer_name,
            "Connected to Redis"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let closed = self.connections.write().await.take();
        self.cursors.lock().await.clear();
        self.ready.notify_one();
        if closed.is_some() {
            tracing::info!(url = %self.config.url, "Redis connection closed");
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> Result<EntryId> {
        let packed = self.codec.pack(message).map_err(|e| EventError::Publish {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

        let mut conn = self.commands().await?;
        let id: String = conn
            .xadd(channel, "*", &[(MESSAGE_FIELD, packed.as_ref())])
            .await
            .map_err(|e| {
                command_error(e, |reason| EventError::Publish {
                    channel: channel.to_string(),
                    reason,
                })
            })?;

        tracing::debug!(channel = %channel, id = %id, bytes = packed.len(), "Message published");
        Ok(EntryId::new(id))
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        if self.cursors.lock().await.contains_key(channel) {
            return Ok(());
        }

        let cursor = match self.config.mode {
            ReadMode::Group => {
                self.ensure_group(channel).await?;
                Cursor::group()
            }
            ReadMode::Direct => {
                Cursor::Direct(self.last_id(channel).await?.unwrap_or_else(EntryId::zero))
            }
        };

        self.cursors
            .lock()
            .await
            .entry(channel.to_string())
            .or_insert(cursor);
        self.ready.notify_one();

        tracing::info!(channel = %channel, mode = ?self.config.mode, "Channel subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if self.cursors.lock().await.remove(channel).is_some() {
            tracing::info!(channel = %channel, "Channel unsubscribed");
        }
        Ok(())
    }

    async fn next_batch(&self) -> Result<Vec<Received>> {
        let block = Duration::from_millis(self.config.block_ms);

        loop {
            let (keys, ids): (Vec<String>, Vec<String>) = {
                let cursors = self.cursors.lock().await;
                let mut entries: Vec<(&String, &Cursor)> = cursors.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                entries
                    .into_iter()
                    .map(|(channel, cursor)| (channel.clone(), cursor.read_id().to_string()))
                    .unzip()
            };

            let mut conn = self.reader().await?;

            if keys.is_empty() {
                // Nothing to read yet: wait for a subscribe, bounded by one poll
                let _ = tokio::time::timeout(block, self.ready.notified()).await;
                continue;
            }

            let reply: Option<StreamReadReply> = match conn
                .xread_options(&keys, &ids, &self.read_options())
                .await
            {
                Ok(reply) => reply,
                Err(e) if e.code() == Some("NOGROUP") => {
                    tracing::warn!(error = %e, "Consumer group missing, recreating");
                    for channel in &keys {
                        self.ensure_group(channel).await?;
                    }
                    continue;
                }
                Err(e) => return Err(command_error(e, EventError::Broker)),
            };

            let Some(reply) = reply else {
                continue;
            };

            let mut batch = Vec::new();
            let mut cursors = self.cursors.lock().await;
            for stream in reply.keys {
                let last = stream.ids.last().map(|entry| EntryId::new(entry.id.clone()));
                // A channel unsubscribed mid-read keeps no cursor
                if let Some(cursor) = cursors.get_mut(&stream.key) {
                    if cursor.is_replaying() && last.is_some() {
                        tracing::debug!(
                            channel = %stream.key,
                            count = stream.ids.len(),
                            "Redelivering pending entries"
                        );
                    }
                    cursor.advance(last.as_ref());
                }
                for entry in stream.ids {
                    batch.push(self.unpack(&stream.key, entry));
                }
            }
            drop(cursors);

            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    async fn last_id(&self, channel: &str) -> Result<Option<EntryId>> {
        let mut conn = self.commands().await?;
        let reply: StreamRangeReply = conn
            .xrevrange_count(channel, "+", "-", 1)
            .await
            .map_err(|e| {
                command_error(e, |reason| EventError::Subscribe {
                    channel: channel.to_string(),
                    reason,
                })
            })?;
        Ok(reply
            .ids
            .first()
            .map(|entry| EntryId::new(entry.id.clone())))
    }

    async fn ack(&self, channel: &str, id: &EntryId) -> Result<()> {
        if self.config.mode == ReadMode::Direct {
            return Ok(());
        }
        let mut conn = self.commands().await?;
        let _: i64 = conn
            .xack(channel, &self.config.group.name, &[id.as_str()])
            .await
            .map_err(|e| {
                command_error(e, |reason| {
                    EventError::Ack(format!("{} on '{}': {}", id, channel, reason))
                })
            })?;
        Ok(())
    }

    async fn move_to_dead_letter(&self, channel: &str, id: &EntryId, message: &[u8]) -> Result<()> {
        let dead_letter_channel = &self.config.group.dead_letter_channel;
        if channel == dead_letter_channel {
            tracing::warn!(
                channel = %channel,
                id = %id,
                "Not dead-lettering an entry of the dead-letter channel"
            );
            return self.ack(channel, id).await;
        }

        // Append first, ack second: a crash in between duplicates, never loses
        let mut conn = self.commands().await?;
        let _: String = conn
            .xadd(
                dead_letter_channel,
                "*",
                &[
                    (ORIGINAL_CHANNEL_FIELD, channel.as_bytes()),
                    (MESSAGE_FIELD, message),
                ],
            )
            .await
            .map_err(|e| {
                command_error(e, |reason| EventError::DeadLetter {
                    channel: channel.to_string(),
                    reason,
                })
            })?;

        self.ack(channel, id).await?;

        tracing::warn!(
            channel = %channel,
            id = %id,
            dead_letter_channel = %dead_letter_channel,
            "Message moved to dead-letter channel"
        );
        Ok(())
    }

    async fn stream_len(&self, channel: &str) -> Result<u64> {
        let mut conn = self.commands().await?;
        conn.xlen(channel)
            .await
            .map_err(|e| command_error(e, EventError::Broker))
    }

    fn mode(&self) -> ReadMode {
        self.config.mode
    }

    fn name(&self) -> &str {
        "redis"
    }
}

fn not_open() -> EventError {
    EventError::Connection("redis backend is not open".to_string())
}

/// Keep connection failures classified as such; wrap everything else
fn command_error(e: RedisError, wrap: impl FnOnce(String) -> EventError) -> EventError {
    match EventError::from(e) {
        EventError::Broker(reason) => wrap(reason),
        other => other,
    }
}
