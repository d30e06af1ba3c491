//! Backend and client configuration
//!
//! All types use camelCase JSON serialization, with defaults for every
//! field so partial configs deserialize cleanly.

use crate::codec::DEFAULT_COMPRESSION_LEVEL;
use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};

/// How the stream backend reads channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    /// Plain cursor reads from the last delivered id; nothing to ack
    Direct,
    /// Durable consumer-group reads with explicit acknowledgement
    #[default]
    Group,
}

/// Consumer group shared by every channel of one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroup {
    /// Group name created on each subscribed channel
    pub name: String,

    /// Channel receiving dead-lettered messages
    pub dead_letter_channel: String,
}

impl ConsumerGroup {
    pub fn new(name: impl Into<String>, dead_letter_channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_channel: dead_letter_channel.into(),
        }
    }
}

impl Default for ConsumerGroup {
    fn default() -> Self {
        Self::new("eventstream", "eventstream-dlq")
    }
}

/// Redis stream backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Direct or consumer-group reads
    #[serde(default)]
    pub mode: ReadMode,

    /// Consumer group and dead-letter channel
    #[serde(default)]
    pub group: ConsumerGroup,

    /// Consumer name within the group
    ///
    /// Keep it stable across restarts to have unacknowledged entries
    /// redelivered to the same consumer.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Id a newly created group starts from (`0` = whole log, `$` = new only)
    #[serde(default = "default_group_start_id")]
    pub group_start_id: String,

    /// How long one poll blocks on the broker (milliseconds)
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Maximum entries returned per channel per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// zstd compression level for published payloads
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_consumer_name() -> String {
    format!("consumer-{}", uuid::Uuid::new_v4().simple())
}

fn default_group_start_id() -> String {
    "0".to_string()
}

fn default_block_ms() -> u64 {
    100
}

fn default_batch_size() -> usize {
    64
}

fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            mode: ReadMode::default(),
            group: ConsumerGroup::default(),
            consumer_name: default_consumer_name(),
            group_start_id: default_group_start_id(),
            block_ms: default_block_ms(),
            batch_size: default_batch_size(),
            compression_level: default_compression_level(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl StreamConfig {
    /// Default config pointed at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `A3S_EVENTSTREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `A3S_EVENTSTREAM_*` key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("A3S_EVENTSTREAM_URL") {
            config.url = url;
        }
        if let Some(mode) = lookup("A3S_EVENTSTREAM_MODE") {
            config.mode = match mode.to_ascii_lowercase().as_str() {
                "direct" => ReadMode::Direct,
                "group" => ReadMode::Group,
                other => {
                    return Err(EventError::Config(format!(
                        "A3S_EVENTSTREAM_MODE must be 'direct' or 'group', got '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(group) = lookup("A3S_EVENTSTREAM_GROUP") {
            config.group.name = group;
        }
        if let Some(dlq) = lookup("A3S_EVENTSTREAM_DLQ") {
            config.group.dead_letter_channel = dlq;
        }
        if let Some(consumer) = lookup("A3S_EVENTSTREAM_CONSUMER") {
            config.consumer_name = consumer;
        }
        if let Some(block_ms) = lookup("A3S_EVENTSTREAM_BLOCK_MS") {
            config.block_ms = block_ms.parse().map_err(|e| {
                EventError::Config(format!(
                    "A3S_EVENTSTREAM_BLOCK_MS '{}' is not a number: {}",
                    block_ms, e
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the backend cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(EventError::Config("url cannot be empty".to_string()));
        }
        if self.block_ms == 0 || self.block_ms > 10_000 {
            return Err(EventError::Config(format!(
                "blockMs must be between 1 and 10000, got {}",
                self.block_ms
            )));
        }
        if self.batch_size == 0 {
            return Err(EventError::Config("batchSize must be >= 1".to_string()));
        }
        if self.mode == ReadMode::Group {
            if self.group.name.is_empty() {
                return Err(EventError::Config("group name cannot be empty".to_string()));
            }
            if self.consumer_name.is_empty() {
                return Err(EventError::Config("consumer name cannot be empty".to_string()));
            }
        }
        if self.group.dead_letter_channel.is_empty() {
            return Err(EventError::Config(
                "dead-letter channel cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the listener does when a subscriber's queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Wait for space; a slow subscriber slows delivery for everyone
    #[default]
    Block,
    /// Drop the event for that subscriber only
    DropNewest,
}

/// When a delivered entry is acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckPolicy {
    /// Ack after the event was handed to every subscriber queue
    #[default]
    AfterFanOut,
    /// Ack as soon as the entry is read, before fan-out (at-most-once)
    OnRead,
}

/// What the listener does with a payload that fails to decode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecodeFailurePolicy {
    /// Append to the dead-letter channel and ack the source entry
    #[default]
    DeadLetter,
    /// Log and skip
    Drop,
}

/// Client-side delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Capacity of each subscriber's delivery queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    #[serde(default)]
    pub ack: AckPolicy,

    #[serde(default)]
    pub decode_failure: DecodeFailurePolicy,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            ack: AckPolicy::default(),
            decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(EventError::Config("queueCapacity must be >= 1".to_string()));
        }
        Ok(())
    }
}
