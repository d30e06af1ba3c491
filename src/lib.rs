//! # a3s-eventstream
//!
//! Typed publish/subscribe over Redis Streams for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-eventstream` publishes typed messages onto named channels (one
//! Redis stream per channel) and delivers them to any number of
//! in-process subscribers through a single shared connection. Payloads
//! are canonical JSON compressed with zstd and protected by a frame
//! checksum; entries that fail the check are routed to a dead-letter
//! channel instead of reaching subscribers.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_eventstream::{EventStreamClient, MemoryBackend, ReadMode};
//!
//! # async fn example() -> a3s_eventstream::Result<()> {
//! let client = EventStreamClient::new(MemoryBackend::new(ReadMode::Direct));
//! client.connect().await?;
//!
//! let mut orders = client.subscribe::<String>("orders").await?;
//! client.publish("orders", "A-1001").await?;
//!
//! let event = orders.get().await?;
//! println!("{} on {}: {}", event.id, event.channel, event.message);
//!
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **redis**: Redis Streams with direct reads or consumer groups
//! - **memory**: In-process log with the same semantics, for tests
//!
//! ## Architecture
//!
//! - **Backend** trait: broker connection, cursors, packing, dead letters
//! - **EventStreamClient**: one listener task fanning out to subscribers
//! - **EventStream**: per-subscriber typed stream of events
//! - **Codec**: canonical JSON ↔ compressed, checksummed wire payload

pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod stream;
pub mod types;

// Re-export core types
pub use backend::{next_published, Backend, CorruptEntry, Received};
pub use client::{ClientState, EventStreamClient};
pub use codec::{decode_message, encode_message, Codec, JsonZstdCodec};
pub use config::{
    AckPolicy, ClientConfig, ConsumerGroup, DecodeFailurePolicy, OverflowPolicy, ReadMode,
    StreamConfig,
};
pub use error::{EventError, Result};
pub use stream::EventStream;
pub use types::{DeadLetterEntry, Delivery, EntryId, Event, RawEvent};

// Re-export backends for convenience
pub use backend::memory::MemoryBackend;
pub use backend::redis::RedisStreamBackend;
