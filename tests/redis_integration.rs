//! Redis Streams integration tests
//!
//! These tests require a running Redis server (5.0+):
//!   redis-server
//!
//! Set A3S_EVENTSTREAM_URL to point elsewhere than 127.0.0.1:6379.
//! Tests are skipped automatically if Redis is not available.

use a3s_eventstream::{
    Backend, ClientConfig, ConsumerGroup, EventError, EventStream, EventStreamClient, ReadMode,
    RedisStreamBackend, StreamConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn unique(prefix: &str) -> String {
    format!("test-{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn test_config(mode: ReadMode, suffix: &str) -> StreamConfig {
    let url = std::env::var("A3S_EVENTSTREAM_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    StreamConfig {
        mode,
        group: ConsumerGroup::new(
            unique(&format!("{}-group", suffix)),
            unique(&format!("{}-dlq", suffix)),
        ),
        connect_timeout_secs: 1,
        ..StreamConfig::new(url)
    }
}

/// Try to open a Redis backend. Returns None if the server is unavailable.
async fn try_redis_backend(mode: ReadMode, suffix: &str) -> Option<Arc<RedisStreamBackend>> {
    let backend = RedisStreamBackend::new(test_config(mode, suffix)).ok()?;
    match backend.open().await {
        Ok(()) => {
            // The client opens it again on connect
            let _ = backend.close().await;
            Some(Arc::new(backend))
        }
        Err(_) => {
            eprintln!("Redis not available, skipping integration test");
            None
        }
    }
}

/// Helper to create a connected client with Redis, or skip the test
macro_rules! redis_client {
    ($mode:expr, $suffix:expr) => {
        match try_redis_backend($mode, $suffix).await {
            Some(backend) => {
                let client =
                    EventStreamClient::from_shared(backend.clone(), ClientConfig::default())
                        .unwrap();
                client.connect().await.unwrap();
                (client, backend)
            }
            None => return,
        }
    };
}

async fn next<T: serde::de::DeserializeOwned>(
    stream: &mut EventStream<T>,
) -> a3s_eventstream::Event<T> {
    tokio::time::timeout(WAIT, stream.get())
        .await
        .expect("timed out waiting for event")
        .unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Order {
    sku: String,
    qty: u32,
}

#[tokio::test]
async fn test_redis_direct_skips_history() {
    let (client, _backend) = redis_client!(ReadMode::Direct, "direct");
    let channel = unique("orders");

    client.publish(&channel, "A").await.unwrap();
    client.publish(&channel, "B").await.unwrap();

    let mut stream = client.subscribe::<String>(&channel).await.unwrap();
    // Let the listener park on the new channel before publishing
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.publish(&channel, "C").await.unwrap();

    let event = next(&mut stream).await;
    assert_eq!(event.channel, channel);
    assert_eq!(event.message, "C");

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_redis_group_fan_out_and_ack() {
    let (client, backend) = redis_client!(ReadMode::Group, "group");
    let channel = unique("orders");

    let mut first = client.subscribe::<Order>(&channel).await.unwrap();
    let mut second = client.subscribe::<Order>(&channel).await.unwrap();

    let order = Order {
        sku: "A-1".to_string(),
        qty: 2,
    };
    let id = client.publish(&channel, &order).await.unwrap();

    let a = next(&mut first).await;
    let b = next(&mut second).await;
    assert_eq!(a.message, order);
    assert_eq!(b.id, id);
    assert_eq!(backend.stream_len(&channel).await.unwrap(), 1);

    first.unsubscribe().await.unwrap();
    client.publish(&channel, &order).await.unwrap();
    assert_eq!(next(&mut second).await.message.sku, "A-1");

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_redis_corrupt_entry_is_dead_lettered() {
    let (client, backend) = redis_client!(ReadMode::Group, "dlq");
    let channel = unique("orders");
    let mut stream = client.subscribe::<String>(&channel).await.unwrap();

    // Write a payload that bypasses the codec
    let redis = redis::Client::open(backend.config().url.as_str()).unwrap();
    let mut conn = redis.get_multiplexed_async_connection().await.unwrap();
    let _: String = redis::cmd("XADD")
        .arg(&channel)
        .arg("*")
        .arg("message")
        .arg(&b"not a zstd frame"[..])
        .query_async(&mut conn)
        .await
        .unwrap();
    client.publish(&channel, "after").await.unwrap();

    assert_eq!(next(&mut stream).await.message, "after");

    let dead = backend.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_channel, channel);
    assert_eq!(dead[0].message.as_ref(), b"not a zstd frame");

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_redis_disconnect_ends_streams() {
    let (client, _backend) = redis_client!(ReadMode::Direct, "disconnect");
    let mut stream = client.subscribe::<String>(&unique("orders")).await.unwrap();

    client.disconnect().await.unwrap();
    let ended = tokio::time::timeout(WAIT, stream.get()).await.unwrap();
    assert!(matches!(ended, Err(EventError::Unsubscribed)));
}

#[tokio::test]
async fn test_redis_unreachable_is_connection_error() {
    let config = StreamConfig {
        connect_timeout_secs: 1,
        ..StreamConfig::new("redis://127.0.0.1:1")
    };
    let client = EventStreamClient::redis(config, ClientConfig::default()).unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(err.is_broker_unavailable());
}
