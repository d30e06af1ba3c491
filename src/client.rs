//! Event stream client: one backend, many in-process subscribers
//!
//! `EventStreamClient` owns a single backend and a single listener task.
//! The listener pulls everything the backend reads and copies each event
//! into the delivery queue of every subscriber registered for its channel.

use crate::backend::redis::RedisStreamBackend;
use crate::backend::{next_published, Backend, Received};
use crate::codec::encode_message;
use crate::config::{
    AckPolicy, ClientConfig, DecodeFailurePolicy, OverflowPolicy, ReadMode, StreamConfig,
};
use crate::error::{EventError, Result};
use crate::stream::EventStream;
use crate::types::{Delivery, EntryId, RawEvent};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected; publish and subscribe are rejected
    Disconnected,
    /// Backend open and listener running
    Connected,
    /// Listener stopped with an error; `disconnect` returns it
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Disconnected => f.write_str("disconnected"),
            ClientState::Connected => f.write_str("connected"),
            ClientState::Failed => f.write_str("failed"),
        }
    }
}

/// One registered delivery queue
struct Subscriber {
    queue: mpsc::Sender<Delivery>,

    /// Entries at or below this id were published before the subscription
    after: Option<EntryId>,
}

/// Channel → subscriber queues, plus the lifecycle state
///
/// A channel key exists only while at least one queue is registered.
pub(crate) struct Registry {
    state: ClientState,
    channels: HashMap<String, HashMap<u64, Subscriber>>,
    next_id: u64,
}

impl Registry {
    fn new() -> Self {
        Self {
            state: ClientState::Disconnected,
            channels: HashMap::new(),
            next_id: 0,
        }
    }

    fn insert(
        &mut self,
        channel: &str,
        queue: mpsc::Sender<Delivery>,
        after: Option<EntryId>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, Subscriber { queue, after });
        id
    }

    /// Remove one queue; drops the channel entry when it was the last
    fn remove(&mut self, channel: &str, id: u64) -> Option<mpsc::Sender<Delivery>> {
        let queues = self.channels.get_mut(channel)?;
        let subscriber = queues.remove(&id);
        if queues.is_empty() {
            self.channels.remove(channel);
        }
        subscriber.map(|subscriber| subscriber.queue)
    }

    /// Queues that should receive entry `id` of `channel`, oldest first
    fn queues(&self, channel: &str, id: &EntryId) -> Vec<(u64, mpsc::Sender<Delivery>)> {
        let Some(subscribers) = self.channels.get(channel) else {
            return Vec::new();
        };
        let mut queues: Vec<_> = subscribers
            .iter()
            .filter(|(_, s)| s.after.as_ref().map_or(true, |after| id > after))
            .map(|(subscriber, s)| (*subscriber, s.queue.clone()))
            .collect();
        queues.sort_by_key(|(subscriber, _)| *subscriber);
        queues
    }

    /// Close and forget every queue
    fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (_, subscribers) in self.channels.drain() {
            for (_, subscriber) in subscribers {
                let _ = subscriber.queue.try_send(Delivery::Closed);
                closed += 1;
            }
        }
        closed
    }
}

/// Removes a subscriber's queue from the registry when its stream ends
pub(crate) struct SubscriptionGuard {
    channel: String,
    id: u64,
    registry: Arc<Mutex<Registry>>,
    backend: Arc<dyn Backend>,
    active: bool,
}

impl SubscriptionGuard {
    /// Deregister now; later calls are no-ops
    pub(crate) async fn release(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        release_subscription(&self.registry, &self.backend, &self.channel, self.id).await
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                channel = %self.channel,
                "Subscription dropped outside a runtime; not released"
            );
            return;
        };
        let registry = self.registry.clone();
        let backend = self.backend.clone();
        let channel = std::mem::take(&mut self.channel);
        let id = self.id;
        runtime.spawn(async move {
            if let Err(e) = release_subscription(&registry, &backend, &channel, id).await {
                tracing::warn!(
                    channel = %channel,
                    error = %e,
                    "Failed to release dropped subscription"
                );
            }
        });
    }
}

async fn release_subscription(
    registry: &Mutex<Registry>,
    backend: &Arc<dyn Backend>,
    channel: &str,
    id: u64,
) -> Result<()> {
    let mut registry = registry.lock().await;
    // Already closed by disconnect
    let Some(queue) = registry.remove(channel, id) else {
        return Ok(());
    };
    let _ = queue.try_send(Delivery::Closed);

    if !registry.channels.contains_key(channel) && registry.state == ClientState::Connected {
        backend.unsubscribe(channel).await?;
        tracing::info!(channel = %channel, "Last local subscriber left");
    }
    Ok(())
}

/// Publish/subscribe client multiplexing one backend connection
///
/// Thread-safe; share it behind an `Arc`.
pub struct EventStreamClient {
    backend: Arc<dyn Backend>,
    config: ClientConfig,
    registry: Arc<Mutex<Registry>>,

    /// Listener task; the lock also serializes connect/disconnect
    listener: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl EventStreamClient {
    /// Create a client with default delivery settings
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::from_backend(Arc::new(backend), ClientConfig::default())
    }

    /// Create a client with explicit delivery settings
    pub fn with_config(backend: impl Backend + 'static, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_backend(Arc::new(backend), config))
    }

    /// Create a client backed by Redis Streams
    pub fn redis(stream: StreamConfig, config: ClientConfig) -> Result<Self> {
        let backend = RedisStreamBackend::new(stream)?;
        Self::with_config(backend, config)
    }

    /// Create a client over a backend the caller keeps a handle to
    pub fn from_shared(backend: Arc<dyn Backend>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_backend(backend, config))
    }

    fn from_backend(backend: Arc<dyn Backend>, config: ClientConfig) -> Self {
        Self {
            backend,
            config,
            registry: Arc::new(Mutex::new(Registry::new())),
            listener: Mutex::new(None),
        }
    }

    /// Open the backend and start the listener task
    pub async fn connect(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Err(EventError::State(
                "connect called while already connected".to_string(),
            ));
        }

        self.backend.open().await?;
        self.registry.lock().await.state = ClientState::Connected;

        *listener = Some(tokio::spawn(run_listener(
            self.backend.clone(),
            self.registry.clone(),
            self.config.clone(),
        )));

        tracing::info!(
            backend = self.backend.name(),
            mode = ?self.backend.mode(),
            "Event stream client connected"
        );
        Ok(())
    }

    /// Stop the listener, end every subscription and close the backend
    ///
    /// Returns the error the listener stopped with, if it had already
    /// failed. Calling it while disconnected is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        let Some(handle) = listener.take() else {
            return Ok(());
        };

        let closed = {
            let mut registry = self.registry.lock().await;
            registry.state = ClientState::Disconnected;
            registry.close_all()
        };

        let outcome = if handle.is_finished() {
            listener_outcome(handle.await)
        } else {
            handle.abort();
            match handle.await {
                Err(e) if e.is_cancelled() => Ok(()),
                other => listener_outcome(other),
            }
        };

        let closed_backend = self.backend.close().await;
        tracing::info!(subscriptions_closed = closed, "Event stream client disconnected");

        outcome.and(closed_backend)
    }

    /// Encode `message` and append it to `channel`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        message: &T,
    ) -> Result<EntryId> {
        self.ensure_connected("publish").await?;
        let canonical = encode_message(message)?;
        self.backend.publish(channel, &canonical).await
    }

    /// Register a new subscriber on `channel`
    ///
    /// The first local subscriber of a channel subscribes the backend.
    /// The subscription ends when the returned stream is unsubscribed or
    /// dropped; the last one to leave unsubscribes the backend.
    pub async fn subscribe<T: DeserializeOwned>(&self, channel: &str) -> Result<EventStream<T>> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let id = {
            let mut registry = self.registry.lock().await;
            if registry.state != ClientState::Connected {
                return Err(EventError::State(format!(
                    "cannot subscribe to '{}' while {}",
                    channel, registry.state
                )));
            }
            let joining = registry.channels.contains_key(channel);
            // The first group subscriber takes the backlog; everyone else
            // starts after the newest entry already in the log
            let after = if joining || self.backend.mode() == ReadMode::Direct {
                self.backend.last_id(channel).await?
            } else {
                None
            };
            if !joining {
                self.backend.subscribe(channel).await?;
                tracing::info!(channel = %channel, "First local subscriber joined");
            }
            registry.insert(channel, tx, after)
        };

        tracing::debug!(channel = %channel, subscriber = id, "Subscriber registered");

        let guard = SubscriptionGuard {
            channel: channel.to_string(),
            id,
            registry: self.registry.clone(),
            backend: self.backend.clone(),
            active: true,
        };
        Ok(EventStream::new(channel, rx, guard))
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ClientState {
        self.registry.lock().await.state
    }

    /// Number of local subscribers on `channel`
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .await
            .channels
            .get(channel)
            .map_or(0, |queues| queues.len())
    }

    /// Channels with at least one local subscriber
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> =
            self.registry.lock().await.channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Get a reference to the underlying backend
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Delivery settings in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn ensure_connected(&self, operation: &str) -> Result<()> {
        match self.registry.lock().await.state {
            ClientState::Connected => Ok(()),
            state => Err(EventError::State(format!("cannot {} while {}", operation, state))),
        }
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }

        // Streams outlive the client; end them so blocked consumers wake
        match self.registry.try_lock() {
            Ok(mut registry) => shut_registry(&mut registry),
            Err(_) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    tracing::warn!("Client dropped outside a runtime; open streams not closed");
                    return;
                };
                let registry = self.registry.clone();
                runtime.spawn(async move {
                    shut_registry(&mut *registry.lock().await);
                });
            }
        }
    }
}

fn shut_registry(registry: &mut Registry) {
    registry.state = ClientState::Disconnected;
    let closed = registry.close_all();
    if closed > 0 {
        tracing::debug!(subscriptions_closed = closed, "Client dropped with open subscriptions");
    }
}

fn listener_outcome(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(EventError::Listener(e.to_string())),
    }
}

/// The single read loop: backend → fan-out → ack
async fn run_listener(
    backend: Arc<dyn Backend>,
    registry: Arc<Mutex<Registry>>,
    config: ClientConfig,
) -> Result<()> {
    let received = next_published(backend.clone());
    futures::pin_mut!(received);

    tracing::debug!(backend = backend.name(), "Listener started");

    while let Some(next) = received.next().await {
        let handled = match next {
            Ok(received) => handle_received(backend.as_ref(), &registry, &config, received).await,
            Err(e) => Err(e),
        };

        if let Err(e) = handled {
            tracing::error!(error = %e, "Listener stopped");
            let mut registry = registry.lock().await;
            registry.state = ClientState::Failed;
            registry.close_all();
            return Err(e);
        }
    }

    Ok(())
}

async fn handle_received(
    backend: &dyn Backend,
    registry: &Mutex<Registry>,
    config: &ClientConfig,
    received: Received,
) -> Result<()> {
    let acks = backend.mode() == ReadMode::Group;

    match received {
        Received::Event(event) => {
            if acks && config.ack == AckPolicy::OnRead {
                backend.ack(&event.channel, &event.id).await?;
            }

            let event = Arc::new(event);
            let delivered = fan_out(registry, &event, config.overflow).await;
            tracing::debug!(
                channel = %event.channel,
                id = %event.id,
                subscribers = delivered,
                "Event delivered"
            );

            if acks && config.ack == AckPolicy::AfterFanOut {
                backend.ack(&event.channel, &event.id).await?;
            }
            Ok(())
        }
        Received::Corrupt(entry) => {
            let error = entry.error();
            match config.decode_failure {
                DecodeFailurePolicy::DeadLetter => {
                    tracing::warn!(
                        error = %error,
                        "Routing undecodable message to dead-letter channel"
                    );
                    backend
                        .move_to_dead_letter(&entry.channel, &entry.id, &entry.payload)
                        .await
                }
                DecodeFailurePolicy::Drop => {
                    tracing::warn!(error = %error, "Dropping undecodable message");
                    if acks {
                        backend.ack(&entry.channel, &entry.id).await?;
                    }
                    Ok(())
                }
            }
        }
    }
}

/// Copy one event into every queue registered for its channel
///
/// Returns how many subscribers accepted it.
async fn fan_out(
    registry: &Mutex<Registry>,
    event: &Arc<RawEvent>,
    overflow: OverflowPolicy,
) -> usize {
    let queues = registry.lock().await.queues(&event.channel, &event.id);
    let mut delivered = 0;

    for (subscriber, queue) in queues {
        let delivery = Delivery::Event(event.clone());
        let accepted = match overflow {
            OverflowPolicy::Block => queue.send(delivery).await.is_ok(),
            OverflowPolicy::DropNewest => match queue.try_send(delivery) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        channel = %event.channel,
                        id = %event.id,
                        subscriber,
                        "Subscriber queue full, event dropped"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            },
        };
        if accepted {
            delivered += 1;
        }
    }

    delivered
}
