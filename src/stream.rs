//! Per-subscriber event stream

use crate::client::SubscriptionGuard;
use crate::codec::decode_message;
use crate::error::{EventError, Result};
use crate::types::{Delivery, Event, RawEvent};
use futures::Stream;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;

/// Events delivered to one subscriber of one channel
///
/// Yields every event published on the channel after the subscription
/// started, in publication order. Ends with `EventError::Unsubscribed`
/// (or `None` when polled as a `Stream`) once the subscription or the
/// client is closed.
///
/// Dropping the stream releases the subscription in the background;
/// `unsubscribe` does it immediately and reports backend errors.
pub struct EventStream<T> {
    channel: String,
    queue: mpsc::Receiver<Delivery>,
    guard: SubscriptionGuard,
    closed: bool,
    _message: PhantomData<fn() -> T>,
}

impl<T> EventStream<T> {
    pub(crate) fn new(
        channel: &str,
        queue: mpsc::Receiver<Delivery>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            queue,
            guard,
            closed: false,
            _message: PhantomData,
        }
    }

    /// Channel this stream reads
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// End the subscription now
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.closed = true;
        self.guard.release().await
    }
}

impl<T: DeserializeOwned> EventStream<T> {
    /// Wait for the next event
    ///
    /// A message that does not decode as `T` is returned as
    /// `EventError::Deserialization` and the stream stays usable.
    pub async fn get(&mut self) -> Result<Event<T>> {
        if self.closed {
            return Err(EventError::Unsubscribed);
        }
        match self.queue.recv().await {
            Some(Delivery::Event(raw)) => decode(&raw),
            Some(Delivery::Closed) | None => {
                self.closed = true;
                Err(EventError::Unsubscribed)
            }
        }
    }
}

impl<T: DeserializeOwned> Stream for EventStream<T> {
    type Item = Result<Event<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }
        match ready!(this.queue.poll_recv(cx)) {
            Some(Delivery::Event(raw)) => Poll::Ready(Some(decode(&raw))),
            Some(Delivery::Closed) | None => {
                this.closed = true;
                Poll::Ready(None)
            }
        }
    }
}

fn decode<T: DeserializeOwned>(raw: &RawEvent) -> Result<Event<T>> {
    let message = decode_message(&raw.channel, raw.id.as_str(), &raw.message)?;
    Ok(Event {
        channel: raw.channel.clone(),
        message,
        id: raw.id.clone(),
    })
}
