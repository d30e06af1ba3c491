//! Error types for a3s-eventstream

use thiserror::Error;

/// Errors that can occur in the event stream client
#[derive(Debug, Error)]
pub enum EventError {
    /// Broker connection failure, or the backend is not open
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker command failure (Redis, etc.)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Publish failure
    #[error("Failed to publish to channel '{channel}': {reason}")]
    Publish { channel: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to channel '{channel}': {reason}")]
    Subscribe { channel: String, reason: String },

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Dead-letter routing failure
    #[error("Failed to dead-letter message from channel '{channel}': {reason}")]
    DeadLetter { channel: String, reason: String },

    /// Payload failed its integrity check or could not be decoded
    #[error("Failed to decode message {id} on channel '{channel}': {reason}")]
    Deserialization {
        channel: String,
        id: String,
        reason: String,
    },

    /// Message could not be encoded to its canonical form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// The subscription ended; normal end-of-stream
    #[error("Subscription ended")]
    Unsubscribed,

    /// Operation invoked outside the valid client state
    #[error("Invalid client state: {0}")]
    State(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener task panicked or was lost
    #[error("Listener error: {0}")]
    Listener(String),
}

impl EventError {
    /// True for connection-type failures (broker unreachable, backend closed)
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(self, EventError::Connection(_))
    }

    /// True for integrity/decoding failures of a received payload
    pub fn is_deserialization(&self) -> bool {
        matches!(self, EventError::Deserialization { .. })
    }
}

impl From<redis::RedisError> for EventError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout()
        {
            EventError::Connection(e.to_string())
        } else {
            EventError::Broker(e.to_string())
        }
    }
}

/// Result type alias for event stream operations
pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EventError::Connection("refused".into()).is_broker_unavailable());
        assert!(!EventError::Broker("WRONGTYPE".into()).is_broker_unavailable());

        let err = EventError::Deserialization {
            channel: "orders".into(),
            id: "1-0".into(),
            reason: "checksum mismatch".into(),
        };
        assert!(err.is_deserialization());
        assert_eq!(
            err.to_string(),
            "Failed to decode message 1-0 on channel 'orders': checksum mismatch"
        );
    }

    #[test]
    fn test_redis_error_mapping() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(EventError::from(io).is_broker_unavailable());

        let resp = redis::RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        assert!(matches!(EventError::from(resp), EventError::Broker(_)));
    }
}
