//! Message codec: canonical JSON plus checksummed compression
//!
//! The publish path turns a typed message into canonical JSON
//! (`encode_message`) and the backend's `Codec` packs it for the wire.
//! The consume path reverses both steps. A payload that fails the
//! integrity check never reaches a consumer as a value.

use crate::error::{EventError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;

/// Default zstd level: balance between speed and ratio
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Wire codec applied by a backend to canonical message bytes
pub trait Codec: Send + Sync {
    /// Pack canonical bytes into the wire payload
    fn pack(&self, canonical: &[u8]) -> Result<Bytes>;

    /// Verify and unpack a wire payload back into canonical bytes
    fn unpack(&self, payload: &[u8]) -> Result<Bytes>;

    /// Codec name (e.g., "json+zstd")
    fn name(&self) -> &str;
}

/// JSON + zstd frame with content checksum
#[derive(Debug, Clone)]
pub struct JsonZstdCodec {
    level: i32,
}

impl JsonZstdCodec {
    /// Create a codec with an explicit zstd compression level
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Compression level in use
    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for JsonZstdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Codec for JsonZstdCodec {
    fn pack(&self, canonical: &[u8]) -> Result<Bytes> {
        let buffer = Vec::with_capacity(canonical.len() / 2);
        let mut encoder = zstd::stream::Encoder::new(buffer, self.level)
            .map_err(|e| EventError::Codec(format!("Failed to create encoder: {}", e)))?;
        encoder
            .include_checksum(true)
            .map_err(|e| EventError::Codec(format!("Failed to enable checksum: {}", e)))?;
        encoder
            .write_all(canonical)
            .map_err(|e| EventError::Codec(format!("Failed to compress payload: {}", e)))?;
        let packed = encoder
            .finish()
            .map_err(|e| EventError::Codec(format!("Failed to finish frame: {}", e)))?;
        Ok(Bytes::from(packed))
    }

    fn unpack(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.is_empty() {
            return Err(EventError::Codec("empty payload".to_string()));
        }
        let canonical = zstd::stream::decode_all(payload)
            .map_err(|e| EventError::Codec(format!("corrupt frame: {}", e)))?;
        std::str::from_utf8(&canonical)
            .map_err(|e| EventError::Codec(format!("payload is not UTF-8: {}", e)))?;
        Ok(Bytes::from(canonical))
    }

    fn name(&self) -> &str {
        "json+zstd"
    }
}

/// Encode a typed message into its canonical JSON form
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode canonical JSON into a typed message
///
/// `channel` and `id` only feed the error context.
pub fn decode_message<T: DeserializeOwned>(channel: &str, id: &str, canonical: &[u8]) -> Result<T> {
    serde_json::from_slice(canonical).map_err(|e| EventError::Deserialization {
        channel: channel.to_string(),
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        sku: String,
        qty: u32,
    }

    fn roundtrip<T>(codec: &JsonZstdCodec, message: &T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let packed = codec.pack(&encode_message(message).unwrap()).unwrap();
        let canonical = codec.unpack(&packed).unwrap();
        decode_message("orders", "1-0", &canonical).unwrap()
    }

    #[test]
    fn test_typed_roundtrip() {
        let codec = JsonZstdCodec::default();
        let order = Order {
            sku: "A-1".to_string(),
            qty: 3,
        };
        assert_eq!(roundtrip(&codec, &order), order);
    }

    #[test]
    fn test_codec_identity() {
        let codec = JsonZstdCodec::default();
        assert_eq!(codec.level(), DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(codec.name(), "json+zstd");

        let fast = JsonZstdCodec::new(1);
        assert_eq!(fast.level(), 1);
        let packed = fast.pack(b"[1,2,3]").unwrap();
        assert_eq!(codec.unpack(&packed).unwrap().as_ref(), b"[1,2,3]");
    }

    #[test]
    fn test_empty_and_large_payloads() {
        let codec = JsonZstdCodec::default();
        assert_eq!(roundtrip(&codec, &String::new()), "");

        let large = "x".repeat(1024 * 1024);
        let packed = codec.pack(&encode_message(&large).unwrap()).unwrap();
        assert!(packed.len() < large.len() / 10);
        assert_eq!(roundtrip(&codec, &large), large);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let codec = JsonZstdCodec::default();
        assert!(matches!(codec.unpack(b""), Err(EventError::Codec(_))));
        assert!(matches!(codec.unpack(b"not a frame"), Err(EventError::Codec(_))));
    }

    #[test]
    fn test_unpack_detects_corruption() {
        let codec = JsonZstdCodec::new(19);
        let text = "the quick brown fox jumps over the lazy dog".repeat(8);
        let canonical = encode_message(&text).unwrap();
        let mut packed = codec.pack(&canonical).unwrap().to_vec();

        // Flip a bit in the checksum trailer
        let last = packed.len() - 1;
        packed[last] ^= 0x01;
        assert!(codec.unpack(&packed).is_err());
    }

    #[test]
    fn test_decode_type_mismatch_is_classified() {
        let err = decode_message::<Order>("orders", "5-0", b"\"just a string\"").unwrap_err();
        match err {
            EventError::Deserialization { channel, id, .. } => {
                assert_eq!(channel, "orders");
                assert_eq!(id, "5-0");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
