//! Screen frame payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured screen frame.
///
/// The payload is opaque encoded image data (PNG or JPEG as produced by the
/// capture primitive). Sequence numbers increase monotonically per agent so
/// the remote side can detect gaps from backpressure drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonically increasing capture sequence number.
    pub sequence: u64,
    /// When the frame was captured.
    pub captured_at: DateTime<Utc>,
    /// Encoded image bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame captured now.
    pub fn new(sequence: u64, data: Vec<u8>) -> Self {
        Self {
            sequence,
            captured_at: Utc::now(),
            data,
        }
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_data_is_base64_on_the_wire() {
        let frame = Frame::new(7, vec![0x89, b'P', b'N', b'G']);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["data"], "iVBORw==");

        let back: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }
}
