//! Framing: JSON text frames and tagged binary chunk frames.
//!
//! Text vs binary is decided by the transport (data channel message type). Binary frames are
//! `message_id (16 bytes) || chunk bytes` so interleaved transfers can be demultiplexed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Width of the transfer tag prefixed to each binary chunk.
pub const CHUNK_TAG_LEN: usize = 16;
/// Inbound text frames above this size are rejected before parsing.
pub const MAX_TEXT_FRAME_LEN: usize = 1024 * 1024;

/// A frame as the transport carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("frame of {size} bytes exceeds cap of {cap}")]
    TooLarge { size: usize, cap: usize },
    #[error("binary frame shorter than chunk tag")]
    ShortChunk,
}

pub fn encode_json<T: Serialize>(msg: &T) -> Result<String, WireError> {
    serde_json::to_string(msg).map_err(WireError::Encode)
}

/// Encode and refuse anything larger than `cap` bytes.
pub fn encode_json_capped<T: Serialize>(msg: &T, cap: usize) -> Result<String, WireError> {
    let text = encode_json(msg)?;
    if text.len() > cap {
        return Err(WireError::TooLarge {
            size: text.len(),
            cap,
        });
    }
    Ok(text)
}

pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, WireError> {
    if text.len() > MAX_TEXT_FRAME_LEN {
        return Err(WireError::TooLarge {
            size: text.len(),
            cap: MAX_TEXT_FRAME_LEN,
        });
    }
    serde_json::from_str(text).map_err(WireError::Decode)
}

pub fn encode_chunk(transfer_id: Uuid, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_TAG_LEN + chunk.len());
    out.extend_from_slice(transfer_id.as_bytes());
    out.extend_from_slice(chunk);
    out
}

/// Split a binary frame into its transfer tag and chunk bytes.
pub fn decode_chunk(frame: &[u8]) -> Result<(Uuid, &[u8]), WireError> {
    if frame.len() < CHUNK_TAG_LEN {
        return Err(WireError::ShortChunk);
    }
    let mut tag = [0u8; CHUNK_TAG_LEN];
    tag.copy_from_slice(&frame[..CHUNK_TAG_LEN]);
    Ok((Uuid::from_bytes(tag), &frame[CHUNK_TAG_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlFrame, ProfileLite};

    #[test]
    fn chunk_tag_roundtrip() {
        let id = Uuid::new_v4();
        let frame = encode_chunk(id, b"abc");
        assert_eq!(frame.len(), CHUNK_TAG_LEN + 3);
        let (tag, body) = decode_chunk(&frame).unwrap();
        assert_eq!(tag, id);
        assert_eq!(body, b"abc");
    }

    #[test]
    fn empty_chunk_is_valid_but_short_tag_is_not() {
        let id = Uuid::new_v4();
        let frame = encode_chunk(id, &[]);
        assert_eq!(decode_chunk(&frame).unwrap().1.len(), 0);
        assert!(matches!(
            decode_chunk(&frame[..CHUNK_TAG_LEN - 1]),
            Err(WireError::ShortChunk)
        ));
    }

    #[test]
    fn capped_encode_rejects_oversize() {
        let big = ControlFrame::ProfileLite(ProfileLite {
            name: "n".repeat(2048),
            ..Default::default()
        });
        assert!(encode_json_capped(&big, 4096).is_ok());
        assert!(matches!(
            encode_json_capped(&big, 1024),
            Err(WireError::TooLarge { cap: 1024, .. })
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_json::<ControlFrame>("{not json"),
            Err(WireError::Decode(_))
        ));
    }
}
