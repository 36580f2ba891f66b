//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [length: u32 LE][version: u8][payload: bincode-encoded (rank, Message)]
//! ```
//!
//! The length prefix covers everything after itself. The sender's rank rides
//! in the payload so the receiver can attribute frames without relying on
//! socket identity.

use satswarm_messages::Message;
use satswarm_types::WorkerRank;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Frames above this size are rejected as corrupt.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("frame too short")]
    FrameTooShort,

    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    #[error("payload decode error: {0}")]
    Decode(String),

    #[error("payload encode error: {0}")]
    Encode(String),
}

/// Encode a message into a version-prefixed frame body (without the length
/// prefix, which the transport writes).
pub fn encode_frame(from: WorkerRank, message: &Message) -> Result<Vec<u8>, CodecError> {
    let payload =
        bincode::serialize(&(from, message)).map_err(|e| CodecError::Encode(e.to_string()))?;
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a frame body back into the sender rank and the message.
pub fn decode_frame(data: &[u8]) -> Result<(WorkerRank, Message), CodecError> {
    if data.is_empty() {
        return Err(CodecError::FrameTooShort);
    }
    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(data.len()));
    }
    let version = data[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    bincode::deserialize(&data[1..]).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use satswarm_types::{JobId, JobRequest};
    use std::time::Duration;

    #[test]
    fn test_round_trip_find_node() {
        let req = JobRequest::new(JobId(7), 0, 3, 5, Duration::from_secs(2), 4);
        let message = Message::FindNode(req.clone());

        let bytes = encode_frame(3, &message).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);

        let (from, decoded) = decode_frame(&bytes).unwrap();
        assert_eq!(from, 3);
        match decoded {
            Message::FindNode(decoded_req) => assert_eq!(decoded_req, req),
            other => panic!("expected FindNode, got {}", other.tag()),
        }
    }

    #[test]
    fn test_round_trip_volume_update() {
        let message = Message::UpdateVolume {
            job_id: JobId(1),
            volume: 6,
        };
        let bytes = encode_frame(0, &message).unwrap();
        let (_, decoded) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let bytes = vec![99, 1, 2, 3];
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(matches!(decode_frame(&[]), Err(CodecError::FrameTooShort)));
    }
}
