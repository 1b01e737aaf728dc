//! Wire framing for streamed events.
//!
//! Frame format:
//! ```text
//! [length: u32 LE][msgpack body: length bytes][crc32: u32 LE]
//! ```
//! The body is a named-field MessagePack encoding of [`Frame`].

use crate::error::{Result, StatusCode, StreamError};
use crate::types::Event;
use serde::{Deserialize, Serialize};

/// Sanity cap on a single frame body.
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// One message on a subscription stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    /// A change event, snapshot entry or boundary marker.
    Event(Event),
    /// Terminal status; nothing follows it.
    Status { code: StatusCode, message: String },
}

impl Frame {
    /// Terminal frame describing `error`.
    pub fn status(error: &StreamError) -> Self {
        Frame::Status {
            code: error.status_code(),
            message: error.to_string(),
        }
    }

    /// Human-readable rendering for logs and debugging tools.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Encode a frame with its length prefix and checksum.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(StreamError::Serialization(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(body.len() + 8);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(buf)
}

/// Decode one complete frame, verifying length and checksum.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < 8 {
        return Err(StreamError::Corruption(format!(
            "frame of {} bytes is shorter than its envelope",
            bytes.len()
        )));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE || bytes.len() != len + 8 {
        return Err(StreamError::Corruption(format!(
            "frame length {} does not match {} bytes received",
            len,
            bytes.len()
        )));
    }

    let body = &bytes[4..4 + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[4 + len..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let got = crc32fast::hash(body);
    if expected != got {
        return Err(StreamError::ChecksumMismatch { expected, got });
    }

    Ok(rmp_serde::from_slice(body)?)
}
