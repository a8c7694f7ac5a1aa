//! Stream multiplexing frames
//!
//! Frame format:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: message type (0=data, 1=fin)
//! - Rest: payload

use serde::{Deserialize, Serialize};

pub(crate) const MSG_TYPE_DATA: u8 = 0;
pub(crate) const MSG_TYPE_FIN: u8 = 1;

const HEADER_LEN: usize = 5;

/// Encode a multiplexed frame
pub(crate) fn encode_frame(stream_id: u32, msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(payload);
    frame
}

/// Decode a multiplexed frame header
pub(crate) fn decode_frame_header(data: &[u8]) -> Option<(u32, u8, &[u8])> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Some((stream_id, data[4], &data[HEADER_LEN..]))
}

/// Control messages exchanged as text frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Register {
        lease: String,
        name: String,
        protocols: Vec<String>,
    },
    Registered,
    Error {
        message: String,
    },
}
