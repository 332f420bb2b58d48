//! Frame codec (C1).
//!
//! Encodes/decodes the tagged-union wire message and the JSON text
//! fallback. The binary layout is a hand-rolled length-prefixed format;
//! `Data.payload` is sliced out of the inbound buffer without copying.

mod binary;
mod text;

use bytes::Bytes;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 65_536;

/// Wire error taxonomy for C1, surfaced to clients as `Error{400,...}`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid frame")]
    InvalidFrame,
    #[error("message too large ({0} bytes)")]
    MessageTooLarge(usize),
    #[error("empty message")]
    EmptyMessage,
}

/// The six message kinds carried by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 0,
    Disconnect = 1,
    Data = 2,
    Heartbeat = 3,
    Reconnect = 4,
    Error = 5,
}

impl MessageKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Data),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Reconnect),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// A decoded application-level message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect {
        session_id: String,
        client_version: String,
    },
    Disconnect {
        reason: String,
    },
    Data {
        payload: Bytes,
        message_id: u64,
        timestamp: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    Reconnect {
        session_id: String,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl Message {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Connect { .. } => MessageKind::Connect,
            Self::Disconnect { .. } => MessageKind::Disconnect,
            Self::Data { .. } => MessageKind::Data,
            Self::Heartbeat { .. } => MessageKind::Heartbeat,
            Self::Reconnect { .. } => MessageKind::Reconnect,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}

/// How the transport classified an inbound frame, used to pick the
/// primary decode path. The opcode is authoritative; first-byte
/// sniffing is only consulted when a transport hands over raw bytes
/// with no opcode of its own (e.g. the in-memory test transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHint {
    Binary,
    Text,
    Unknown,
}

/// Decode an inbound frame, honoring `hint` first and falling back to
/// first-byte sniffing per §4.1 of the wire contract. `bytes` is taken
/// by reference and cheaply cloned (an `Arc`-style refcount bump, not a
/// copy) onto the binary path, which splits `Data.payload` off the same
/// backing allocation instead of copying it.
pub fn decode(bytes: &Bytes, hint: FrameHint) -> Result<Message, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::EmptyMessage);
    }
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::MessageTooLarge(bytes.len()));
    }

    match hint {
        FrameHint::Text => text::decode(bytes),
        FrameHint::Binary => binary::decode(bytes.clone()),
        FrameHint::Unknown => {
            if is_json_prefix(bytes[0]) {
                text::decode(bytes).or_else(|_| binary::decode(bytes.clone()))
            } else {
                binary::decode(bytes.clone()).or_else(|_| {
                    if is_json_prefix(bytes[0]) {
                        text::decode(bytes)
                    } else {
                        Err(CodecError::InvalidFrame)
                    }
                })
            }
        }
    }
}

fn is_json_prefix(b: u8) -> bool {
    matches!(b, b'{' | b'[' | b'"')
}

/// Encode an outbound message for a binary-framed transport.
#[must_use]
pub fn encode_binary(message: &Message) -> Vec<u8> {
    binary::encode(message)
}

/// Encode an outbound message as the JSON text fallback.
#[must_use]
pub fn encode_text(message: &Message) -> String {
    text::encode(message)
}
