//! Binary tagged-union layout.
//!
//! `[type: u8][data_type: u8][fields...]`. `data_type` mirrors `type`
//! per the wire contract; a mismatch is treated as a corrupt frame.
//! Strings are length-prefixed with a `u16` byte count; `Data.payload`
//! is length-prefixed with a `u32` byte count and split off the inbound
//! `Bytes` with [`Bytes::split_to`], which advances the cursor without
//! copying the underlying allocation — the returned `Message::Data::payload`
//! shares the original buffer's storage.

use super::{CodecError, Message, MessageKind};
use bytes::{Buf, BufMut, Bytes};

pub fn decode(bytes: Bytes) -> Result<Message, CodecError> {
    let mut buf = bytes;
    if buf.remaining() < 2 {
        return Err(CodecError::InvalidFrame);
    }
    let type_tag = buf.get_u8();
    let data_type_tag = buf.get_u8();
    if type_tag != data_type_tag {
        return Err(CodecError::InvalidFrame);
    }
    let kind = MessageKind::from_u8(type_tag).ok_or(CodecError::InvalidFrame)?;

    match kind {
        MessageKind::Connect => {
            let session_id = read_string(&mut buf)?;
            let client_version = read_string(&mut buf)?;
            Ok(Message::Connect {
                session_id,
                client_version,
            })
        }
        MessageKind::Reconnect => {
            let session_id = read_string(&mut buf)?;
            Ok(Message::Reconnect { session_id })
        }
        MessageKind::Disconnect => {
            let reason = read_string(&mut buf)?;
            Ok(Message::Disconnect { reason })
        }
        MessageKind::Data => {
            if buf.remaining() < 16 {
                return Err(CodecError::InvalidFrame);
            }
            let message_id = buf.get_u64_le();
            let timestamp = buf.get_u64_le();
            let payload = read_bytes(&mut buf)?;
            Ok(Message::Data {
                payload,
                message_id,
                timestamp,
            })
        }
        MessageKind::Heartbeat => {
            if buf.remaining() < 8 {
                return Err(CodecError::InvalidFrame);
            }
            let timestamp = buf.get_u64_le();
            Ok(Message::Heartbeat { timestamp })
        }
        MessageKind::Error => {
            if buf.remaining() < 2 {
                return Err(CodecError::InvalidFrame);
            }
            let code = buf.get_u16_le();
            let message = read_string(&mut buf)?;
            Ok(Message::Error { code, message })
        }
    }
}

pub fn encode(message: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    let tag = message.kind() as u8;
    out.put_u8(tag);
    out.put_u8(tag);

    match message {
        Message::Connect {
            session_id,
            client_version,
        } => {
            write_string(&mut out, session_id);
            write_string(&mut out, client_version);
        }
        Message::Reconnect { session_id } => {
            write_string(&mut out, session_id);
        }
        Message::Disconnect { reason } => {
            write_string(&mut out, reason);
        }
        Message::Data {
            payload,
            message_id,
            timestamp,
        } => {
            out.put_u64_le(*message_id);
            out.put_u64_le(*timestamp);
            write_bytes(&mut out, payload);
        }
        Message::Heartbeat { timestamp } => {
            out.put_u64_le(*timestamp);
        }
        Message::Error { code, message } => {
            out.put_u16_le(*code);
            write_string(&mut out, message);
        }
    }

    out
}

fn read_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = read_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidFrame)
}

/// Split the next length-prefixed field off `buf` without copying: the
/// returned `Bytes` is a view into the same backing allocation as `buf`.
fn read_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::InvalidFrame);
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(CodecError::InvalidFrame);
    }
    Ok(buf.split_to(len))
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.put_u32_le(bytes.len() as u32);
    out.put_slice(bytes);
}
