//! JSON text fallback.
//!
//! A frame whose first byte is `{`, `[`, or `"` is parsed as a JSON
//! object `{type, ...}` and mapped to a [`Message`] kind by a fixed
//! table; any unrecognized `type` maps to `Data` per the wire contract.

use super::{CodecError, Message};
use bytes::Bytes;
use serde_json::Value;

pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| CodecError::InvalidFrame)?;
    let obj = value.as_object().ok_or(CodecError::InvalidFrame)?;
    let kind = obj.get("type").and_then(Value::as_str).unwrap_or("");

    match kind {
        "connect" | "connection" => Ok(Message::Connect {
            session_id: str_field(obj, "session_id"),
            client_version: str_field(obj, "client_version"),
        }),
        "disconnect" => Ok(Message::Disconnect {
            reason: str_field(obj, "reason"),
        }),
        "heartbeat" | "ping" => Ok(Message::Heartbeat {
            timestamp: u64_field(obj, "timestamp"),
        }),
        "reconnect" => Ok(Message::Reconnect {
            session_id: str_field(obj, "session_id"),
        }),
        "error" => Ok(Message::Error {
            code: obj.get("code").and_then(Value::as_u64).unwrap_or(0) as u16,
            message: str_field(obj, "message"),
        }),
        _ => Ok(Message::Data {
            payload: payload_field(obj),
            message_id: u64_field(obj, "message_id").max(u64_field(obj, "id")),
            timestamp: u64_field(obj, "timestamp"),
        }),
    }
}

pub fn encode(message: &Message) -> String {
    let value = match message {
        Message::Connect {
            session_id,
            client_version,
        } => serde_json::json!({
            "type": "connect",
            "session_id": session_id,
            "client_version": client_version,
        }),
        Message::Disconnect { reason } => serde_json::json!({
            "type": "disconnect",
            "reason": reason,
        }),
        Message::Data {
            payload,
            message_id,
            timestamp,
        } => serde_json::json!({
            "type": "data",
            "payload": payload.as_ref(),
            "message_id": message_id,
            "timestamp": timestamp,
        }),
        Message::Heartbeat { timestamp } => serde_json::json!({
            "type": "heartbeat",
            "timestamp": timestamp,
        }),
        Message::Reconnect { session_id } => serde_json::json!({
            "type": "reconnect",
            "session_id": session_id,
        }),
        Message::Error { code, message } => serde_json::json!({
            "type": "error",
            "code": code,
            "message": message,
        }),
    };
    value.to_string()
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn u64_field(obj: &serde_json::Map<String, Value>, key: &str) -> u64 {
    obj.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn payload_field(obj: &serde_json::Map<String, Value>) -> Bytes {
    match obj.get("payload") {
        Some(Value::Array(items)) => Bytes::from(
            items
                .iter()
                .filter_map(Value::as_u64)
                .map(|v| v as u8)
                .collect::<Vec<u8>>(),
        ),
        Some(Value::String(s)) => Bytes::from(s.clone().into_bytes()),
        _ => Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_alias_ping_maps_to_heartbeat() {
        let msg = decode(br#"{"type":"ping","timestamp":5}"#).unwrap();
        assert_eq!(msg, Message::Heartbeat { timestamp: 5 });
    }

    #[test]
    fn unrecognized_type_maps_to_data() {
        let msg = decode(br#"{"type":"anything","payload":[1,2,3],"id":7}"#).unwrap();
        assert_eq!(
            msg,
            Message::Data {
                payload: Bytes::from_static(&[1, 2, 3]),
                message_id: 7,
                timestamp: 0,
            }
        );
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert_eq!(decode(b"[1,2,3]"), Err(CodecError::InvalidFrame));
    }

    #[test]
    fn encode_decode_round_trip_for_reconnect() {
        let msg = Message::Reconnect {
            session_id: "abc".into(),
        };
        let text = encode(&msg);
        assert_eq!(decode(text.as_bytes()).unwrap(), msg);
    }
}
