//! Outbound frames and the JSON envelope codec
//!
//! Both directions share one envelope:
//! `{"type": "<name>", "payload": {...}, "timestamp": "<rfc3339>"}`

use super::events::{EventKind, ServerEvent};
use super::room::RoomKey;
use crate::types::TempId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a `send_chat` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChat {
    pub room_id: String,
    pub content: String,
    pub client_temp_id: TempId,
}

/// Payload of a `typing` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub room_id: String,
    pub is_typing: bool,
}

/// Every frame the client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    JoinRoom(RoomKey),
    LeaveRoom(RoomKey),
    SendChat(SendChat),
    Typing(Typing),
}

/// What the transport does with a frame while it is not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Presence and room frames. Rebuilt from the registry on reconnect.
    DropWhenOffline,
    /// Operational sends, flushed once the link is back.
    QueueWhenOffline,
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::JoinRoom(_) => "join_room",
            ClientFrame::LeaveRoom(_) => "leave_room",
            ClientFrame::SendChat(_) => "send_chat",
            ClientFrame::Typing(_) => "typing",
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            ClientFrame::SendChat(_) => Delivery::QueueWhenOffline,
            ClientFrame::JoinRoom(_) | ClientFrame::LeaveRoom(_) | ClientFrame::Typing(_) => {
                Delivery::DropWhenOffline
            }
        }
    }

    /// Temporary id of the chat message this frame carries, if any
    pub fn temp_id(&self) -> Option<&TempId> {
        match self {
            ClientFrame::SendChat(chat) => Some(&chat.client_temp_id),
            _ => None,
        }
    }

    /// Serialize into a JSON text frame stamped with the current time
    pub fn encode(&self) -> Result<String> {
        let payload = match self {
            ClientFrame::JoinRoom(key) | ClientFrame::LeaveRoom(key) => serde_json::to_value(key)?,
            ClientFrame::SendChat(chat) => serde_json::to_value(chat)?,
            ClientFrame::Typing(typing) => serde_json::to_value(typing)?,
        };
        encode_envelope(self.name(), payload)
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: Value,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn encode_envelope(kind: &str, payload: Value) -> Result<String> {
    let envelope = OutgoingEnvelope {
        kind,
        payload,
        timestamp: Utc::now(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

fn read_envelope(text: &str) -> Result<IncomingEnvelope> {
    serde_json::from_str(text)
        .map_err(|e| Error::ProtocolError(format!("malformed envelope: {}", e)))
}

/// Decode one inbound text frame.
///
/// Unknown event names and malformed envelopes are `ProtocolError`;
/// a known name with a payload of the wrong shape is `InvalidData`.
pub fn decode_server_frame(text: &str) -> Result<ServerEvent> {
    let envelope = read_envelope(text)?;
    let kind = EventKind::from_wire(&envelope.kind)
        .ok_or_else(|| Error::ProtocolError(format!("unknown event type '{}'", envelope.kind)))?;

    ServerEvent::from_parts(kind, envelope.payload)
        .map_err(|e| Error::InvalidData(format!("{} payload: {}", kind, e)))
}

/// Encode a server event, as a server (or a test double) would send it
pub fn encode_server_event(event: &ServerEvent) -> Result<String> {
    encode_envelope(event.kind().as_str(), event.payload_value()?)
}

/// Decode a client frame, as the server (or a test double) would read it
pub fn decode_client_frame(text: &str) -> Result<ClientFrame> {
    let envelope = read_envelope(text)?;
    let payload = envelope.payload;

    Ok(match envelope.kind.as_str() {
        "join_room" => ClientFrame::JoinRoom(serde_json::from_value(payload)?),
        "leave_room" => ClientFrame::LeaveRoom(serde_json::from_value(payload)?),
        "send_chat" => ClientFrame::SendChat(serde_json::from_value(payload)?),
        "typing" => ClientFrame::Typing(serde_json::from_value(payload)?),
        other => {
            return Err(Error::ProtocolError(format!(
                "unknown client frame '{}'",
                other
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemMessage;
    use serde_json::json;

    #[test]
    fn test_join_frame_wire_format() {
        let text = ClientFrame::JoinRoom(RoomKey::chat("room1")).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "join_room");
        assert_eq!(value["payload"], json!({"kind": "chat", "id": "room1"}));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_send_chat_uses_camel_case() {
        let frame = ClientFrame::SendChat(SendChat {
            room_id: "room1".into(),
            content: "hello".into(),
            client_temp_id: TempId("tmp-1".into()),
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(value["payload"]["roomId"], "room1");
        assert_eq!(value["payload"]["clientTempId"], "tmp-1");
        assert_eq!(frame.delivery(), Delivery::QueueWhenOffline);
    }

    #[test]
    fn test_typing_is_droppable() {
        let frame = ClientFrame::Typing(Typing {
            room_id: "room1".into(),
            is_typing: true,
        });
        assert_eq!(frame.delivery(), Delivery::DropWhenOffline);
        assert!(frame.temp_id().is_none());
    }

    #[test]
    fn test_decode_server_frame() {
        let text = r#"{"type":"system_message","payload":{"message":"maintenance at noon"},"timestamp":"2025-03-01T12:00:00Z"}"#;
        let event = decode_server_frame(text).unwrap();
        assert_eq!(
            event,
            ServerEvent::SystemMessage(SystemMessage {
                message: "maintenance at noon".into(),
                level: None,
            })
        );
    }

    #[test]
    fn test_decode_distinguishes_unknown_and_malformed() {
        let unknown = decode_server_frame(r#"{"type":"shot","payload":{}}"#);
        assert!(matches!(unknown, Err(Error::ProtocolError(_))));

        let malformed = decode_server_frame(r#"{"type":"match_update","payload":{"x":1}}"#);
        assert!(matches!(malformed, Err(Error::InvalidData(_))));

        let garbage = decode_server_frame("not json");
        assert!(matches!(garbage, Err(Error::ProtocolError(_))));
    }

    #[test]
    fn test_client_frame_decodes_back() {
        let frame = ClientFrame::LeaveRoom(RoomKey::tournament("t-9"));
        let decoded = decode_client_frame(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
