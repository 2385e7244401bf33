//! Inbound event taxonomy
//!
//! Every frame the server pushes decodes into one [`ServerEvent`] variant.
//! Each variant binds exactly one payload type, and [`EventPayload`] maps a
//! payload type back to its [`EventKind`] so consumers can subscribe by type
//! instead of by string name.

use super::room::RoomKey;
use crate::types::{SessionId, TempId};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Discriminant of an inbound event, used as the routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    TournamentUpdate,
    MatchUpdate,
    ChatMessage,
    TypingIndicator,
    Notification,
    SystemMessage,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::TournamentUpdate,
        EventKind::MatchUpdate,
        EventKind::ChatMessage,
        EventKind::TypingIndicator,
        EventKind::Notification,
        EventKind::SystemMessage,
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Reconnecting,
        EventKind::Error,
    ];

    /// Event name as it appears in the envelope `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TournamentUpdate => "tournament_update",
            EventKind::MatchUpdate => "match_update",
            EventKind::ChatMessage => "chat_message",
            EventKind::TypingIndicator => "typing_indicator",
            EventKind::Notification => "notification",
            EventKind::SystemMessage => "system_message",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Reconnecting => "reconnecting",
            EventKind::Error => "error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentUpdate {
    pub tournament_id: String,
    /// registration, active, completed, cancelled
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub round: Option<u32>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScores {
    pub player1: f64,
    pub player2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchUpdate {
    pub match_id: String,
    /// waiting, active, completed, cancelled
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scores: Option<MatchScores>,
    #[serde(default)]
    pub data: Value,
}

/// A server-authoritative chat message.
///
/// When the server echoes one of our own sends it carries the temporary id
/// we generated, which is how the outbox reconciles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<TempId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub room_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub category: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessage {
    pub message: String,
    #[serde(default)]
    pub level: Option<String>,
}

/// Server welcome after a successful, authenticated open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub session_id: SessionId,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnected {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconnecting {
    pub attempt: u32,
    pub delay_ms: u64,
}

/// Server-side error report, optionally tied to one of our sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<TempId>,
}

// ─── Events ──────────────────────────────────────────────────────────

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    TournamentUpdate(TournamentUpdate),
    MatchUpdate(MatchUpdate),
    ChatMessage(ChatMessage),
    TypingIndicator(TypingIndicator),
    Notification(Notification),
    SystemMessage(SystemMessage),
    Connected(Connected),
    Disconnected(Disconnected),
    Reconnecting(Reconnecting),
    Error(ErrorFrame),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::TournamentUpdate(_) => EventKind::TournamentUpdate,
            ServerEvent::MatchUpdate(_) => EventKind::MatchUpdate,
            ServerEvent::ChatMessage(_) => EventKind::ChatMessage,
            ServerEvent::TypingIndicator(_) => EventKind::TypingIndicator,
            ServerEvent::Notification(_) => EventKind::Notification,
            ServerEvent::SystemMessage(_) => EventKind::SystemMessage,
            ServerEvent::Connected(_) => EventKind::Connected,
            ServerEvent::Disconnected(_) => EventKind::Disconnected,
            ServerEvent::Reconnecting(_) => EventKind::Reconnecting,
            ServerEvent::Error(_) => EventKind::Error,
        }
    }

    /// Room this event belongs to. None for session-wide events.
    pub fn room(&self) -> Option<RoomKey> {
        match self {
            ServerEvent::TournamentUpdate(update) => {
                Some(RoomKey::tournament(update.tournament_id.as_str()))
            }
            ServerEvent::MatchUpdate(update) => Some(RoomKey::match_room(update.match_id.as_str())),
            ServerEvent::ChatMessage(message) => Some(RoomKey::chat(message.room_id.as_str())),
            ServerEvent::TypingIndicator(typing) => Some(RoomKey::chat(typing.room_id.as_str())),
            _ => None,
        }
    }

    /// Build an event from its kind and raw payload.
    ///
    /// A missing payload is treated as an empty object so payload types
    /// whose fields are all optional still decode.
    pub fn from_parts(kind: EventKind, payload: Value) -> Result<Self> {
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        Ok(match kind {
            EventKind::TournamentUpdate => {
                ServerEvent::TournamentUpdate(serde_json::from_value(payload)?)
            }
            EventKind::MatchUpdate => ServerEvent::MatchUpdate(serde_json::from_value(payload)?),
            EventKind::ChatMessage => ServerEvent::ChatMessage(serde_json::from_value(payload)?),
            EventKind::TypingIndicator => {
                ServerEvent::TypingIndicator(serde_json::from_value(payload)?)
            }
            EventKind::Notification => ServerEvent::Notification(serde_json::from_value(payload)?),
            EventKind::SystemMessage => {
                ServerEvent::SystemMessage(serde_json::from_value(payload)?)
            }
            EventKind::Connected => ServerEvent::Connected(serde_json::from_value(payload)?),
            EventKind::Disconnected => ServerEvent::Disconnected(serde_json::from_value(payload)?),
            EventKind::Reconnecting => ServerEvent::Reconnecting(serde_json::from_value(payload)?),
            EventKind::Error => ServerEvent::Error(serde_json::from_value(payload)?),
        })
    }

    /// The payload as a JSON value (inverse of [`ServerEvent::from_parts`])
    pub fn payload_value(&self) -> Result<Value> {
        let value = match self {
            ServerEvent::TournamentUpdate(p) => serde_json::to_value(p)?,
            ServerEvent::MatchUpdate(p) => serde_json::to_value(p)?,
            ServerEvent::ChatMessage(p) => serde_json::to_value(p)?,
            ServerEvent::TypingIndicator(p) => serde_json::to_value(p)?,
            ServerEvent::Notification(p) => serde_json::to_value(p)?,
            ServerEvent::SystemMessage(p) => serde_json::to_value(p)?,
            ServerEvent::Connected(p) => serde_json::to_value(p)?,
            ServerEvent::Disconnected(p) => serde_json::to_value(p)?,
            ServerEvent::Reconnecting(p) => serde_json::to_value(p)?,
            ServerEvent::Error(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }
}

/// A payload type bound to exactly one [`EventKind`]
pub trait EventPayload: Send + Sync + 'static {
    const KIND: EventKind;

    /// Borrow the payload if `event` is of this type
    fn from_event(event: &ServerEvent) -> Option<&Self>;
}

macro_rules! bind_payloads {
    ($($variant:ident => $payload:ty),* $(,)?) => {
        $(
            impl EventPayload for $payload {
                const KIND: EventKind = EventKind::$variant;

                fn from_event(event: &ServerEvent) -> Option<&Self> {
                    match event {
                        ServerEvent::$variant(payload) => Some(payload),
                        _ => None,
                    }
                }
            }

            impl From<$payload> for ServerEvent {
                fn from(payload: $payload) -> Self {
                    ServerEvent::$variant(payload)
                }
            }
        )*
    };
}

bind_payloads! {
    TournamentUpdate => TournamentUpdate,
    MatchUpdate => MatchUpdate,
    ChatMessage => ChatMessage,
    TypingIndicator => TypingIndicator,
    Notification => Notification,
    SystemMessage => SystemMessage,
    Connected => Connected,
    Disconnected => Disconnected,
    Reconnecting => Reconnecting,
    Error => ErrorFrame,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_kind_round_trips_its_wire_name() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("game_state"), None);
    }

    #[test]
    fn test_chat_message_payload_decodes() {
        let event = ServerEvent::from_parts(
            EventKind::ChatMessage,
            json!({
                "id": "srv-1",
                "roomId": "room1",
                "senderId": "u-7",
                "content": "hello",
                "timestamp": "2025-03-01T12:00:00Z",
                "clientTempId": "tmp-abc"
            }),
        )
        .unwrap();

        let message = ChatMessage::from_event(&event).unwrap();
        assert_eq!(message.id, "srv-1");
        assert_eq!(message.client_temp_id, Some(TempId("tmp-abc".into())));
        assert!(MatchUpdate::from_event(&event).is_none());
    }

    #[test]
    fn test_missing_payload_decodes_optional_only_types() {
        let event = ServerEvent::from_parts(EventKind::Disconnected, Value::Null).unwrap();
        assert_eq!(event, ServerEvent::Disconnected(Disconnected::default()));
    }

    #[test]
    fn test_room_scoped_events_name_their_room() {
        let update = ServerEvent::from_parts(EventKind::MatchUpdate, json!({"matchId": "42"}))
            .unwrap();
        assert_eq!(update.room(), Some(RoomKey::match_room("42")));

        let typing = ServerEvent::from_parts(
            EventKind::TypingIndicator,
            json!({"roomId": "lobby", "userId": "u-1", "isTyping": true}),
        )
        .unwrap();
        assert_eq!(typing.room(), Some(RoomKey::chat("lobby")));

        let notice = ServerEvent::from_parts(EventKind::SystemMessage, json!({"message": "hi"}))
            .unwrap();
        assert_eq!(notice.room(), None);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let result = ServerEvent::from_parts(EventKind::MatchUpdate, json!({"scores": 3}));
        assert!(result.is_err());
    }
}
