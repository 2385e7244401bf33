//! Optimistic outbound chat messages

use crate::types::TempId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery status of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Confirmed => "confirmed",
            DeliveryStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A message the local user authored, shown before the server confirms it.
///
/// `id` starts out equal to the temporary id and is replaced by the
/// server-assigned id on confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub temp_id: TempId,
    pub room_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl OutboundMessage {
    /// New pending message under a fresh temporary id
    pub fn pending(room_id: impl Into<String>, content: impl Into<String>) -> Self {
        let temp_id = TempId::generate();
        Self {
            id: temp_id.0.clone(),
            temp_id,
            room_id: room_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            failure: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    /// Server id once confirmed
    pub fn server_id(&self) -> Option<&str> {
        match self.status {
            DeliveryStatus::Confirmed => Some(&self.id),
            _ => None,
        }
    }

    pub fn confirm(&mut self, server_id: impl Into<String>) {
        self.id = server_id.into();
        self.status = DeliveryStatus::Confirmed;
        self.failure = None;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.failure = Some(reason.into());
    }
}

/// Clean user-typed chat text and check its length.
///
/// Strips control characters, bidirectional overrides and zero-width
/// characters, trims surrounding whitespace, then requires between 1 and
/// `max_chars` characters.
pub fn sanitize_chat_content(content: &str, max_chars: usize) -> Result<String> {
    let cleaned: String = content
        .chars()
        .filter(|c| {
            let code = *c as u32;
            code >= 0x20 && !(0x202A..=0x202E).contains(&code) && !(0x200B..=0x200F).contains(&code)
        })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return Err(Error::InvalidMessage("message is empty".to_string()));
    }

    let len = cleaned.chars().count();
    if len > max_chars {
        return Err(Error::InvalidMessage(format!(
            "message is {} characters, limit is {}",
            len, max_chars
        )));
    }

    Ok(cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_message_uses_temp_id() {
        let message = OutboundMessage::pending("room1", "hello");
        assert_eq!(message.id, message.temp_id.as_str());
        assert!(message.is_pending());
        assert!(message.server_id().is_none());
    }

    #[test]
    fn test_confirm_replaces_id() {
        let mut message = OutboundMessage::pending("room1", "hello");
        let temp_id = message.temp_id.clone();
        message.confirm("srv-1");

        assert_eq!(message.id, "srv-1");
        assert_eq!(message.temp_id, temp_id);
        assert_eq!(message.server_id(), Some("srv-1"));
    }

    #[test]
    fn test_sanitize_strips_hidden_characters() {
        let dirty = "  he\u{200B}llo\u{202E} wor\u{0007}ld \n";
        assert_eq!(sanitize_chat_content(dirty, 1000).unwrap(), "hello world");
    }

    #[test]
    fn test_sanitize_rejects_empty_and_long() {
        assert!(sanitize_chat_content(" \u{200B}\t", 1000).is_err());
        assert!(sanitize_chat_content(&"a".repeat(11), 10).is_err());
        assert!(sanitize_chat_content(&"é".repeat(10), 10).is_ok());
    }
}
