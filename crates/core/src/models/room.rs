//! Room keys: the logical scopes multiplexed over one connection

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of logical room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Tournament,
    Match,
    Chat,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Tournament => "tournament",
            RoomKind::Match => "match",
            RoomKind::Chat => "chat",
        }
    }
}

impl FromStr for RoomKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tournament" => Ok(RoomKind::Tournament),
            "match" => Ok(RoomKind::Match),
            "chat" => Ok(RoomKind::Chat),
            other => Err(Error::InvalidRoom(format!("unknown room kind '{}'", other))),
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite room identity `(kind, id)`.
///
/// Serializes as `{"kind": "chat", "id": "room1"}`, the shape of the
/// `join_room`/`leave_room` payloads. Displays as `chat:room1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    pub kind: RoomKind,
    pub id: String,
}

impl RoomKey {
    pub fn new(kind: RoomKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn chat(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Chat, id)
    }

    pub fn match_room(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Match, id)
    }

    pub fn tournament(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Tournament, id)
    }
}

impl FromStr for RoomKey {
    type Err = Error;

    /// Parse `kind:id`, e.g. `match:42`
    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidRoom(format!("expected kind:id, got '{}'", s)))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::InvalidRoom(format!("empty room id in '{}'", s)));
        }
        Ok(RoomKey::new(kind.trim().parse()?, id))
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
