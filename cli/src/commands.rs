//! Stdin command parsing and execution

use crate::display;
use anyhow::{bail, Context, Result};
use dojo_core::{RoomKey, RoomKind, ServerEvent};
use dojo_engine::{Realtime, RoomHandle};
use dojo_networking::RestClient;
use std::sync::Arc;
use tracing::warn;

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: a chat message for the current room
    Say(String),
    Join(RoomKey),
    Leave(RoomKey),
    Typing(bool),
    Retry(String),
    History,
    Refresh,
    Stats,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>               send to the current chat room
  /join kind:id        join a room (tournament, match, chat)
  /leave kind:id       leave a room
  /typing on|off       typing indicator for the current chat room
  /retry <id>          re-send a failed message
  /history             fetch recent messages of the current chat room
  /refresh             re-fetch every held room from the API
  /stats               connection diagnostics
  /quit";

/// Parse a line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "join" => Command::Join(arg.parse().context("usage: /join kind:id")?),
        "leave" => Command::Leave(arg.parse().context("usage: /leave kind:id")?),
        "typing" => match arg {
            "on" => Command::Typing(true),
            "off" => Command::Typing(false),
            _ => bail!("usage: /typing on|off"),
        },
        "retry" if !arg.is_empty() => Command::Retry(arg.to_string()),
        "retry" => bail!("usage: /retry <id>"),
        "history" => Command::History,
        "refresh" => Command::Refresh,
        "stats" => Command::Stats,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{} (try /help)", other),
    };
    Ok(Some(command))
}

/// Rooms this terminal holds and the chat room plain text goes to
pub struct Session {
    realtime: Realtime,
    rest: Arc<RestClient>,
    rooms: Vec<RoomHandle>,
    current_chat: Option<RoomKey>,
}

impl Session {
    pub fn new(realtime: Realtime, rest: Arc<RestClient>) -> Self {
        Self {
            realtime,
            rest,
            rooms: Vec::new(),
            current_chat: None,
        }
    }

    pub fn join(&mut self, key: RoomKey) {
        if self.rooms.iter().any(|handle| handle.key() == &key) {
            println!("already in {}", key);
            return;
        }
        if key.kind == RoomKind::Chat {
            self.current_chat = Some(key.clone());
        }
        println!("joined {}", key);
        self.rooms.push(self.realtime.join_room(key));
    }

    pub fn leave(&mut self, key: &RoomKey) {
        let Some(index) = self.rooms.iter().position(|handle| handle.key() == key) else {
            println!("not in {}", key);
            return;
        };
        self.rooms.remove(index).leave();
        if self.current_chat.as_ref() == Some(key) {
            self.current_chat = self
                .rooms
                .iter()
                .rev()
                .map(RoomHandle::key)
                .find(|k| k.kind == RoomKind::Chat)
                .cloned();
        }
        println!("left {}", key);
    }

    fn chat_room(&self) -> Result<&RoomKey> {
        self.current_chat
            .as_ref()
            .context("join a chat room first: /join chat:<id>")
    }

    /// Run one command. Returns false when the session should end.
    pub async fn execute(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Say(text) => {
                let room = self.chat_room()?.id.clone();
                self.realtime.send_chat(&room, &text)?;
            }
            Command::Join(key) => self.join(key),
            Command::Leave(key) => self.leave(&key),
            Command::Typing(on) => {
                let room = self.chat_room()?.id.clone();
                if !self.realtime.set_typing(&room, on) {
                    println!("typing indicator dropped (offline)");
                }
            }
            Command::Retry(id) => {
                self.realtime.retry_message(&id)?;
            }
            Command::History => {
                let room = self.chat_room()?.clone();
                print_history(&self.rest, &room).await?;
            }
            Command::Refresh => refresh_rooms(&self.realtime, &self.rest).await,
            Command::Stats => println!("{}", display::format_stats(&self.realtime.stats())),
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

/// Fetch and print the authoritative history of a chat room
pub async fn print_history(rest: &RestClient, room: &RoomKey) -> Result<()> {
    let messages = rest
        .fetch_chat_history(room)
        .await
        .with_context(|| format!("fetching history of {}", room))?;
    println!("-- history of {} ({} messages) --", room, messages.len());
    for message in &messages {
        println!("{}", display::format_chat(message));
    }
    Ok(())
}

/// Fetch and print the authoritative state of one held room
pub async fn print_snapshot(rest: &RestClient, room: &RoomKey) -> Result<()> {
    let event = match room.kind {
        RoomKind::Chat => return print_history(rest, room).await,
        RoomKind::Match => ServerEvent::MatchUpdate(rest.fetch_match(&room.id).await?),
        RoomKind::Tournament => {
            ServerEvent::TournamentUpdate(rest.fetch_tournament(&room.id).await?)
        }
    };
    println!("{}", display::format_event(&event));
    Ok(())
}

/// Re-fetch every held room, used after a reconnect
pub async fn refresh_rooms(realtime: &Realtime, rest: &RestClient) {
    for room in realtime.active_rooms() {
        if let Err(e) = print_snapshot(rest, &room).await {
            warn!("Refresh of {} failed: {:#}", room, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse("  good game  ").unwrap(),
            Some(Command::Say("good game".into()))
        );
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse("/join match:42").unwrap(),
            Some(Command::Join(RoomKey::match_room("42")))
        );
        assert_eq!(
            parse("/leave chat:lobby").unwrap(),
            Some(Command::Leave(RoomKey::chat("lobby")))
        );
        assert_eq!(parse("/typing on").unwrap(), Some(Command::Typing(true)));
        assert_eq!(
            parse("/retry tmp-1").unwrap(),
            Some(Command::Retry("tmp-1".into()))
        );
        assert_eq!(parse("/refresh").unwrap(), Some(Command::Refresh));
        assert_eq!(parse("/quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse("/join lobby").is_err());
        assert!(parse("/typing maybe").is_err());
        assert!(parse("/retry").is_err());
        assert!(parse("/dance").is_err());
    }
}
