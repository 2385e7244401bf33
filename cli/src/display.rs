//! Terminal rendering of events, outbox entries and state changes

use chrono::{DateTime, Local, Utc};
use dojo_core::{
    ChatMessage, ConnectionState, DeliveryStatus, EventKind, OutboundMessage, ServerEvent,
};
use dojo_engine::{Realtime, RealtimeStats, Subscription};

fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

pub fn format_chat(message: &ChatMessage) -> String {
    format!(
        "[{}] #{} <{}> {}",
        clock(message.timestamp),
        message.room_id,
        message.sender_id,
        message.content
    )
}

pub fn format_event(event: &ServerEvent) -> String {
    match event {
        ServerEvent::ChatMessage(message) => format_chat(message),
        ServerEvent::TypingIndicator(typing) => {
            let verb = if typing.is_typing { "is typing" } else { "stopped typing" };
            format!("#{} {} {}", typing.room_id, typing.user_id, verb)
        }
        ServerEvent::MatchUpdate(update) => {
            let status = update.status.as_deref().unwrap_or("updated");
            match update.scores {
                Some(scores) => format!(
                    "match {} {} ({} - {})",
                    update.match_id, status, scores.player1, scores.player2
                ),
                None => format!("match {} {}", update.match_id, status),
            }
        }
        ServerEvent::TournamentUpdate(update) => {
            let status = update.status.as_deref().unwrap_or("updated");
            match update.round {
                Some(round) => format!(
                    "tournament {} {} (round {})",
                    update.tournament_id, status, round
                ),
                None => format!("tournament {} {}", update.tournament_id, status),
            }
        }
        ServerEvent::Notification(note) => match &note.category {
            Some(category) => format!("[{}] {}", category, note.message),
            None => format!("[notice] {}", note.message),
        },
        ServerEvent::SystemMessage(system) => format!(
            "*** {}{}",
            system
                .level
                .as_deref()
                .map(|level| format!("{}: ", level))
                .unwrap_or_default(),
            system.message
        ),
        ServerEvent::Connected(welcome) => format!("session {}", welcome.session_id),
        ServerEvent::Disconnected(gone) => format!(
            "disconnected ({})",
            gone.reason.as_deref().unwrap_or("no reason given")
        ),
        ServerEvent::Reconnecting(retry) => format!(
            "reconnecting, attempt {} in {} ms",
            retry.attempt, retry.delay_ms
        ),
        ServerEvent::Error(error) => format!("error {}: {}", error.code, error.message),
    }
}

pub fn format_outbound(message: &OutboundMessage) -> String {
    let marker = match message.status {
        DeliveryStatus::Pending => "…",
        DeliveryStatus::Confirmed => "✓",
        DeliveryStatus::Failed => "✗",
    };
    let mut line = format!(
        "[{}] #{} <me> {} {} ({})",
        clock(message.created_at),
        message.room_id,
        message.content,
        marker,
        message.id
    );
    if let Some(reason) = &message.failure {
        line.push_str(&format!(" - {}; /retry {}", reason, message.id));
    }
    line
}

pub fn format_state(state: ConnectionState) -> String {
    format!("-- {} --", state)
}

pub fn format_stats(stats: &RealtimeStats) -> String {
    serde_json::to_string_pretty(stats).unwrap_or_else(|e| format!("stats unavailable: {}", e))
}

/// Drop a confirmed entry from the outbox once it has been printed; the
/// terminal keeps no message list of its own. True if something was released.
pub fn release_confirmed(realtime: &Realtime, message: &OutboundMessage) -> bool {
    message.status == DeliveryStatus::Confirmed && realtime.forget_message(&message.id)
}

/// Print everything the facade reports. Keep the returned subscriptions
/// alive for as long as output is wanted.
pub fn attach(realtime: &Realtime) -> Vec<Subscription> {
    let mut subs: Vec<Subscription> = EventKind::ALL
        .into_iter()
        .filter(|kind| !matches!(kind, EventKind::Connected))
        .map(|kind| realtime.subscribe_kind(kind, |event| println!("{}", format_event(event))))
        .collect();

    subs.push(realtime.subscribe_state(|state| println!("{}", format_state(state))));
    let outbox = realtime.clone();
    subs.push(realtime.subscribe_outbox(move |message| {
        println!("{}", format_outbound(message));
        release_confirmed(&outbox, message);
    }));
    subs
}
