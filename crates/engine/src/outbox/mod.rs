//! Outbox: optimistic outbound chat messages and their reconciliation

mod recent;

pub use recent::RecentIds;

use chrono::Utc;
use dojo_core::{ChatMessage, DeliveryStatus, Error, OutboundMessage, Result, TempId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Max distance between local creation time and server timestamp for an
/// echo without a temporary id to match by content
const CONTENT_MATCH_WINDOW_SECS: i64 = 120;

/// What an inbound chat message meant for the outbox
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Echo of one of our sends; the entry is now confirmed
    Confirmed(OutboundMessage),
    /// Server id already delivered; drop it
    Duplicate,
    /// Someone else's message, or one we no longer track
    Foreign,
}

/// Locally authored messages in creation order
pub struct Outbox {
    entries: Vec<OutboundMessage>,
    /// Temporary ids replaced by a retry. Never matched again.
    retired: RecentIds,
    recent: RecentIds,
    own_user: Option<String>,
}

impl Outbox {
    pub fn new(dedupe_window: Duration, dedupe_capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            retired: RecentIds::with_capacity(dedupe_window, dedupe_capacity),
            recent: RecentIds::with_capacity(dedupe_window, dedupe_capacity),
            own_user: None,
        }
    }

    /// User id the server assigned to us, used to match echoes by content
    pub fn set_own_user(&mut self, user_id: Option<String>) {
        self.own_user = user_id;
    }

    /// Record a new pending message
    pub fn create(&mut self, room_id: &str, content: String) -> OutboundMessage {
        let message = OutboundMessage::pending(room_id, content);
        debug!("Outbox: pending {} in {}", message.temp_id, room_id);
        self.entries.push(message.clone());
        message
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|m| m.id == id || m.temp_id.as_str() == id)
    }

    /// Look up by current id or temporary id
    pub fn get(&self, id: &str) -> Option<&OutboundMessage> {
        self.position(id).map(|index| &self.entries[index])
    }

    fn find_echo(&self, message: &ChatMessage) -> Option<usize> {
        if let Some(temp_id) = &message.client_temp_id {
            // A failed entry is still ours; a late echo confirms it
            return self
                .entries
                .iter()
                .position(|m| &m.temp_id == temp_id && m.status != DeliveryStatus::Confirmed);
        }

        let own_user = self.own_user.as_deref()?;
        if message.sender_id != own_user {
            return None;
        }
        self.entries.iter().position(|m| {
            m.is_pending()
                && m.room_id == message.room_id
                && m.content == message.content
                && (message.timestamp - m.created_at).num_seconds().abs()
                    <= CONTENT_MATCH_WINDOW_SECS
        })
    }

    /// Classify an inbound chat message and confirm the matching entry
    pub fn reconcile(&mut self, message: &ChatMessage) -> Reconciled {
        if self.recent.contains(&message.id) {
            debug!("Outbox: duplicate delivery of {}", message.id);
            return Reconciled::Duplicate;
        }
        self.recent.insert(&message.id);

        if let Some(temp_id) = &message.client_temp_id {
            if self.retired.contains(temp_id.as_str()) {
                debug!("Outbox: echo for retired {}", temp_id);
                return Reconciled::Foreign;
            }
        }

        match self.find_echo(message) {
            Some(index) => {
                let entry = &mut self.entries[index];
                if entry.status == DeliveryStatus::Failed {
                    info!("Outbox: late acknowledgment for failed {}", entry.temp_id);
                }
                entry.confirm(message.id.clone());
                debug!("Outbox: {} confirmed as {}", entry.temp_id, entry.id);
                Reconciled::Confirmed(entry.clone())
            }
            None => Reconciled::Foreign,
        }
    }

    /// Mark a pending message failed. None if it is not pending.
    pub fn fail(&mut self, temp_id: &TempId, reason: &str) -> Option<OutboundMessage> {
        let entry = self
            .entries
            .iter_mut()
            .find(|m| &m.temp_id == temp_id && m.is_pending())?;
        warn!("Outbox: {} failed: {}", temp_id, reason);
        entry.fail(reason);
        Some(entry.clone())
    }

    /// Fail everything still pending
    pub fn fail_all_pending(&mut self, reason: &str) -> Vec<OutboundMessage> {
        let failed: Vec<OutboundMessage> = self
            .entries
            .iter_mut()
            .filter(|m| m.is_pending())
            .map(|m| {
                m.fail(reason);
                m.clone()
            })
            .collect();
        if !failed.is_empty() {
            warn!("Outbox: {} pending message(s) failed: {}", failed.len(), reason);
        }
        failed
    }

    /// Put a failed message back to pending under a fresh temporary id.
    ///
    /// Returns the retired temporary id and the updated entry.
    pub fn retry(&mut self, id: &str) -> Result<(TempId, OutboundMessage)> {
        let index = self
            .position(id)
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;
        let entry = &mut self.entries[index];
        if entry.status != DeliveryStatus::Failed {
            return Err(Error::NotRetryable {
                id: id.to_string(),
                status: entry.status.to_string(),
            });
        }

        let old = std::mem::replace(&mut entry.temp_id, TempId::generate());
        entry.id = entry.temp_id.0.clone();
        entry.status = DeliveryStatus::Pending;
        entry.failure = None;
        entry.created_at = Utc::now();
        info!("Outbox: retrying {} as {}", old, entry.temp_id);

        self.retired.insert(old.as_str());
        Ok((old, entry.clone()))
    }

    /// Drop an entry the UI has replaced with the authoritative record
    pub fn forget(&mut self, id: &str) -> Option<OutboundMessage> {
        self.position(id).map(|index| self.entries.remove(index))
    }

    /// Entries for one room, oldest first
    pub fn messages(&self, room_id: &str) -> Vec<OutboundMessage> {
        self.entries
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|m| m.is_pending()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> Outbox {
        Outbox::new(Duration::from_secs(600), 128)
    }

    fn echo(id: &str, pending: &OutboundMessage, with_temp_id: bool) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            room_id: pending.room_id.clone(),
            sender_id: "me".into(),
            content: pending.content.clone(),
            timestamp: Utc::now(),
            client_temp_id: with_temp_id.then(|| pending.temp_id.clone()),
        }
    }

    #[tokio::test]
    async fn test_echo_with_temp_id_confirms_once() {
        let mut outbox = outbox();
        let pending = outbox.create("room1", "hello".into());

        let result = outbox.reconcile(&echo("srv-1", &pending, true));
        let Reconciled::Confirmed(confirmed) = result else {
            panic!("expected confirmation, got {:?}", result);
        };
        assert_eq!(confirmed.id, "srv-1");
        assert_eq!(confirmed.status, DeliveryStatus::Confirmed);

        assert_eq!(
            outbox.reconcile(&echo("srv-1", &pending, true)),
            Reconciled::Duplicate
        );
        assert_eq!(outbox.messages("room1").len(), 1);
        assert_eq!(outbox.get("srv-1").unwrap().temp_id, pending.temp_id);
    }

    #[tokio::test]
    async fn test_echo_without_temp_id_matches_by_content() {
        let mut outbox = outbox();
        let first = outbox.create("room1", "gg".into());
        let second = outbox.create("room1", "gg".into());

        // Unknown own id: cannot claim it
        assert_eq!(
            outbox.reconcile(&echo("srv-1", &first, false)),
            Reconciled::Foreign
        );

        outbox.set_own_user(Some("me".into()));
        let result = outbox.reconcile(&echo("srv-2", &first, false));
        assert!(matches!(result, Reconciled::Confirmed(ref m) if m.temp_id == first.temp_id));
        let result = outbox.reconcile(&echo("srv-3", &second, false));
        assert!(matches!(result, Reconciled::Confirmed(ref m) if m.temp_id == second.temp_id));
    }

    #[tokio::test]
    async fn test_late_ack_confirms_failed_entry() {
        let mut outbox = outbox();
        let pending = outbox.create("room1", "hello".into());
        assert!(outbox.fail(&pending.temp_id, "timed out").is_some());
        assert!(outbox.fail(&pending.temp_id, "again").is_none());

        let result = outbox.reconcile(&echo("srv-9", &pending, true));
        assert!(matches!(result, Reconciled::Confirmed(ref m) if m.failure.is_none()));
    }

    #[tokio::test]
    async fn test_retry_uses_new_temp_id_and_retires_old() {
        let mut outbox = outbox();
        let pending = outbox.create("room1", "hello".into());

        assert!(matches!(
            outbox.retry(pending.temp_id.as_str()),
            Err(Error::NotRetryable { .. })
        ));
        outbox.fail(&pending.temp_id, "timed out");

        let (old, retried) = outbox.retry(pending.temp_id.as_str()).unwrap();
        assert_eq!(old, pending.temp_id);
        assert_ne!(retried.temp_id, pending.temp_id);
        assert!(retried.is_pending());
        assert_eq!(outbox.len(), 1);

        // Echo of the abandoned attempt is not ours anymore
        assert_eq!(
            outbox.reconcile(&echo("srv-old", &pending, true)),
            Reconciled::Foreign
        );
        assert!(outbox.get(retried.temp_id.as_str()).unwrap().is_pending());
        assert!(matches!(outbox.retry("nope"), Err(Error::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn test_retired_ids_are_bounded() {
        let mut outbox = Outbox::new(Duration::from_secs(600), 2);
        let pending = outbox.create("room1", "hello".into());
        let mut current = pending.temp_id.clone();
        for _ in 0..5 {
            outbox.fail(&current, "timed out");
            let (_, retried) = outbox.retry(current.as_str()).unwrap();
            current = retried.temp_id;
        }
        assert_eq!(outbox.retired.len(), 2);
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_and_forget() {
        let mut outbox = outbox();
        let a = outbox.create("room1", "a".into());
        outbox.create("room2", "b".into());
        outbox.reconcile(&echo("srv-a", &a, true));

        let failed = outbox.fail_all_pending("disconnected");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].room_id, "room2");
        assert_eq!(outbox.pending_count(), 0);

        assert!(outbox.forget("srv-a").is_some());
        assert!(outbox.forget("srv-a").is_none());
        assert!(outbox.messages("room1").is_empty());
    }
}
