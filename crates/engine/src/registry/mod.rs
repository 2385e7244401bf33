//! Channel registry: reference-counted room membership
//!
//! Each live [`RoomTicket`] is one interested consumer. A room exists in the
//! registry exactly while at least one ticket for it is outstanding.

use dojo_core::RoomKey;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Opaque proof of one `join`; returned to the registry on `leave`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomTicket {
    key: RoomKey,
    id: u64,
}

impl RoomTicket {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }
}

/// Result of [`ChannelRegistry::leave`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Other consumers still hold the room
    Retained { remaining: usize },
    /// Last holder left; the entry is gone. A leave frame is owed only if
    /// the server currently considers us joined.
    Released { key: RoomKey, was_joined: bool },
    /// The ticket was already returned
    Stale,
}

#[derive(Debug, Default)]
struct RoomEntry {
    holders: BTreeSet<u64>,
    /// A join frame for this room reached the live link
    joined: bool,
}

/// Rooms keyed by `(kind, id)`, in deterministic order
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    rooms: BTreeMap<RoomKey, RoomEntry>,
    next_ticket: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`. The flag is true on the 0→1 transition,
    /// when a join frame is owed.
    pub fn join(&mut self, key: RoomKey) -> (RoomTicket, bool) {
        self.next_ticket += 1;
        let id = self.next_ticket;

        let entry = self.rooms.entry(key.clone()).or_default();
        let first = entry.holders.is_empty();
        entry.holders.insert(id);
        debug!("Join {} (holders: {})", key, entry.holders.len());

        (RoomTicket { key, id }, first)
    }

    /// Return a ticket. Idempotent per ticket.
    pub fn leave(&mut self, ticket: &RoomTicket) -> LeaveOutcome {
        let Some(entry) = self.rooms.get_mut(&ticket.key) else {
            return LeaveOutcome::Stale;
        };
        if !entry.holders.remove(&ticket.id) {
            return LeaveOutcome::Stale;
        }
        debug!("Leave {} (holders: {})", ticket.key, entry.holders.len());

        if !entry.holders.is_empty() {
            return LeaveOutcome::Retained {
                remaining: entry.holders.len(),
            };
        }

        let was_joined = entry.joined;
        self.rooms.remove(&ticket.key);
        LeaveOutcome::Released {
            key: ticket.key.clone(),
            was_joined,
        }
    }

    pub fn mark_joined(&mut self, key: &RoomKey) {
        if let Some(entry) = self.rooms.get_mut(key) {
            entry.joined = true;
        }
    }

    /// The link is gone; every room must be joined again
    pub fn mark_all_unjoined(&mut self) {
        for entry in self.rooms.values_mut() {
            entry.joined = false;
        }
    }

    /// Rooms with at least one holder
    pub fn active_rooms(&self) -> Vec<RoomKey> {
        self.rooms.keys().cloned().collect()
    }

    pub fn ref_count(&self, key: &RoomKey) -> usize {
        self.rooms.get(key).map_or(0, |entry| entry.holders.len())
    }

    pub fn is_joined(&self, key: &RoomKey) -> bool {
        self.rooms.get(key).is_some_and(|entry| entry.joined)
    }

    pub fn joined_count(&self) -> usize {
        self.rooms.values().filter(|entry| entry.joined).count()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
