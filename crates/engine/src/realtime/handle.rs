//! Room membership handle

use super::Shared;
use crate::registry::RoomTicket;
use dojo_core::RoomKey;
use std::sync::Weak;

/// One consumer's interest in a room.
///
/// Leaves the room when dropped or when [`RoomHandle::leave`] is called.
/// Leaving twice is impossible by construction.
#[must_use = "dropping a RoomHandle leaves the room immediately"]
pub struct RoomHandle {
    shared: Weak<Shared>,
    key: RoomKey,
    ticket: Option<RoomTicket>,
}

impl RoomHandle {
    pub(super) fn new(shared: Weak<Shared>, ticket: RoomTicket) -> Self {
        Self {
            shared,
            key: ticket.key().clone(),
            ticket: Some(ticket),
        }
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Release this consumer's interest now
    pub fn leave(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        if let Some(shared) = self.shared.upgrade() {
            shared.leave_room(&ticket);
        }
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle").field("room", &self.key).finish()
    }
}
