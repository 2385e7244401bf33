//! Dojo Engine - Room registry, event routing, optimistic outbox, and the realtime facade

pub mod config;
pub mod outbox;
pub mod realtime;
pub mod registry;
pub mod router;

pub use config::RealtimeConfig;
pub use realtime::{Realtime, RealtimeStats, RoomHandle};
pub use router::Subscription;
