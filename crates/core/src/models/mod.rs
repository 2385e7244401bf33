//! Wire and domain models for the realtime layer

mod events;
mod frames;
mod message;
mod room;

pub use events::*;
pub use frames::*;
pub use message::*;
pub use room::*;
