//! Dojo Core - Wire model, shared types, and errors for the realtime layer

pub mod errors;
pub mod models;
pub mod types;

pub use errors::{Error, Result};
pub use models::*;
pub use types::*;
