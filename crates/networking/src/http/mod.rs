//! HTTP collaborator for authoritative snapshots

mod client;

pub use client::RestClient;
