//! Realtime layer settings

use dojo_networking::{ConnectionConfig, WsConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything the realtime facade needs to know, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the realtime gateway
    #[serde(default = "default_url")]
    pub url: String,
    /// Base URL of the REST API
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a sent chat message may stay pending
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// How long a delivered server message id is remembered for dedupe
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
}

fn default_url() -> String { "ws://localhost:8000/ws".to_string() }
fn default_api_url() -> String { "http://localhost:8000/api/v1".to_string() }
fn default_heartbeat_interval_ms() -> u64 { 20_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_ack_timeout_ms() -> u64 { 10_000 }
fn default_max_message_chars() -> usize { 1000 }
fn default_dedupe_window_secs() -> u64 { 600 }
fn default_dedupe_capacity() -> usize { 1024 }

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_url: default_api_url(),
            connection: ConnectionConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_message_chars: default_max_message_chars(),
            dedupe_window_secs: default_dedupe_window_secs(),
            dedupe_capacity: default_dedupe_capacity(),
        }
    }
}

impl RealtimeConfig {
    /// Socket settings for [`dojo_networking::WsDialer`]
    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            url: self.url.clone(),
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_secs)
    }
}
