//! Dojo Networking - transport connection, WebSocket dialer, and REST client

pub mod http;
pub mod websocket;

pub use http::RestClient;
pub use websocket::{
    BackoffConfig, ConnectionConfig, ConnectionStats, Dialer, SendOutcome, TransportConnection,
    TransportOutcome, TransportSignal, WsConfig, WsDialer,
};
