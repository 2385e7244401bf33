//! WebSocket dialer built on tokio-tungstenite

use super::link::{Dialer, LinkHandle, LinkReporter};
use dojo_core::Credential;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue, StatusCode},
    Message,
};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Physical socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConfig {
    /// `ws://` or `wss://` endpoint of the realtime gateway
    pub url: String,
    /// Ping period. A link silent for two periods is considered dead.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 { 20_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Why a handshake did not produce a link
#[derive(Error, Debug)]
pub enum DialError {
    #[error("invalid websocket request: {0}")]
    InvalidRequest(String),

    #[error("server refused the credential ({0})")]
    Unauthorized(StatusCode),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Dials the realtime gateway with a bearer credential
#[derive(Debug, Clone)]
pub struct WsDialer {
    config: WsConfig,
}

impl WsDialer {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }
}

impl Dialer for WsDialer {
    /// Spawns the link task; must be called from within a Tokio runtime
    fn dial(&self, credential: &Credential, reporter: LinkReporter) -> LinkHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();

        tokio::spawn(run_link(
            self.config.clone(),
            credential.clone(),
            reporter,
            outbound_rx,
            close.clone(),
        ));

        LinkHandle::new(outbound_tx, close)
    }
}

async fn handshake(config: &WsConfig, credential: &Credential) -> Result<WsStream, DialError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| DialError::InvalidRequest(e.to_string()))?;
    let bearer = HeaderValue::from_str(&credential.bearer())
        .map_err(|e| DialError::InvalidRequest(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let result = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| DialError::Timeout(timeout))?;

    match result {
        Ok((stream, _response)) => Ok(stream),
        Err(tungstenite::Error::Http(response))
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            Err(DialError::Unauthorized(response.status()))
        }
        Err(e) => Err(DialError::Transport(e)),
    }
}

/// True once nothing has arrived for two heartbeat periods
fn is_silent(last_seen: Instant, period: Duration) -> bool {
    last_seen.elapsed() > period * 2
}

async fn run_link(
    config: WsConfig,
    credential: Credential,
    reporter: LinkReporter,
    mut outbound: mpsc::UnboundedReceiver<String>,
    close: CancellationToken,
) {
    let generation = reporter.generation();
    debug!("Connecting to websocket '{}' (generation {})", config.url, generation);

    let stream = tokio::select! {
        _ = close.cancelled() => {
            debug!("Dial {} cancelled before handshake", generation);
            return;
        }
        result = handshake(&config, &credential) => result,
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(DialError::Unauthorized(status)) => {
            error!("Unauthorized websocket connection ({})", status);
            reporter.rejected(format!("HTTP {}", status.as_u16()));
            return;
        }
        Err(e) => {
            warn!("Websocket handshake failed: {}", e);
            reporter.failed(e.to_string());
            return;
        }
    };

    info!("WebSocket handshake completed (generation {})", generation);
    reporter.opened();

    let (mut write, mut read) = stream.split();
    let period = Duration::from_millis(config.heartbeat_interval_ms.max(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            _ = close.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                debug!("Link {} closed locally", generation);
                return;
            }
            Some(text) = outbound.recv() => {
                trace!("Sending text frame ({} bytes)", text.len());
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    break format!("write failed: {}", e);
                }
            }
            message = read.next() => {
                last_seen = Instant::now();
                match message {
                    Some(Ok(Message::Text(text))) => reporter.frame(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        debug!("Ignoring {} byte binary frame", bytes.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read failed: {}", e),
                    None => break "stream ended".to_string(),
                }
            }
            _ = heartbeat.tick() => {
                if is_silent(last_seen, period) {
                    break "heartbeat timeout".to_string();
                }
                trace!("Sending ping to server");
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    break format!("ping failed: {}", e);
                }
            }
        }
    };

    info!("WebSocket connection closed: {}", reason);
    close.cancel();
    reporter.closed(reason);
}

#[cfg(test)]
mod tests {
    use super::super::{LinkEvent, TransportSignal};
    use super::*;

    #[test]
    fn test_ws_config_defaults() {
        let config: WsConfig = serde_json::from_str(r#"{"url":"wss://example.test/ws"}"#).unwrap();
        assert_eq!(config, WsConfig::new("wss://example.test/ws"));
        assert_eq!(config.heartbeat_interval_ms, 20_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_url_fails_without_rejecting() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer = WsDialer::new(WsConfig::new("not a url"));
        let _link = dialer.dial(&Credential::new("token"), LinkReporter::new(7, tx));

        let signal = rx.recv().await.unwrap();
        match signal {
            TransportSignal::Link { generation, event } => {
                assert_eq!(generation, 7);
                assert!(matches!(event, LinkEvent::Failed(_)));
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_closing_before_handshake_reports_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = WsConfig::new("ws://127.0.0.1:9/ws");
        config.connect_timeout_ms = 50;
        let dialer = WsDialer::new(config);

        let link = dialer.dial(&Credential::new("token"), LinkReporter::new(1, tx));
        link.close();
        assert!(link.is_closed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Either nothing, or a failure raced in before the close was observed
        if let Ok(signal) = rx.try_recv() {
            assert!(matches!(
                signal,
                TransportSignal::Link {
                    event: LinkEvent::Failed(_),
                    ..
                }
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_two_quiet_periods() {
        let period = Duration::from_millis(20);
        let last_seen = Instant::now();
        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(!is_silent(last_seen, period));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(is_silent(last_seen, period));
    }

    #[test_log::test(tokio::test)]
    async fn test_unanswered_pings_close_the_link() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            // Never polled again, so pings go unanswered
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(ws);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = WsConfig::new(url);
        config.heartbeat_interval_ms = 50;
        let _link = WsDialer::new(config).dial(&Credential::new("token"), LinkReporter::new(3, tx));

        let mut events = Vec::new();
        while events.len() < 2 {
            let signal = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let TransportSignal::Link { generation, event } = signal {
                assert_eq!(generation, 3);
                events.push(event);
            }
        }
        assert_eq!(
            events,
            vec![
                LinkEvent::Opened,
                LinkEvent::Closed("heartbeat timeout".to_string())
            ]
        );
        server.abort();
    }
}
