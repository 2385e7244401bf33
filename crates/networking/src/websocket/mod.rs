//! Transport connection: the one physical link and its lifecycle
//!
//! [`TransportConnection`] is a synchronous state machine. It never blocks
//! and never returns transport errors to callers: dial attempts, link
//! events and the reconnect timer all arrive as [`TransportSignal`]s on a
//! single channel, and [`TransportConnection::handle`] turns each one into
//! state transitions plus a list of [`TransportOutcome`]s for the layer above.

mod backoff;
mod client;
mod link;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backoff::BackoffConfig;
pub use client::{DialError, WsConfig, WsDialer};
pub use link::{Dialer, LinkEvent, LinkHandle, LinkReporter, TransportSignal};

use chrono::{DateTime, Utc};
use dojo_core::{
    decode_server_frame, ClientFrame, ConnectionState, Credential, Delivery, ServerEvent,
    SessionId, TempId,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Tuning for the transport state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Operational frames held while offline before new ones are dropped
    #[serde(default = "default_max_queued_frames")]
    pub max_queued_frames: usize,
}

fn default_max_queued_frames() -> usize { 256 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_queued_frames: default_max_queued_frames(),
        }
    }
}

/// Result of [`TransportConnection::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live link writer
    Sent,
    /// Held until the link is back
    Queued,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not connected and the frame is not worth holding
    Offline,
    /// The offline queue is at capacity
    QueueFull,
    /// The frame could not be serialized
    Encode,
}

/// A scheduled reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// 1-based attempt number
    pub attempt: u32,
    pub delay: Duration,
}

/// What the layer above must react to after a signal
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    StateChanged(ConnectionState),
    /// The link is open; room joins should be replayed now
    Opened,
    Inbound(ServerEvent),
    /// The link dropped or the attempt failed. `retry` is None when the
    /// attempt budget is spent.
    Lost {
        reason: String,
        was_connected: bool,
        retry: Option<RetryPlan>,
    },
    /// The credential was refused; no retry is scheduled
    AuthRejected { reason: String },
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub session_id: Option<SessionId>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub queued_frames: usize,
}

/// Owner of the single physical connection
pub struct TransportConnection {
    dialer: Arc<dyn Dialer>,
    config: ConnectionConfig,
    signals: mpsc::UnboundedSender<TransportSignal>,
    state: ConnectionState,
    session: Option<SessionId>,
    credential: Option<Credential>,
    /// Bumped on every dial and every explicit disconnect
    generation: u64,
    link: Option<LinkHandle>,
    attempts: u32,
    retry_timer: Option<CancellationToken>,
    queue: VecDeque<ClientFrame>,
    last_error: Option<String>,
    last_frame_at: Option<DateTime<Utc>>,
}

impl TransportConnection {
    /// Create a disconnected transport. Link events and timers are reported
    /// on `signals`; feed them back through [`TransportConnection::handle`].
    pub fn new(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        Self {
            dialer,
            config,
            signals,
            state: ConnectionState::Disconnected,
            session: None,
            credential: None,
            generation: 0,
            link: None,
            attempts: 0,
            retry_timer: None,
            queue: VecDeque::new(),
            last_error: None,
            last_frame_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session id assigned by the server, only while connected
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state,
            session_id: self.session.clone(),
            reconnect_attempts: self.attempts,
            last_error: self.last_error.clone(),
            last_frame_at: self.last_frame_at,
            queued_frames: self.queue.len(),
        }
    }

    /// Start connecting with `credential`.
    ///
    /// No-op while connected or connecting, except that the credential is
    /// kept for the next reconnect. From any other state a fresh attempt
    /// starts immediately. Returns the state after the call.
    pub fn connect(&mut self, credential: Credential) -> ConnectionState {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!("connect() ignored, already {}", self.state);
                self.credential = Some(credential);
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::AuthFailed => {
                self.cancel_retry();
                self.credential = Some(credential);
                self.attempts = 0;
                self.state = ConnectionState::Connecting;
                self.dial();
            }
        }
        self.state
    }

    /// Tear down the link and stay disconnected until the next `connect`.
    ///
    /// Returns the operational frames that were still queued.
    pub fn disconnect(&mut self) -> Vec<ClientFrame> {
        self.cancel_retry();
        // Orphan whatever the old link still reports
        self.generation += 1;
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.session = None;
        self.attempts = 0;
        if self.state != ConnectionState::Disconnected {
            info!("Transport disconnected by request (was {})", self.state);
        }
        self.state = ConnectionState::Disconnected;
        self.queue.drain(..).collect()
    }

    /// Send a frame, or hold or drop it according to its [`Delivery`] class
    pub fn send(&mut self, frame: ClientFrame) -> SendOutcome {
        if self.state.is_connected() {
            if let Some(link) = &self.link {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {} frame: {}", frame.name(), e);
                        return SendOutcome::Dropped(DropReason::Encode);
                    }
                };
                if link.send(text) {
                    trace!("Sent {} frame", frame.name());
                    return SendOutcome::Sent;
                }
                warn!("Link writer is gone, holding {} frame", frame.name());
            }
        }
        self.hold(frame)
    }

    fn hold(&mut self, frame: ClientFrame) -> SendOutcome {
        match frame.delivery() {
            Delivery::DropWhenOffline => {
                debug!("Dropping {} frame while {}", frame.name(), self.state);
                SendOutcome::Dropped(DropReason::Offline)
            }
            Delivery::QueueWhenOffline => {
                if matches!(
                    self.state,
                    ConnectionState::Disconnected | ConnectionState::AuthFailed
                ) {
                    debug!("Dropping {} frame, nothing will flush it", frame.name());
                    return SendOutcome::Dropped(DropReason::Offline);
                }
                if self.queue.len() >= self.config.max_queued_frames {
                    warn!(
                        "Offline queue full ({} frames), dropping {} frame",
                        self.queue.len(),
                        frame.name()
                    );
                    return SendOutcome::Dropped(DropReason::QueueFull);
                }
                self.queue.push_back(frame);
                SendOutcome::Queued
            }
        }
    }

    /// Send everything queued while offline, oldest first. Returns how many
    /// frames reached the link.
    pub fn flush_queued(&mut self) -> usize {
        if self.queue.is_empty() {
            return 0;
        }
        let queued: Vec<ClientFrame> = self.queue.drain(..).collect();
        let total = queued.len();
        let sent = queued
            .into_iter()
            .filter(|frame| self.send(frame.clone()) == SendOutcome::Sent)
            .count();
        info!("Flushed {}/{} queued frames", sent, total);
        sent
    }

    /// Remove a queued chat frame so it is never flushed. True if one was removed.
    pub fn discard_queued(&mut self, temp_id: &TempId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|frame| frame.temp_id() != Some(temp_id));
        before != self.queue.len()
    }

    /// Apply one signal from a link or the reconnect timer
    pub fn handle(&mut self, signal: TransportSignal) -> Vec<TransportOutcome> {
        match signal {
            TransportSignal::RetryDue { generation } => {
                if generation != self.generation || self.state != ConnectionState::Reconnecting {
                    debug!("Ignoring stale reconnect timer (generation {})", generation);
                    return Vec::new();
                }
                self.retry_timer = None;
                info!("Reconnect attempt {}", self.attempts);
                self.dial();
                Vec::new()
            }
            TransportSignal::Link { generation, event } => {
                if generation != self.generation {
                    debug!("Ignoring {:?} from stale link {}", event, generation);
                    return Vec::new();
                }
                match event {
                    LinkEvent::Opened => self.on_opened(),
                    LinkEvent::Frame(text) => self.on_frame(&text),
                    LinkEvent::Closed(reason) | LinkEvent::Failed(reason) => self.on_lost(reason),
                    LinkEvent::Rejected(reason) => self.on_rejected(reason),
                }
            }
        }
    }

    fn dial(&mut self) {
        let Some(credential) = self.credential.clone() else {
            warn!("Cannot dial without a credential");
            return;
        };
        if let Some(old) = self.link.take() {
            old.close();
        }
        self.generation += 1;
        debug!("Dialing (generation {})", self.generation);
        let reporter = LinkReporter::new(self.generation, self.signals.clone());
        self.link = Some(self.dialer.dial(&credential, reporter));
    }

    fn on_opened(&mut self) -> Vec<TransportOutcome> {
        if !self.state.is_transient() {
            debug!("Ignoring open while {}", self.state);
            return Vec::new();
        }
        if self.state == ConnectionState::Reconnecting {
            info!("Transport reconnected after {} attempt(s)", self.attempts);
        } else {
            info!("Transport connected");
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.last_error = None;
        vec![
            TransportOutcome::StateChanged(ConnectionState::Connected),
            TransportOutcome::Opened,
        ]
    }

    fn on_frame(&mut self, text: &str) -> Vec<TransportOutcome> {
        self.last_frame_at = Some(Utc::now());
        match decode_server_frame(text) {
            Ok(event) => {
                if let ServerEvent::Connected(welcome) = &event {
                    debug!("Session established: {}", welcome.session_id);
                    self.session = Some(welcome.session_id.clone());
                }
                vec![TransportOutcome::Inbound(event)]
            }
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                Vec::new()
            }
        }
    }

    fn on_lost(&mut self, reason: String) -> Vec<TransportOutcome> {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.session = None;
        self.last_error = Some(reason.clone());

        let was_connected = self.state.is_connected();
        if !(was_connected || self.state.is_transient()) {
            return Vec::new();
        }

        if !self.config.backoff.allows(self.attempts) {
            warn!(
                "Giving up after {} reconnect attempts: {}",
                self.attempts, reason
            );
            self.state = ConnectionState::Disconnected;
            self.attempts = 0;
            self.queue.clear();
            return vec![
                TransportOutcome::StateChanged(ConnectionState::Disconnected),
                TransportOutcome::Lost {
                    reason,
                    was_connected,
                    retry: None,
                },
            ];
        }

        let delay = self.config.backoff.delay(self.attempts);
        self.attempts += 1;
        warn!(
            "Transport lost ({}), retry {} in {:?}",
            reason, self.attempts, delay
        );
        self.state = ConnectionState::Reconnecting;
        self.schedule_retry(delay);

        vec![
            TransportOutcome::StateChanged(ConnectionState::Reconnecting),
            TransportOutcome::Lost {
                reason,
                was_connected,
                retry: Some(RetryPlan {
                    attempt: self.attempts,
                    delay,
                }),
            },
        ]
    }

    fn on_rejected(&mut self, reason: String) -> Vec<TransportOutcome> {
        error!("Authentication rejected: {}", reason);
        self.cancel_retry();
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.session = None;
        // A fresh credential is required before the next attempt
        self.credential = None;
        self.attempts = 0;
        self.last_error = Some(reason.clone());
        self.queue.clear();
        self.state = ConnectionState::AuthFailed;
        vec![
            TransportOutcome::StateChanged(ConnectionState::AuthFailed),
            TransportOutcome::AuthRejected { reason },
        ]
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let generation = self.generation;
        let signals = self.signals.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = signals.send(TransportSignal::RetryDue { generation });
                }
            }
        });

        self.retry_timer = Some(token);
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.cancel_retry();
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedDialer;
    use super::*;
    use dojo_core::{Connected, RoomKey, SendChat};

    fn fixed_config() -> ConnectionConfig {
        ConnectionConfig {
            backoff: BackoffConfig::fixed(1000, 8000),
            max_queued_frames: 2,
        }
    }

    fn setup(
        config: ConnectionConfig,
    ) -> (
        TransportConnection,
        Arc<ScriptedDialer>,
        mpsc::UnboundedReceiver<TransportSignal>,
    ) {
        let dialer = ScriptedDialer::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = TransportConnection::new(config, dialer.clone(), tx);
        (connection, dialer, rx)
    }

    /// Feed every pending signal back into the connection
    fn pump(
        connection: &mut TransportConnection,
        rx: &mut mpsc::UnboundedReceiver<TransportSignal>,
    ) -> Vec<TransportOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            outcomes.extend(connection.handle(signal));
        }
        outcomes
    }

    fn chat(text: &str) -> ClientFrame {
        ClientFrame::SendChat(SendChat {
            room_id: "room1".into(),
            content: text.into(),
            client_temp_id: TempId::generate(),
        })
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_connect_is_noop_when_connecting() {
        let (mut connection, dialer, _rx) = setup(fixed_config());

        assert_eq!(
            connection.connect(Credential::new("t1")),
            ConnectionState::Connecting
        );
        assert_eq!(
            connection.connect(Credential::new("t2")),
            ConnectionState::Connecting
        );
        assert_eq!(dialer.dial_count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_open_connects_and_welcome_sets_session() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());
        connection.connect(Credential::new("token"));

        let link = dialer.last_link().unwrap();
        assert_eq!(link.credential().expose(), "token");
        link.open();
        link.push(Connected {
            session_id: SessionId::new("sess-1"),
            user_id: Some("u-1".into()),
        });

        let outcomes = pump(&mut connection, &mut rx);
        assert_eq!(outcomes[0], TransportOutcome::StateChanged(ConnectionState::Connected));
        assert_eq!(outcomes[1], TransportOutcome::Opened);
        assert!(matches!(outcomes[2], TransportOutcome::Inbound(ServerEvent::Connected(_))));
        assert_eq!(connection.session_id(), Some(&SessionId::new("sess-1")));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_unexpected_close_schedules_backoff_and_redials() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());
        connection.connect(Credential::new("token"));
        dialer.last_link().unwrap().open();
        pump(&mut connection, &mut rx);

        dialer.last_link().unwrap().drop_link("reset by peer");
        let outcomes = pump(&mut connection, &mut rx);
        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        assert!(connection.session_id().is_none());
        assert_eq!(
            outcomes[1],
            TransportOutcome::Lost {
                reason: "reset by peer".into(),
                was_connected: true,
                retry: Some(RetryPlan {
                    attempt: 1,
                    delay: Duration::from_millis(1000)
                }),
            }
        );

        tokio::time::sleep(Duration::from_millis(999)).await;
        pump(&mut connection, &mut rx);
        assert_eq!(dialer.dial_count(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        pump(&mut connection, &mut rx);
        assert_eq!(dialer.dial_count(), 2);

        // Second failure doubles the delay
        dialer.last_link().unwrap().fail("connection refused");
        let outcomes = pump(&mut connection, &mut rx);
        assert!(matches!(
            outcomes[1],
            TransportOutcome::Lost { retry: Some(RetryPlan { attempt: 2, delay }), .. }
                if delay == Duration::from_millis(2000)
        ));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_explicit_disconnect_never_reconnects() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());
        connection.connect(Credential::new("token"));
        let link = dialer.last_link().unwrap();
        link.open();
        pump(&mut connection, &mut rx);

        connection.disconnect();
        assert!(link.is_closed());

        // Late events from the torn-down link are ignored
        link.drop_link("closed");
        assert!(pump(&mut connection, &mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        pump(&mut connection, &mut rx);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_disconnect_cancels_pending_retry() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());
        connection.connect(Credential::new("token"));
        dialer.last_link().unwrap().fail("refused");
        pump(&mut connection, &mut rx);
        assert_eq!(connection.state(), ConnectionState::Reconnecting);

        connection.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;
        pump(&mut connection, &mut rx);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_rejected_credential_is_fatal() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());
        connection.connect(Credential::new("expired"));
        dialer.last_link().unwrap().reject("HTTP 401");

        let outcomes = pump(&mut connection, &mut rx);
        assert_eq!(connection.state(), ConnectionState::AuthFailed);
        assert!(matches!(outcomes[1], TransportOutcome::AuthRejected { .. }));

        tokio::time::sleep(Duration::from_secs(60)).await;
        pump(&mut connection, &mut rx);
        assert_eq!(dialer.dial_count(), 1);

        // A fresh credential starts over
        connection.connect(Credential::new("fresh"));
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(dialer.last_link().unwrap().credential().expose(), "fresh");
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_gives_up_after_attempt_budget() {
        let mut config = fixed_config();
        config.backoff.max_attempts = Some(1);
        let (mut connection, dialer, mut rx) = setup(config);
        connection.connect(Credential::new("token"));

        dialer.last_link().unwrap().fail("refused");
        pump(&mut connection, &mut rx);
        assert_eq!(connection.state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        pump(&mut connection, &mut rx);
        dialer.last_link().unwrap().fail("refused again");
        let outcomes = pump(&mut connection, &mut rx);

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(outcomes[1], TransportOutcome::Lost { retry: None, .. }));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_offline_delivery_classes() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());

        // Disconnected: nothing will flush, chat is dropped too
        assert_eq!(
            connection.send(chat("early")),
            SendOutcome::Dropped(DropReason::Offline)
        );

        connection.connect(Credential::new("token"));
        assert_eq!(
            connection.send(ClientFrame::JoinRoom(RoomKey::chat("room1"))),
            SendOutcome::Dropped(DropReason::Offline)
        );
        assert_eq!(connection.send(chat("one")), SendOutcome::Queued);
        assert_eq!(connection.send(chat("two")), SendOutcome::Queued);
        assert_eq!(
            connection.send(chat("three")),
            SendOutcome::Dropped(DropReason::QueueFull)
        );

        let link = dialer.last_link().unwrap();
        link.open();
        pump(&mut connection, &mut rx);
        assert_eq!(connection.flush_queued(), 2);

        let sent = link.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], ClientFrame::SendChat(c) if c.content == "one"));
        assert!(matches!(&sent[1], ClientFrame::SendChat(c) if c.content == "two"));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_discard_queued_removes_only_that_message() {
        let (mut connection, _dialer, _rx) = setup(fixed_config());
        connection.connect(Credential::new("token"));

        let keep = chat("keep");
        let discard = chat("discard");
        let discard_id = discard.temp_id().cloned().unwrap();
        connection.send(keep);
        connection.send(discard);

        assert!(connection.discard_queued(&discard_id));
        assert!(!connection.discard_queued(&discard_id));
        assert_eq!(connection.queued_len(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_malformed_frame_is_dropped_without_disconnect() {
        let (mut connection, dialer, mut rx) = setup(fixed_config());
        connection.connect(Credential::new("token"));
        let link = dialer.last_link().unwrap();
        link.open();
        pump(&mut connection, &mut rx);

        link.push_raw("{not json");
        link.push_raw(r#"{"type":"chat_message","payload":{"id":1}}"#);
        assert!(pump(&mut connection, &mut rx).is_empty());
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(connection.stats().last_frame_at.is_some());
    }
}
