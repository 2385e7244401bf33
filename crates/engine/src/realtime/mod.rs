//! Realtime facade: the one object every feature consumer talks to
//!
//! [`Realtime`] owns the single [`TransportConnection`] together with the
//! channel registry, the outbox and the routers. All transport signals and
//! acknowledgment timeouts are applied by one driver task. Every operation
//! mutates state under a short lock, collects the notifications it caused,
//! and delivers them after the lock is released, so listeners may call back
//! into the facade.

mod handle;

pub use handle::RoomHandle;

use crate::config::RealtimeConfig;
use crate::outbox::{Outbox, Reconciled};
use crate::registry::{ChannelRegistry, LeaveOutcome, RoomTicket};
use crate::router::{EventRouter, ListenerSet, Subscription};
use dojo_core::{
    sanitize_chat_content, ClientFrame, ConnectionState, Credential, Disconnected, EventKind,
    EventPayload, OutboundMessage, Reconnecting, Result, RoomKey, SendChat, ServerEvent,
    SessionId, TempId, Typing,
};
use dojo_networking::websocket::DropReason;
use dojo_networking::{
    ConnectionStats, Dialer, SendOutcome, TransportConnection, TransportOutcome, TransportSignal,
    WsDialer,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aggregate diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub connection: ConnectionStats,
    pub active_rooms: usize,
    pub joined_rooms: usize,
    pub pending_messages: usize,
}

/// Something to tell listeners once the lock is released
enum Notice {
    /// Fires state listeners with the state current at delivery time
    State,
    Event(ServerEvent),
    Outbox(OutboundMessage),
}

struct Core {
    transport: TransportConnection,
    registry: ChannelRegistry,
    outbox: Outbox,
    ack_timers: HashMap<TempId, CancellationToken>,
}

impl Core {
    fn cancel_ack(&mut self, temp_id: &TempId) {
        if let Some(timer) = self.ack_timers.remove(temp_id) {
            timer.cancel();
        }
    }

    fn cancel_all_acks(&mut self) {
        for (_, timer) in self.ack_timers.drain() {
            timer.cancel();
        }
    }

    fn fail_all_pending(&mut self, reason: &str, notices: &mut Vec<Notice>) {
        self.cancel_all_acks();
        for message in self.outbox.fail_all_pending(reason) {
            self.transport.discard_queued(&message.temp_id);
            notices.push(Notice::Outbox(message));
        }
    }

    /// False for room events whose room no consumer holds anymore
    fn in_scope(&self, event: &ServerEvent) -> bool {
        event
            .room()
            .map_or(true, |key| self.registry.ref_count(&key) > 0)
    }

    fn fail_message(&mut self, temp_id: &TempId, reason: &str, notices: &mut Vec<Notice>) {
        self.cancel_ack(temp_id);
        self.transport.discard_queued(temp_id);
        if let Some(message) = self.outbox.fail(temp_id, reason) {
            notices.push(Notice::Outbox(message));
        }
    }
}

pub(crate) struct Shared {
    core: Mutex<Core>,
    router: EventRouter,
    state_listeners: ListenerSet<ConnectionState>,
    outbox_listeners: ListenerSet<OutboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
    ack_tx: mpsc::UnboundedSender<TempId>,
    config: RealtimeConfig,
    shutdown: CancellationToken,
}

/// Shared realtime connection. Cheap to clone; all clones drive the same
/// physical link.
#[derive(Clone)]
pub struct Realtime {
    shared: Arc<Shared>,
}

impl Realtime {
    /// Facade over a real WebSocket connection to `config.url`.
    /// Must be called within a Tokio runtime.
    pub fn new(config: RealtimeConfig) -> Self {
        let dialer = Arc::new(WsDialer::new(config.ws_config()));
        Self::with_dialer(config, dialer)
    }

    /// Facade over any [`Dialer`]. Must be called within a Tokio runtime.
    pub fn with_dialer(config: RealtimeConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();

        let core = Core {
            transport: TransportConnection::new(config.connection.clone(), dialer, signal_tx),
            registry: ChannelRegistry::new(),
            outbox: Outbox::new(config.dedupe_window(), config.dedupe_capacity),
            ack_timers: HashMap::new(),
        };

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            router: EventRouter::new(),
            state_listeners: ListenerSet::new("connection_state"),
            outbox_listeners: ListenerSet::new("outbox"),
            state_tx,
            ack_tx,
            config,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(drive(Arc::downgrade(&shared), signal_rx, ack_rx, shutdown));

        Self { shared }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    // ─── Connection ──────────────────────────────────────────────────

    /// Start connecting. No-op while connected or connecting; state
    /// listeners are notified either way.
    pub fn connect(&self, credential: Credential) -> ConnectionState {
        let state = self.shared.lock().transport.connect(credential);
        self.shared.deliver(vec![Notice::State]);
        state
    }

    /// Tear the link down and stay disconnected. Pending messages fail;
    /// joined rooms are kept and replayed on the next `connect`.
    pub fn disconnect(&self) {
        let notices = self.shared.disconnect("client disconnect");
        self.shared.deliver(notices);
    }

    /// Disconnect and stop the driver task
    pub fn shutdown(&self) {
        self.disconnect();
        self.shared.shutdown.cancel();
        info!("Realtime shut down");
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Server-assigned session id while connected
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().transport.session_id().cloned()
    }

    pub fn stats(&self) -> RealtimeStats {
        let core = self.shared.lock();
        RealtimeStats {
            connection: core.transport.stats(),
            active_rooms: core.registry.len(),
            joined_rooms: core.registry.joined_count(),
            pending_messages: core.outbox.pending_count(),
        }
    }

    /// Called with the current state on every transition and on every
    /// `connect`/`disconnect` call, including guarded no-ops
    pub fn subscribe_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared
            .state_listeners
            .add(move |state: &ConnectionState| callback(*state))
    }

    /// Async view of the connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    // ─── Events ──────────────────────────────────────────────────────

    /// Typed subscription, e.g. `realtime.subscribe(|m: &MatchUpdate| ...)`
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: EventPayload,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.shared.router.subscribe(callback)
    }

    pub fn subscribe_kind<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.router.subscribe_kind(kind, callback)
    }

    // ─── Rooms ───────────────────────────────────────────────────────

    /// Register interest in a room. The first holder triggers a join frame
    /// (now if connected, otherwise on the next open).
    pub fn join_room(&self, key: RoomKey) -> RoomHandle {
        let ticket = {
            let mut core = self.shared.lock();
            let (ticket, first) = core.registry.join(key.clone());
            if first
                && core.transport.state().is_connected()
                && core.transport.send(ClientFrame::JoinRoom(key.clone())) == SendOutcome::Sent
            {
                core.registry.mark_joined(&key);
            }
            ticket
        };
        RoomHandle::new(Arc::downgrade(&self.shared), ticket)
    }

    pub fn room_ref_count(&self, key: &RoomKey) -> usize {
        self.shared.lock().registry.ref_count(key)
    }

    pub fn active_rooms(&self) -> Vec<RoomKey> {
        self.shared.lock().registry.active_rooms()
    }

    // ─── Chat ────────────────────────────────────────────────────────

    /// Send a chat message optimistically.
    ///
    /// Invalid content is rejected before anything is created. Otherwise a
    /// pending entry is announced to outbox listeners right away and later
    /// confirmed by the server echo, or failed by an error frame, the
    /// acknowledgment timeout, or an offline drop.
    pub fn send_chat(&self, room_id: &str, content: &str) -> Result<OutboundMessage> {
        let content = sanitize_chat_content(content, self.shared.config.max_message_chars)?;

        let mut notices = Vec::new();
        let message = {
            let mut core = self.shared.lock();
            let message = core.outbox.create(room_id, content);
            notices.push(Notice::Outbox(message.clone()));
            self.shared.transmit(&mut core, &message, &mut notices);
            core.outbox.get(message.temp_id.as_str()).cloned().unwrap_or(message)
        };
        self.shared.deliver(notices);
        Ok(message)
    }

    /// Re-send a failed message under a new temporary id
    pub fn retry_message(&self, id: &str) -> Result<OutboundMessage> {
        let mut notices = Vec::new();
        let message = {
            let mut core = self.shared.lock();
            let (old, message) = core.outbox.retry(id)?;
            core.cancel_ack(&old);
            core.transport.discard_queued(&old);
            notices.push(Notice::Outbox(message.clone()));
            self.shared.transmit(&mut core, &message, &mut notices);
            core.outbox.get(message.temp_id.as_str()).cloned().unwrap_or(message)
        };
        self.shared.deliver(notices);
        Ok(message)
    }

    /// Best-effort typing indicator. True if it reached the link.
    pub fn set_typing(&self, room_id: &str, is_typing: bool) -> bool {
        let frame = ClientFrame::Typing(Typing {
            room_id: room_id.to_string(),
            is_typing,
        });
        self.shared.lock().transport.send(frame) == SendOutcome::Sent
    }

    /// Outbound entries for one room, oldest first
    pub fn outbound_messages(&self, room_id: &str) -> Vec<OutboundMessage> {
        self.shared.lock().outbox.messages(room_id)
    }

    pub fn outbound_message(&self, id: &str) -> Option<OutboundMessage> {
        self.shared.lock().outbox.get(id).cloned()
    }

    /// Release an entry once the UI holds the authoritative record
    pub fn forget_message(&self, id: &str) -> bool {
        let mut core = self.shared.lock();
        match core.outbox.forget(id) {
            Some(message) => {
                core.cancel_ack(&message.temp_id);
                core.transport.discard_queued(&message.temp_id);
                true
            }
            None => false,
        }
    }

    /// Called on every outbox change: creation, confirmation, failure, retry
    pub fn subscribe_outbox<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OutboundMessage) + Send + Sync + 'static,
    {
        self.shared.outbox_listeners.add(callback)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.lock().transport.state()
    }

    fn deliver(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::State => {
                    let state = self.state();
                    self.state_tx.send_replace(state);
                    self.state_listeners.dispatch(&state);
                }
                Notice::Event(event) => {
                    // The room may have been left since the notice was queued
                    if !self.lock().in_scope(&event) {
                        debug!("Dropped {} for a room no longer held", event.kind());
                        continue;
                    }
                    self.router.dispatch(&event);
                }
                Notice::Outbox(message) => {
                    self.outbox_listeners.dispatch(&message);
                }
            }
        }
    }

    fn disconnect(&self, reason: &str) -> Vec<Notice> {
        let mut notices = vec![Notice::State];
        let mut core = self.lock();
        let was = core.transport.state();
        core.transport.disconnect();
        core.registry.mark_all_unjoined();
        core.fail_all_pending("disconnected", &mut notices);
        if was != ConnectionState::Disconnected {
            notices.push(Notice::Event(ServerEvent::Disconnected(Disconnected {
                reason: Some(reason.to_string()),
            })));
        }
        notices
    }

    fn leave_room(&self, ticket: &RoomTicket) {
        let mut core = self.lock();
        match core.registry.leave(ticket) {
            LeaveOutcome::Released { key, was_joined } => {
                if was_joined {
                    core.transport.send(ClientFrame::LeaveRoom(key));
                }
            }
            LeaveOutcome::Retained { remaining } => {
                debug!("{} still held by {} consumer(s)", ticket.key(), remaining);
            }
            LeaveOutcome::Stale => {}
        }
    }

    /// Hand a pending message to the transport and arm its timeout
    fn transmit(&self, core: &mut Core, message: &OutboundMessage, notices: &mut Vec<Notice>) {
        let frame = ClientFrame::SendChat(SendChat {
            room_id: message.room_id.clone(),
            content: message.content.clone(),
            client_temp_id: message.temp_id.clone(),
        });

        match core.transport.send(frame) {
            SendOutcome::Sent | SendOutcome::Queued => self.arm_ack_timer(core, &message.temp_id),
            SendOutcome::Dropped(reason) => {
                let reason = match reason {
                    DropReason::Offline => "not connected",
                    DropReason::QueueFull => "offline queue full",
                    DropReason::Encode => "could not encode message",
                };
                core.fail_message(&message.temp_id, reason, notices);
            }
        }
    }

    fn arm_ack_timer(&self, core: &mut Core, temp_id: &TempId) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shutdown = self.shutdown.clone();
        let ack_tx = self.ack_tx.clone();
        let timeout = self.config.ack_timeout();
        let temp_id_owned = temp_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = ack_tx.send(temp_id_owned);
                }
            }
        });

        if let Some(previous) = core.ack_timers.insert(temp_id.clone(), token) {
            previous.cancel();
        }
    }

    fn on_ack_timeout(&self, temp_id: TempId) {
        let mut notices = Vec::new();
        {
            let mut core = self.lock();
            if core.ack_timers.remove(&temp_id).is_none() {
                return;
            }
            core.transport.discard_queued(&temp_id);
            if let Some(message) = core
                .outbox
                .fail(&temp_id, "timed out waiting for acknowledgment")
            {
                notices.push(Notice::Outbox(message));
            }
        }
        self.deliver(notices);
    }

    fn on_signal(&self, signal: TransportSignal) {
        let mut notices = Vec::new();
        {
            let mut core = self.lock();
            for outcome in core.transport.handle(signal) {
                self.apply(&mut core, outcome, &mut notices);
            }
        }
        self.deliver(notices);
    }

    fn apply(&self, core: &mut Core, outcome: TransportOutcome, notices: &mut Vec<Notice>) {
        match outcome {
            TransportOutcome::StateChanged(_) => notices.push(Notice::State),
            TransportOutcome::Opened => {
                let rooms = core.registry.active_rooms();
                let mut replayed = 0;
                for key in rooms {
                    if core.transport.send(ClientFrame::JoinRoom(key.clone())) == SendOutcome::Sent {
                        core.registry.mark_joined(&key);
                        replayed += 1;
                    }
                }
                if replayed > 0 {
                    info!("Replayed {} room join(s)", replayed);
                }
                core.transport.flush_queued();
            }
            TransportOutcome::Inbound(event) => self.route_inbound(core, event, notices),
            TransportOutcome::Lost {
                reason,
                was_connected,
                retry,
            } => {
                core.registry.mark_all_unjoined();
                if was_connected {
                    notices.push(Notice::Event(ServerEvent::Disconnected(Disconnected {
                        reason: Some(reason.clone()),
                    })));
                }
                match retry {
                    Some(plan) => notices.push(Notice::Event(ServerEvent::Reconnecting(
                        Reconnecting {
                            attempt: plan.attempt,
                            delay_ms: plan.delay.as_millis() as u64,
                        },
                    ))),
                    None => {
                        warn!("Reconnect abandoned: {}", reason);
                        core.fail_all_pending("connection lost", notices);
                        if !was_connected {
                            notices.push(Notice::Event(ServerEvent::Disconnected(
                                Disconnected {
                                    reason: Some(reason),
                                },
                            )));
                        }
                    }
                }
            }
            TransportOutcome::AuthRejected { reason } => {
                core.registry.mark_all_unjoined();
                core.fail_all_pending("authentication rejected", notices);
                notices.push(Notice::Event(ServerEvent::Disconnected(Disconnected {
                    reason: Some(reason),
                })));
            }
        }
    }

    fn route_inbound(&self, core: &mut Core, event: ServerEvent, notices: &mut Vec<Notice>) {
        match &event {
            ServerEvent::ChatMessage(message) => match core.outbox.reconcile(message) {
                Reconciled::Confirmed(confirmed) => {
                    core.cancel_ack(&confirmed.temp_id);
                    notices.push(Notice::Outbox(confirmed));
                    return;
                }
                Reconciled::Duplicate => return,
                Reconciled::Foreign => {}
            },
            ServerEvent::Error(frame) => {
                warn!("Server error {}: {}", frame.code, frame.message);
                if let Some(temp_id) = &frame.client_temp_id {
                    let reason = format!("{}: {}", frame.code, frame.message);
                    core.fail_message(temp_id, &reason, notices);
                }
            }
            ServerEvent::Connected(welcome) => {
                core.outbox.set_own_user(welcome.user_id.clone());
            }
            _ => {}
        }
        if !core.in_scope(&event) {
            debug!("Dropped {} for a room no longer held", event.kind());
            return;
        }
        notices.push(Notice::Event(event));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn drive(
    shared: Weak<Shared>,
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    mut acks: mpsc::UnboundedReceiver<TempId>,
    shutdown: CancellationToken,
) {
    debug!("Realtime driver started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(signal) = signals.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.on_signal(signal);
            }
            Some(temp_id) = acks.recv() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.on_ack_timeout(temp_id);
            }
            else => break,
        }
    }
    debug!("Realtime driver stopped");
}
