//! The seam between the connection state machine and a physical socket
//!
//! A [`Dialer`] starts one physical connection attempt and returns
//! immediately. Everything that happens on that link afterwards is reported
//! back through a [`LinkReporter`] as [`TransportSignal`]s tagged with the
//! attempt's generation, so events from a link the connection has already
//! abandoned can be recognised and ignored.

use dojo_core::Credential;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What happened on a physical link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake completed, the link can carry frames
    Opened,
    /// One inbound text frame
    Frame(String),
    /// The link closed (peer close, read error, heartbeat failure)
    Closed(String),
    /// The attempt failed before the handshake completed
    Failed(String),
    /// The server refused the credential during the handshake
    Rejected(String),
}

/// Input to the connection's single driver task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Link { generation: u64, event: LinkEvent },
    /// The reconnect backoff timer armed during `generation` elapsed
    RetryDue { generation: u64 },
}

/// Reports link events for one dial attempt
#[derive(Debug, Clone)]
pub struct LinkReporter {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl LinkReporter {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportSignal>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.report(LinkEvent::Opened);
    }

    pub fn frame(&self, text: impl Into<String>) {
        self.report(LinkEvent::Frame(text.into()));
    }

    pub fn closed(&self, reason: impl Into<String>) {
        self.report(LinkEvent::Closed(reason.into()));
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.report(LinkEvent::Failed(error.into()));
    }

    pub fn rejected(&self, reason: impl Into<String>) {
        self.report(LinkEvent::Rejected(reason.into()));
    }

    /// Returns false once the connection is gone
    pub fn report(&self, event: LinkEvent) -> bool {
        self.tx
            .send(TransportSignal::Link {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Write side and teardown switch of one physical link
#[derive(Debug, Clone)]
pub struct LinkHandle {
    outbound: mpsc::UnboundedSender<String>,
    close: CancellationToken,
}

impl LinkHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, close: CancellationToken) -> Self {
        Self { outbound, close }
    }

    /// Hand a text frame to the link writer. False if the writer is gone.
    pub fn send(&self, text: String) -> bool {
        !self.close.is_cancelled() && self.outbound.send(text).is_ok()
    }

    /// Tear the link down. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.outbound.is_closed()
    }
}

/// Starts physical connection attempts
pub trait Dialer: Send + Sync + 'static {
    /// Begin connecting with `credential`. Must not block; the outcome is
    /// reported through `reporter`.
    fn dial(&self, credential: &Credential, reporter: LinkReporter) -> LinkHandle;
}
