//! In-memory dialer for driving the transport from tests
//!
//! Every `dial` records a [`ScriptedLink`]. Tests play the server side on
//! it: open it, push events, drop it, or refuse the credential, and read
//! back the frames the client wrote.

use super::link::{Dialer, LinkHandle, LinkReporter};
use dojo_core::{decode_client_frame, encode_server_event, ClientFrame, Credential, ServerEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every dial attempt as a scriptable link
#[derive(Default)]
pub struct ScriptedDialer {
    links: Mutex<Vec<Arc<ScriptedLink>>>,
}

impl ScriptedDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dial_count(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn link(&self, index: usize) -> Option<Arc<ScriptedLink>> {
        lock(&self.links).get(index).cloned()
    }

    pub fn last_link(&self) -> Option<Arc<ScriptedLink>> {
        lock(&self.links).last().cloned()
    }
}

impl Dialer for ScriptedDialer {
    fn dial(&self, credential: &Credential, reporter: LinkReporter) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        lock(&self.links).push(Arc::new(ScriptedLink {
            credential: credential.clone(),
            reporter,
            outbound: Mutex::new(rx),
            close: close.clone(),
        }));
        LinkHandle::new(tx, close)
    }
}

/// Server side of one dial attempt
pub struct ScriptedLink {
    credential: Credential,
    reporter: LinkReporter,
    outbound: Mutex<mpsc::UnboundedReceiver<String>>,
    close: CancellationToken,
}

impl ScriptedLink {
    /// Credential the client dialed with
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn generation(&self) -> u64 {
        self.reporter.generation()
    }

    /// Complete the handshake
    pub fn open(&self) {
        self.reporter.opened();
    }

    /// Push a server event as an encoded frame
    pub fn push(&self, event: impl Into<ServerEvent>) {
        if let Ok(text) = encode_server_event(&event.into()) {
            self.reporter.frame(text);
        }
    }

    /// Push an arbitrary text frame
    pub fn push_raw(&self, text: &str) {
        self.reporter.frame(text);
    }

    /// Close an open link from the server side
    pub fn drop_link(&self, reason: &str) {
        self.reporter.closed(reason);
    }

    /// Fail the attempt before the handshake completes
    pub fn fail(&self, error: &str) {
        self.reporter.failed(error);
    }

    /// Refuse the credential during the handshake
    pub fn reject(&self, reason: &str) {
        self.reporter.rejected(reason);
    }

    /// Whether the client tore this link down
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Drain and decode every frame the client wrote so far
    pub fn take_sent(&self) -> Vec<ClientFrame> {
        let mut outbound = lock(&self.outbound);
        let mut frames = Vec::new();
        while let Ok(text) = outbound.try_recv() {
            if let Ok(frame) = decode_client_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }
}
