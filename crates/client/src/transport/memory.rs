//! In-memory transport for driving the client without sockets.
//!
//! Each successful `connect` hands the hub side of a fresh channel to the
//! paired [`MemoryHub`], where a test (or a local simulation) plays the hub.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use fitchat_shared::{ChatEvent, ClientFrame, HubEnvelope, ServerFrame, TransportKind};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{Connector, TransportChannel, TransportMessage};
use crate::error::TransportError;

/// [`Connector`] producing in-memory channels.
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
    auto_handshake: AtomicBool,
    attempts: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

/// Receives the hub side of every channel the connector opens.
#[derive(Debug)]
pub struct MemoryHub {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Hub side of one in-memory channel.
#[derive(Debug)]
pub struct MemoryPeer {
    pub access_token: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportMessage>,
}

/// An `invoke` frame seen by the hub side.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: String,
    pub target: String,
    pub arguments: Vec<Value>,
}

impl MemoryConnector {
    /// A connector that accepts connections and answers the handshake itself.
    pub fn new() -> (Self, MemoryHub) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: accepted_tx,
                refuse: AtomicBool::new(false),
                auto_handshake: AtomicBool::new(true),
                attempts: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
            },
            MemoryHub {
                accepted: accepted_rx,
            },
        )
    }

    /// While set, every `connect` fails as if the hub were unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// When cleared, the hub side must answer the handshake itself.
    pub fn set_auto_handshake(&self, enabled: bool) {
        self.auto_handshake.store(enabled, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Access tokens presented, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens
            .lock()
            .map(|tokens| tokens.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _hub_url: &Url,
        access_token: &str,
    ) -> Result<TransportChannel, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.push(access_token.to_string());
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(Some("connection refused".to_string())));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            access_token: access_token.to_string(),
            from_client: outbound_rx,
            to_client: inbound_tx,
        };
        if self.auto_handshake.load(Ordering::SeqCst) {
            peer.send(ServerFrame::Handshake { error: None });
        }
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::Closed(Some("memory hub is gone".to_string())))?;

        Ok(TransportChannel::new(
            TransportKind::WebSockets,
            outbound_tx,
            inbound_rx,
        ))
    }
}

impl MemoryHub {
    /// Next channel opened by the client.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }
}

impl MemoryPeer {
    /// Next client frame, skipping anything that does not parse.
    pub async fn recv_frame(&mut self) -> Option<HubEnvelope<ClientFrame>> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(envelope) = HubEnvelope::<ClientFrame>::from_text(&text) {
                return Some(envelope);
            }
        }
    }

    /// Next `invoke` frame, skipping pings and handshakes.
    pub async fn next_invocation(&mut self) -> Option<Invocation> {
        loop {
            let envelope = self.recv_frame().await?;
            if let ClientFrame::Invoke { target, arguments } = envelope.payload {
                return Some(Invocation {
                    id: envelope.id,
                    target,
                    arguments,
                });
            }
        }
    }

    /// Wait for the client handshake and accept it.
    pub async fn accept_handshake(&mut self) -> bool {
        while let Some(envelope) = self.recv_frame().await {
            if matches!(envelope.payload, ClientFrame::Handshake { .. }) {
                self.send(ServerFrame::Handshake { error: None });
                return true;
            }
        }
        false
    }

    pub fn send(&self, frame: ServerFrame) -> bool {
        self.send_envelope(HubEnvelope::new(frame))
    }

    /// Answer invocation `id`, with an error message when `error` is set.
    pub fn complete(&self, id: &str, error: Option<&str>) -> bool {
        self.send_envelope(HubEnvelope::reply_to(
            id,
            ServerFrame::Completion {
                error: error.map(str::to_string),
            },
        ))
    }

    pub fn push(&self, event: &ChatEvent) -> bool {
        match event.to_frame() {
            Ok(frame) => self.send(frame),
            Err(_) => false,
        }
    }

    /// Deliver raw text, bypassing frame encoding.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(TransportMessage::Text(text.into()))
            .is_ok()
    }

    /// Simulate the channel dying underneath the client.
    pub fn drop_connection(self, reason: Option<&str>) {
        let _ = self
            .to_client
            .send(TransportMessage::Closed(reason.map(str::to_string)));
    }

    /// Resolves once the client has let go of this channel.
    pub async fn closed(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }

    fn send_envelope(&self, envelope: HubEnvelope<ServerFrame>) -> bool {
        match envelope.to_text() {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }
}
