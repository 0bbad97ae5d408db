//! Hub connection with state management and auto-reconnect.
//!
//! `start` opens one link (transport channel plus handshake) and hands it to
//! a supervisor task. The supervisor pumps inbound frames, sends keep-alive
//! pings and, when the link drops, runs the retry loop until the policy gives
//! up or `stop` signals shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use fitchat_shared::{ClientFrame, HubEnvelope, HubMethod, ServerFrame, TransportKind};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ChatConfig;
use crate::error::{ChatError, TransportError};
use crate::retry::{ReconnectPolicy, RetryContext};
use crate::router::EventRouter;
use crate::state::{ConnectionState, ConnectionStateMachine, SessionEpoch, StateObserver};
use crate::transport::{Connector, TransportMessage};

/// Supplies the bearer token. Called once per connection attempt; `None`
/// means no token is available and the attempt fails.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

type Inbound = mpsc::UnboundedReceiver<TransportMessage>;

/// A managed connection to one hub.
pub struct HubConnection {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    /// Serializes `start` calls.
    start_lock: tokio::sync::Mutex<()>,
}

struct Shared {
    config: ChatConfig,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn ReconnectPolicy>,
    state: ConnectionStateMachine,
    router: Arc<EventRouter>,
    /// Present exactly while the state is `Connected`.
    link: RwLock<Option<Arc<Link>>>,
}

/// One start()..stop() span.
struct Session {
    epoch: SessionEpoch,
    shutdown: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

/// Why a link stopped being pumped.
#[derive(Debug)]
enum LinkEnd {
    Shutdown,
    /// Unexpected loss; reconnect.
    Dropped(Option<String>),
    /// Hub closed and forbade reconnecting.
    Fatal(Option<String>),
}

impl std::fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnection")
            .field("hub_url", &self.shared.config.hub_url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl HubConnection {
    pub fn new(
        config: ChatConfig,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn ReconnectPolicy>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                policy,
                state: ConnectionStateMachine::default(),
                router,
                link: RwLock::new(None),
            }),
            session: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.state()
    }

    pub fn set_state_observer(&self, observer: Option<StateObserver>) {
        self.shared.state.set_observer(observer);
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.shared.router
    }

    /// Transport of the live link, if connected.
    pub fn transport(&self) -> Option<TransportKind> {
        self.shared.current_link().map(|link| link.kind)
    }

    /// Connect to the hub.
    ///
    /// No-op while `Connected` or `Reconnecting`. On failure the state returns
    /// to `Disconnected` and the cause is returned; a concurrent `stop` makes
    /// this fail with [`ChatError::Stopped`].
    pub async fn start(&self, tokens: TokenProvider) -> Result<(), ChatError> {
        let _serialized = self.start_lock.lock().await;
        let current = self.state();
        if matches!(
            current,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            crate::log_debug!("start ignored while {:?}", current);
            return Ok(());
        }

        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let epoch = {
            let mut slot = self.lock_session();
            let epoch = self.shared.state.begin_connecting()?;
            if let Some(previous) = slot.replace(Session {
                epoch,
                shutdown: shutdown_tx,
                supervisor: None,
            }) {
                let _ = previous.shutdown.send(true);
            }
            epoch
        };

        crate::log_info!("Connecting to {}", self.shared.config.hub_url);
        let attempt = tokio::select! {
            result = self.shared.open_link(&tokens) => result,
            _ = stopped(&mut shutdown) => return Err(ChatError::Stopped),
        };

        let (link, inbound) = match attempt {
            Ok(opened) => opened,
            Err(e) => {
                crate::log_error!("Failed to connect to {}: {}", self.shared.config.hub_url, e);
                return match self.shared.state.transition(epoch, ConnectionState::Disconnected) {
                    Ok(true) => Err(e),
                    Ok(false) => Err(ChatError::Stopped),
                    Err(transition) => Err(transition),
                };
            }
        };

        let applied = self
            .shared
            .state
            .transition_with(epoch, ConnectionState::Connected, || {
                self.shared.install_link(Some(link.clone()))
            })?;
        if !applied {
            link.retire();
            return Err(ChatError::Stopped);
        }
        crate::log_info!("Connected to {} over {}", self.shared.config.hub_url, link.kind);

        let supervisor = tokio::spawn(supervise(
            self.shared.clone(),
            epoch,
            link,
            inbound,
            tokens,
            shutdown,
        ));
        if let Some(session) = self.lock_session().as_mut() {
            if session.epoch == epoch {
                session.supervisor = Some(supervisor);
            }
        }
        Ok(())
    }

    /// Close the connection and cancel any reconnection in progress.
    ///
    /// Ends in `Disconnected` from any state. Never fails.
    pub async fn stop(&self) {
        let session = {
            let mut slot = self.lock_session();
            let session = slot.take();
            if self.shared.state.stop() {
                crate::log_info!("Connection to {} stopped", self.shared.config.hub_url);
            }
            session
        };
        if let Some(link) = self.shared.take_link() {
            link.retire();
        }

        let Some(mut session) = session else {
            return;
        };
        let _ = session.shutdown.send(true);
        if let Some(supervisor) = session.supervisor.take() {
            if let Err(e) = supervisor.await {
                crate::log_warn!("connection task ended abnormally: {}", e);
            }
        }
    }

    /// Invoke a hub method and wait for its completion.
    pub async fn invoke(&self, method: HubMethod) -> Result<(), ChatError> {
        let target = method.target();
        let link = self
            .shared
            .current_link()
            .ok_or(ChatError::NotConnected { operation: target })?;
        let completion = link.invoke(method)?;
        match completion.await {
            Ok(None) => Ok(()),
            Ok(Some(message)) => Err(ChatError::Invocation {
                target: target.to_string(),
                message,
            }),
            Err(_) => Err(ChatError::ConnectionLost),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            self.shared.state.stop();
            if let Some(link) = self.shared.take_link() {
                link.retire();
            }
            let _ = session.shutdown.send(true);
        }
    }
}

impl Shared {
    fn current_link(&self) -> Option<Arc<Link>> {
        match self.link.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install_link(&self, link: Option<Arc<Link>>) {
        match self.link.write() {
            Ok(mut slot) => *slot = link,
            Err(poisoned) => *poisoned.into_inner() = link,
        }
    }

    fn take_link(&self) -> Option<Arc<Link>> {
        match self.link.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// One connection attempt: fresh token, transport, handshake.
    async fn open_link(&self, tokens: &TokenProvider) -> Result<(Arc<Link>, Inbound), ChatError> {
        let token = tokens().ok_or(ChatError::TokenUnavailable)?;
        let channel = self
            .connector
            .connect(&self.config.hub_url, &token)
            .await?;
        let (kind, outbound, mut inbound) = channel.into_parts();
        let link = Arc::new(Link::new(kind, outbound));

        let handshake = async {
            link.send_frame(ClientFrame::handshake())?;
            await_handshake(&mut inbound).await
        };
        let outcome = match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::HandshakeTimeout),
        };
        if let Err(e) = outcome {
            link.retire();
            return Err(e.into());
        }
        Ok((link, inbound))
    }

    /// Handle one inbound frame; `Some` ends the link.
    fn handle_frame(&self, link: &Link, text: &str) -> Option<LinkEnd> {
        let envelope = match HubEnvelope::<ServerFrame>::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                crate::log_warn!("dropping unreadable frame: {}", e);
                return None;
            }
        };

        match envelope.payload {
            ServerFrame::Push { target, arguments } => {
                self.router.dispatch_push(&target, &arguments);
            }
            ServerFrame::Completion { error } => match envelope.correlation_id {
                Some(id) => {
                    if !link.complete(&id, error) {
                        crate::log_debug!("completion for unknown invocation {}", id);
                    }
                }
                None => crate::log_warn!("completion without correlation id"),
            },
            ServerFrame::Ping => {}
            ServerFrame::Handshake { .. } => crate::log_debug!("ignoring repeated handshake"),
            ServerFrame::Close {
                error,
                allow_reconnect,
            } => {
                return Some(if allow_reconnect {
                    LinkEnd::Dropped(error)
                } else {
                    LinkEnd::Fatal(error)
                });
            }
        }
        None
    }
}

/// Wait for the hub's handshake answer, skipping pings.
async fn await_handshake(inbound: &mut Inbound) -> Result<(), TransportError> {
    loop {
        let text = match inbound.recv().await {
            Some(TransportMessage::Text(text)) => text,
            Some(TransportMessage::Closed(reason)) => return Err(TransportError::Closed(reason)),
            None => return Err(TransportError::Closed(None)),
        };
        match HubEnvelope::<ServerFrame>::from_text(&text)?.payload {
            ServerFrame::Handshake { error: None } => return Ok(()),
            ServerFrame::Handshake { error: Some(e) } => {
                return Err(TransportError::HandshakeRejected(e))
            }
            ServerFrame::Close { error, .. } => return Err(TransportError::Closed(error)),
            other => crate::log_debug!("frame before handshake ignored: {:?}", other),
        }
    }
}

/// Resolves once shutdown is signalled or the session is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let signalled = *shutdown.borrow_and_update();
        if signalled {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the live link for one session and recovers it after drops.
async fn supervise(
    shared: Arc<Shared>,
    epoch: SessionEpoch,
    mut link: Arc<Link>,
    mut inbound: Inbound,
    tokens: TokenProvider,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let end = pump(&shared, &link, &mut inbound, &mut shutdown).await;
        let next = match end {
            LinkEnd::Shutdown => return,
            LinkEnd::Fatal(reason) => {
                crate::log_warn!(
                    "Hub closed the connection{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                ConnectionState::Disconnected
            }
            LinkEnd::Dropped(reason) => {
                crate::log_warn!(
                    "Connection to {} lost{}",
                    shared.config.hub_url,
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                ConnectionState::Reconnecting
            }
        };

        let applied = shared
            .state
            .transition_with(epoch, next, || shared.install_link(None));
        link.retire();
        match applied {
            Ok(true) if next == ConnectionState::Reconnecting => {}
            Ok(_) => return,
            Err(e) => {
                crate::log_error!("{}", e);
                return;
            }
        }

        match reconnect(&shared, epoch, &tokens, &mut shutdown).await {
            Some((next_link, next_inbound)) => {
                link = next_link;
                inbound = next_inbound;
            }
            None => return,
        }
    }
}

/// Pump one link until it ends.
async fn pump(
    shared: &Shared,
    link: &Link,
    inbound: &mut Inbound,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkEnd {
    let mut keep_alive = tokio::time::interval_at(
        Instant::now() + shared.config.keep_alive_interval,
        shared.config.keep_alive_interval,
    );
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let server_timeout = tokio::time::sleep(shared.config.server_timeout);
    tokio::pin!(server_timeout);

    loop {
        tokio::select! {
            _ = stopped(shutdown) => return LinkEnd::Shutdown,
            _ = keep_alive.tick() => {
                if let Err(e) = link.send_frame(ClientFrame::Ping) {
                    return LinkEnd::Dropped(Some(e.to_string()));
                }
            }
            _ = &mut server_timeout => {
                return LinkEnd::Dropped(Some("server timeout elapsed".to_string()));
            }
            message = inbound.recv() => match message {
                Some(TransportMessage::Text(text)) => {
                    server_timeout
                        .as_mut()
                        .reset(Instant::now() + shared.config.server_timeout);
                    if let Some(end) = shared.handle_frame(link, &text) {
                        return end;
                    }
                }
                Some(TransportMessage::Closed(reason)) => return LinkEnd::Dropped(reason),
                None => return LinkEnd::Dropped(None),
            },
        }
    }
}

/// Retry loop run while `Reconnecting`. Returns the new link once
/// `Connected`, or `None` when the policy gave up or the session ended.
async fn reconnect(
    shared: &Shared,
    epoch: SessionEpoch,
    tokens: &TokenProvider,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(Arc<Link>, Inbound)> {
    let started = Instant::now();
    let mut previous_retry_count = 0_u32;

    loop {
        let context = RetryContext::new(previous_retry_count, started.elapsed());
        let Some(delay) = shared.policy.next_delay(&context) else {
            crate::log_warn!(
                "Giving up on {} after {} attempts in {:?}",
                shared.config.hub_url,
                previous_retry_count,
                context.elapsed
            );
            if let Err(e) = shared.state.transition(epoch, ConnectionState::Disconnected) {
                crate::log_error!("{}", e);
            }
            return None;
        };

        crate::log_info!(
            "Reconnecting to {} in {}ms (attempt {})",
            shared.config.hub_url,
            delay.as_millis(),
            previous_retry_count + 1
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(shutdown) => return None,
        }

        let attempt = tokio::select! {
            result = shared.open_link(tokens) => result,
            _ = stopped(shutdown) => return None,
        };
        match attempt {
            Ok((link, inbound)) => {
                let applied = shared
                    .state
                    .transition_with(epoch, ConnectionState::Connected, || {
                        shared.install_link(Some(link.clone()))
                    });
                return match applied {
                    Ok(true) => {
                        crate::log_info!("Reconnected to {} over {}", shared.config.hub_url, link.kind);
                        Some((link, inbound))
                    }
                    Ok(false) => {
                        link.retire();
                        None
                    }
                    Err(e) => {
                        crate::log_error!("{}", e);
                        link.retire();
                        None
                    }
                };
            }
            Err(e) => {
                crate::log_warn!("Reconnect attempt {} failed: {}", previous_retry_count + 1, e);
                previous_retry_count = previous_retry_count.saturating_add(1);
            }
        }
    }
}

/// Outbound half of one live channel plus its in-flight invocations.
struct Link {
    kind: TransportKind,
    inner: Mutex<LinkInner>,
}

struct LinkInner {
    /// `None` once retired; dropping it closes the transport.
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Invocation id -> completion slot carrying the hub's error, if any.
    pending: HashMap<String, oneshot::Sender<Option<String>>>,
}

impl Link {
    fn new(kind: TransportKind, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            kind,
            inner: Mutex::new(LinkInner {
                outbound: Some(outbound),
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let text = HubEnvelope::new(frame).to_text()?;
        let inner = self.lock();
        let outbound = inner.outbound.as_ref().ok_or(TransportError::Closed(None))?;
        outbound
            .send(text)
            .map_err(|_| TransportError::Closed(None))
    }

    /// Queue an invocation; the receiver resolves on its completion and
    /// errors if the link is retired first.
    fn invoke(&self, method: HubMethod) -> Result<oneshot::Receiver<Option<String>>, ChatError> {
        let envelope = HubEnvelope::new(method.into_frame());
        let text = envelope.to_text()?;
        let (tx, rx) = oneshot::channel();

        let mut inner = self.lock();
        let outbound = inner.outbound.as_ref().ok_or(ChatError::ConnectionLost)?;
        outbound.send(text).map_err(|_| ChatError::ConnectionLost)?;
        inner.pending.insert(envelope.id, tx);
        Ok(rx)
    }

    fn complete(&self, id: &str, error: Option<String>) -> bool {
        match self.lock().pending.remove(id) {
            Some(slot) => {
                let _ = slot.send(error);
                true
            }
            None => false,
        }
    }

    /// Close the channel and fail every pending invocation.
    fn retire(&self) {
        let mut inner = self.lock();
        inner.outbound = None;
        inner.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use crate::router::ChatEventHandlers;
    use crate::state::StateChange;
    use crate::transport::{MemoryConnector, MemoryHub};
    use chrono::Utc;
    use fitchat_shared::{ChatEvent, ChatMessage, MessageType, ParticipantRole};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        connection: Arc<HubConnection>,
        connector: Arc<MemoryConnector>,
        hub: MemoryHub,
        router: Arc<EventRouter>,
        states: mpsc::UnboundedReceiver<ConnectionState>,
        token_calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            let (connector, hub) = MemoryConnector::new();
            let connector = Arc::new(connector);
            let router = Arc::new(EventRouter::new());
            let config = ChatConfig::parse("http://hub.test/hubs/chat").expect("config");
            let connection = Arc::new(HubConnection::new(
                config,
                connector.clone(),
                Arc::new(BackoffPolicy::default()),
                router.clone(),
            ));

            let (tx, states) = mpsc::unbounded_channel();
            connection.set_state_observer(Some(Arc::new(move |change: StateChange| {
                let _ = tx.send(change.current);
            })));

            Self {
                connection,
                connector,
                hub,
                router,
                states,
                token_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn tokens(&self) -> TokenProvider {
            let calls = self.token_calls.clone();
            Arc::new(move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Some(format!("token-{n}"))
            })
        }

        async fn start(&self) -> Result<(), ChatError> {
            self.connection.start(self.tokens()).await
        }

        async fn next_state(&mut self) -> ConnectionState {
            self.states.recv().await.expect("state change")
        }

        fn drain_states(&mut self) -> Vec<ConnectionState> {
            let mut seen = Vec::new();
            while let Ok(state) = self.states.try_recv() {
                seen.push(state);
            }
            seen
        }
    }

    fn message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation_id: "conv-42".to_string(),
            sender_id: "advisor-7".to_string(),
            sender_role: ParticipantRole::Advisor,
            content: "Great session today".to_string(),
            message_type: MessageType::Text,
            attachment_url: None,
            created_at: Utc::now(),
            is_read: false,
        }
    }

    #[tokio::test]
    async fn start_connects_and_stop_disconnects() {
        let mut h = Harness::new();

        h.start().await.expect("start");
        assert_eq!(h.connection.state(), ConnectionState::Connected);
        assert_eq!(h.connection.transport(), Some(TransportKind::WebSockets));
        let mut peer = h.hub.accept().await.expect("peer");
        assert_eq!(peer.access_token, "token-0");

        h.connection.stop().await;
        assert_eq!(
            h.drain_states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
        // Stopping closes the transport.
        peer.closed().await;

        h.connection.stop().await;
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
        assert!(h.drain_states().is_empty());
    }

    #[tokio::test]
    async fn start_while_connected_is_a_noop() {
        let h = Harness::new();
        h.start().await.expect("first start");
        h.start().await.expect("second start");
        assert_eq!(h.connector.attempts(), 1);
        h.connection.stop().await;
    }

    #[tokio::test]
    async fn failed_start_returns_to_disconnected() {
        let mut h = Harness::new();
        h.connector.refuse_connections(true);

        let err = h.start().await.expect_err("hub refuses");
        assert!(matches!(err, ChatError::Connect(TransportError::Closed(_))));
        assert_eq!(
            h.drain_states(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );

        // A later start recovers.
        h.connector.refuse_connections(false);
        h.start().await.expect("second start");
        assert_eq!(h.connection.state(), ConnectionState::Connected);
        h.connection.stop().await;
    }

    #[tokio::test]
    async fn missing_token_fails_without_connecting() {
        let h = Harness::new();
        let err = h
            .connection
            .start(Arc::new(|| None))
            .await
            .expect_err("no token");
        assert!(matches!(err, ChatError::TokenUnavailable));
        assert_eq!(h.connector.attempts(), 0);
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rejected_handshake_fails_start() {
        let mut h = Harness::new();
        h.connector.set_auto_handshake(false);

        let connection = h.connection.clone();
        let tokens = h.tokens();
        let start = tokio::spawn(async move { connection.start(tokens).await });

        let mut peer = h.hub.accept().await.expect("peer");
        let handshake = peer.recv_frame().await.expect("handshake frame");
        assert_eq!(handshake.payload, ClientFrame::handshake());
        peer.send(ServerFrame::Handshake {
            error: Some("protocol 'json' v1 not supported".to_string()),
        });

        let err = start.await.expect("join").expect_err("rejected");
        assert!(matches!(
            err,
            ChatError::Connect(TransportError::HandshakeRejected(_))
        ));
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hub_times_out_the_handshake() {
        let h = Harness::new();
        h.connector.set_auto_handshake(false);

        // The unanswered peer stays queued in `h.hub`.
        let err = h.start().await.expect_err("no handshake answer");
        assert!(matches!(
            err,
            ChatError::Connect(TransportError::HandshakeTimeout)
        ));
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_during_start_fails_it_with_stopped() {
        let mut h = Harness::new();
        h.connector.set_auto_handshake(false);

        let connection = h.connection.clone();
        let tokens = h.tokens();
        let start = tokio::spawn(async move { connection.start(tokens).await });

        // The transport is open and the handshake is pending.
        let _peer = h.hub.accept().await.expect("peer");
        assert_eq!(h.next_state().await, ConnectionState::Connecting);
        h.connection.stop().await;

        let err = start.await.expect("join").expect_err("stopped");
        assert!(matches!(err, ChatError::Stopped));
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
        assert_eq!(h.drain_states(), vec![ConnectionState::Disconnected]);
    }

    #[tokio::test]
    async fn completion_resolves_invocation() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let mut peer = h.hub.accept().await.expect("peer");

        let connection = h.connection.clone();
        let call = tokio::spawn(async move {
            connection
                .invoke(HubMethod::JoinConversation {
                    conversation_id: "conv-42".to_string(),
                })
                .await
        });

        let invocation = peer.next_invocation().await.expect("invoke");
        assert_eq!(invocation.target, "JoinConversation");
        assert_eq!(invocation.arguments, vec![serde_json::json!("conv-42")]);
        peer.complete(&invocation.id, None);

        call.await.expect("join").expect("completed");
        h.connection.stop().await;
    }

    #[tokio::test]
    async fn error_completion_fails_invocation() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let mut peer = h.hub.accept().await.expect("peer");

        let connection = h.connection.clone();
        let call = tokio::spawn(async move {
            connection
                .invoke(HubMethod::SendMessage {
                    conversation_id: "conv-9".to_string(),
                    content: "hi".to_string(),
                    message_type: MessageType::Text,
                })
                .await
        });

        let invocation = peer.next_invocation().await.expect("invoke");
        peer.complete(&invocation.id, Some("not a member of conv-9"));

        let err = call.await.expect("join").expect_err("hub error");
        match err {
            ChatError::Invocation { target, message } => {
                assert_eq!(target, "SendMessage");
                assert_eq!(message, "not a member of conv-9");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        h.connection.stop().await;
    }

    #[tokio::test]
    async fn pending_invocation_fails_when_link_drops() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let mut peer = h.hub.accept().await.expect("peer");

        let connection = h.connection.clone();
        let call = tokio::spawn(async move {
            connection
                .invoke(HubMethod::JoinConversation {
                    conversation_id: "conv-42".to_string(),
                })
                .await
        });
        peer.next_invocation().await.expect("invoke");
        peer.drop_connection(Some("network unreachable"));

        let err = call.await.expect("join").expect_err("lost");
        assert!(matches!(err, ChatError::ConnectionLost));
        h.connection.stop().await;
    }

    #[tokio::test]
    async fn push_reaches_router_once() {
        let h = Harness::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.router
            .set_handlers(ChatEventHandlers::new().on_receive_message(move |m| {
                tx.send(m.clone())?;
                Ok(())
            }));

        let mut hub = h.hub;
        h.connection.start(Arc::new(|| Some("u".to_string()))).await.expect("start");
        let peer = hub.accept().await.expect("peer");

        let pushed = message("m1");
        peer.push(&ChatEvent::ReceiveMessage(pushed.clone()));
        assert_eq!(rx.recv().await.expect("delivered"), pushed);

        h.connection.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_reconnects_and_rejects_calls_meanwhile() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let first = h.hub.accept().await.expect("first peer");
        assert_eq!(h.drain_states().len(), 2);

        first.drop_connection(None);
        assert_eq!(h.next_state().await, ConnectionState::Reconnecting);

        let err = h
            .connection
            .invoke(HubMethod::SendMessage {
                conversation_id: "conv-42".to_string(),
                content: "hi".to_string(),
                message_type: MessageType::Text,
            })
            .await
            .expect_err("reconnecting");
        assert!(err.is_not_connected());

        assert_eq!(h.next_state().await, ConnectionState::Connected);
        let second = h.hub.accept().await.expect("second peer");
        assert_eq!(second.access_token, "token-1");
        assert_eq!(h.connector.attempts(), 2);
        assert_eq!(h.token_calls.load(Ordering::SeqCst), 2);

        h.connection.stop().await;
        assert_eq!(h.next_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_policy_ends_disconnected() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let peer = h.hub.accept().await.expect("peer");
        h.drain_states();

        h.connector.refuse_connections(true);
        peer.drop_connection(None);
        assert_eq!(h.next_state().await, ConnectionState::Reconnecting);
        assert_eq!(h.next_state().await, ConnectionState::Disconnected);

        // Retries at 1s, 3s, 7s, 15s, 31s and 61s; the window is then spent.
        assert_eq!(h.connector.attempts(), 7);
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(h.connector.attempts(), 7);
        assert!(h.drain_states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_retry_delay_cancels_reconnection() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let peer = h.hub.accept().await.expect("peer");
        h.drain_states();

        peer.drop_connection(None);
        assert_eq!(h.next_state().await, ConnectionState::Reconnecting);
        h.connection.stop().await;
        assert_eq!(h.next_state().await, ConnectionState::Disconnected);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_close_disconnects_without_retrying() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let peer = h.hub.accept().await.expect("peer");
        h.drain_states();

        peer.send(ServerFrame::Close {
            error: Some("account suspended".to_string()),
            allow_reconnect: false,
        });
        assert_eq!(h.next_state().await, ConnectionState::Disconnected);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnectable_close_triggers_retry() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let peer = h.hub.accept().await.expect("peer");
        h.drain_states();

        peer.send(ServerFrame::Close {
            error: None,
            allow_reconnect: true,
        });
        assert_eq!(h.next_state().await, ConnectionState::Reconnecting);
        assert_eq!(h.next_state().await, ConnectionState::Connected);
        h.connection.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wire_close_with_allow_reconnect_retries() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let peer = h.hub.accept().await.expect("peer");
        h.drain_states();

        assert!(peer.send_raw(
            r#"{"id":"f9","type":"close","data":{"error":"restarting","allowReconnect":true},"ts":"2024-01-01T00:00:00Z"}"#
        ));
        assert_eq!(h.next_state().await, ConnectionState::Reconnecting);
        assert_eq!(h.next_state().await, ConnectionState::Connected);
        assert_eq!(h.connector.attempts(), 2);
        h.connection.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hub_is_treated_as_dropped() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let mut peer = h.hub.accept().await.expect("peer");
        h.drain_states();

        let handshake = peer.recv_frame().await.expect("handshake");
        assert_eq!(handshake.payload, ClientFrame::handshake());
        // Keep-alive pings go out while waiting.
        let ping = peer.recv_frame().await.expect("ping");
        assert_eq!(ping.payload, ClientFrame::Ping);

        assert_eq!(h.next_state().await, ConnectionState::Reconnecting);
        h.connection.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn observed_sequence_has_no_skipped_edges() {
        let mut h = Harness::new();
        h.start().await.expect("start");
        let first = h.hub.accept().await.expect("peer");
        first.drop_connection(None);
        while h.connection.state() != ConnectionState::Connected
            || h.connector.attempts() < 2
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        h.connection.stop().await;

        let states = h.drain_states();
        let mut previous = ConnectionState::Disconnected;
        for state in states {
            assert!(
                previous.can_transition_to(state),
                "{previous:?} -> {state:?}"
            );
            previous = state;
        }
        assert_eq!(previous, ConnectionState::Disconnected);
    }
}
