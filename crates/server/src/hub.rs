//! Transport-agnostic hub: connections, conversation groups, presence and
//! method dispatch.
//!
//! Every live connection owns an outbox of encoded frames. Transports drain
//! the outbox (WebSocket writer, long-poll GET) and feed inbound text to
//! [`Hub::handle_text`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use fitchat_shared::{
    ChatEvent, ChatMessage, ClientFrame, HubEnvelope, HubMethod, NegotiateResponse,
    ParticipantRole, PresenceEvent, ReadReceipt, ServerFrame, TransportKind, TypingSignal,
    PROTOCOL_NAME, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

/// Authenticated caller, taken from the bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),
    #[error("connection '{0}' belongs to another user")]
    NotOwner(String),
}

struct Pending {
    caller: Caller,
    negotiated_at: Instant,
}

struct Connection {
    caller: Caller,
    outbox: mpsc::UnboundedSender<String>,
}

pub struct Hub {
    transports: Vec<TransportKind>,
    keep_alive_interval: Duration,
    /// Negotiated connection ids not yet opened by a transport.
    pending: RwLock<HashMap<String, Pending>>,
    connections: RwLock<HashMap<String, Connection>>,
    /// Conversation id -> member connection ids.
    groups: RwLock<HashMap<String, HashSet<String>>>,
    /// User id -> live connection ids.
    presence: RwLock<HashMap<String, HashSet<String>>>,
}

impl Hub {
    pub fn new(transports: Vec<TransportKind>, keep_alive_interval: Duration) -> Self {
        Self {
            transports,
            keep_alive_interval,
            pending: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
        }
    }

    pub fn offers(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Reserve a connection id for `caller`.
    pub async fn negotiate(&self, caller: Caller) -> NegotiateResponse {
        let connection_id = Uuid::new_v4().to_string();
        tracing::debug!("negotiated {} for {}", connection_id, caller.user_id);
        self.pending
            .write()
            .await
            .insert(
                connection_id.clone(),
                Pending {
                    caller,
                    negotiated_at: Instant::now(),
                },
            );
        NegotiateResponse {
            connection_id,
            available_transports: self.transports.clone(),
        }
    }

    /// Whether `connection_id` was negotiated by `caller` and not opened yet.
    pub async fn check_pending(&self, connection_id: &str, caller: &Caller) -> Result<(), HubError> {
        match self.pending.read().await.get(connection_id) {
            Some(pending) if pending.caller.user_id == caller.user_id => Ok(()),
            Some(_) => Err(HubError::NotOwner(connection_id.to_string())),
            None => Err(HubError::UnknownConnection(connection_id.to_string())),
        }
    }

    /// Forget negotiations no transport opened within `max_age`.
    pub async fn reap_pending(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.negotiated_at.elapsed() < max_age);
        let reaped = before - pending.len();
        if reaped > 0 {
            tracing::debug!("dropped {} unopened negotiations", reaped);
        }
        reaped
    }

    /// Open a connection. `connection_id` must come from `negotiate`; `None`
    /// opens a fresh one (negotiation skipped).
    pub async fn connect(
        &self,
        connection_id: Option<&str>,
        caller: Caller,
    ) -> Result<(String, mpsc::UnboundedReceiver<String>), HubError> {
        let connection_id = match connection_id {
            Some(id) => {
                self.check_pending(id, &caller).await?;
                self.pending.write().await.remove(id);
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let (outbox, rx) = mpsc::unbounded_channel();
        self.spawn_keep_alive(&outbox);
        self.connections.write().await.insert(
            connection_id.clone(),
            Connection {
                caller: caller.clone(),
                outbox,
            },
        );

        tracing::info!("{} connected as {}", caller.user_id, connection_id);
        Ok((connection_id, rx))
    }

    /// Drop a connection, its memberships and possibly its user's presence.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(connection) = self.connections.write().await.remove(connection_id) else {
            return;
        };
        {
            let mut groups = self.groups.write().await;
            for members in groups.values_mut() {
                members.remove(connection_id);
            }
            groups.retain(|_, members| !members.is_empty());
        }

        let user_id = connection.caller.user_id;
        let was_last_connection = {
            let mut presence = self.presence.write().await;
            match presence.get_mut(&user_id) {
                Some(user_connections) => {
                    user_connections.remove(connection_id);
                    if user_connections.is_empty() {
                        presence.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        tracing::info!("{} disconnected ({})", user_id, connection_id);

        if was_last_connection {
            self.broadcast(&ChatEvent::UserOffline(PresenceEvent {
                user_id,
                user_role: None,
                online: false,
            }))
            .await;
        }
    }

    /// Count a handshaken connection towards its user's presence.
    async fn announce(&self, connection_id: &str) {
        let Some(caller) = self.caller(connection_id).await else {
            return;
        };
        let is_first_connection = {
            let mut presence = self.presence.write().await;
            let user_connections = presence.entry(caller.user_id.clone()).or_default();
            let was_empty = user_connections.is_empty();
            if !user_connections.insert(connection_id.to_string()) {
                return;
            }
            was_empty
        };

        if is_first_connection {
            self.broadcast(&ChatEvent::UserOnline(PresenceEvent {
                user_id: caller.user_id,
                user_role: Some(caller.role),
                online: true,
            }))
            .await;
        }
    }

    /// Owner of a live connection.
    pub async fn caller(&self, connection_id: &str) -> Option<Caller> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|connection| connection.caller.clone())
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.presence.read().await.contains_key(user_id)
    }

    /// Handle one inbound frame from `connection_id`.
    pub async fn handle_text(&self, connection_id: &str, text: &str) {
        let envelope = match HubEnvelope::<ClientFrame>::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Unreadable frame from {}: {}", connection_id, e);
                return;
            }
        };

        match envelope.payload {
            ClientFrame::Handshake { protocol, version } => {
                let error = (protocol != PROTOCOL_NAME || version != PROTOCOL_VERSION)
                    .then(|| format!("protocol '{protocol}' v{version} is not supported"));
                let accepted = error.is_none();
                self.send_to(connection_id, HubEnvelope::new(ServerFrame::Handshake { error }))
                    .await;
                if accepted {
                    self.announce(connection_id).await;
                }
            }
            ClientFrame::Ping => {}
            ClientFrame::Invoke { target, arguments } => {
                let Some(caller) = self.caller(connection_id).await else {
                    return;
                };
                let error = match HubMethod::from_invocation(&target, &arguments) {
                    Ok(method) => self.invoke(connection_id, &caller, method).await.err(),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(ref message) = error {
                    tracing::debug!("{} from {} failed: {}", target, caller.user_id, message);
                }
                self.send_to(
                    connection_id,
                    HubEnvelope::reply_to(envelope.id, ServerFrame::Completion { error }),
                )
                .await;
            }
        }
    }

    async fn invoke(
        &self,
        connection_id: &str,
        caller: &Caller,
        method: HubMethod,
    ) -> Result<(), String> {
        match method {
            HubMethod::JoinConversation { conversation_id } => {
                self.groups
                    .write()
                    .await
                    .entry(conversation_id)
                    .or_default()
                    .insert(connection_id.to_string());
            }
            HubMethod::LeaveConversation { conversation_id } => {
                let mut groups = self.groups.write().await;
                if let Some(members) = groups.get_mut(&conversation_id) {
                    members.remove(connection_id);
                    if members.is_empty() {
                        groups.remove(&conversation_id);
                    }
                }
            }
            HubMethod::SendMessage {
                conversation_id,
                content,
                message_type,
            } => {
                if !self.is_member(&conversation_id, connection_id).await {
                    return Err(format!("not a member of conversation '{conversation_id}'"));
                }
                let message = ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: conversation_id.clone(),
                    sender_id: caller.user_id.clone(),
                    sender_role: caller.role.clone(),
                    content,
                    message_type,
                    attachment_url: None,
                    created_at: Utc::now(),
                    is_read: false,
                };
                self.send_to_group(&conversation_id, &ChatEvent::ReceiveMessage(message), None)
                    .await;
            }
            HubMethod::Typing { conversation_id } => {
                let event = ChatEvent::UserTyping(TypingSignal {
                    conversation_id: conversation_id.clone(),
                    user_id: caller.user_id.clone(),
                    user_name: None,
                });
                self.send_to_group(&conversation_id, &event, Some(connection_id))
                    .await;
            }
            HubMethod::StopTyping { conversation_id } => {
                let event = ChatEvent::UserStoppedTyping(TypingSignal {
                    conversation_id: conversation_id.clone(),
                    user_id: caller.user_id.clone(),
                    user_name: None,
                });
                self.send_to_group(&conversation_id, &event, Some(connection_id))
                    .await;
            }
            HubMethod::MarkAsRead { conversation_id } => {
                let event = ChatEvent::MessagesRead(ReadReceipt {
                    conversation_id: conversation_id.clone(),
                    user_id: caller.user_id.clone(),
                });
                self.send_to_group(&conversation_id, &event, None).await;
            }
        }
        Ok(())
    }

    async fn is_member(&self, conversation_id: &str, connection_id: &str) -> bool {
        self.groups
            .read()
            .await
            .get(conversation_id)
            .is_some_and(|members| members.contains(connection_id))
    }

    async fn send_to(&self, connection_id: &str, envelope: HubEnvelope<ServerFrame>) {
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode frame: {}", e);
                return;
            }
        };
        if let Some(connection) = self.connections.read().await.get(connection_id) {
            let _ = connection.outbox.send(text);
        }
    }

    async fn send_to_group(&self, conversation_id: &str, event: &ChatEvent, except: Option<&str>) {
        let Some(text) = encode_push(event) else {
            return;
        };
        let members: Vec<String> = match self.groups.read().await.get(conversation_id) {
            Some(members) => members.iter().cloned().collect(),
            None => return,
        };
        let connections = self.connections.read().await;
        for member in members.iter().filter(|id| Some(id.as_str()) != except) {
            if let Some(connection) = connections.get(member) {
                let _ = connection.outbox.send(text.clone());
            }
        }
    }

    async fn broadcast(&self, event: &ChatEvent) {
        let Some(text) = encode_push(event) else {
            return;
        };
        for connection in self.connections.read().await.values() {
            let _ = connection.outbox.send(text.clone());
        }
    }

    /// Ping the connection until its outbox is gone.
    fn spawn_keep_alive(&self, outbox: &mpsc::UnboundedSender<String>) {
        let outbox = outbox.downgrade();
        let period = self.keep_alive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(outbox) = outbox.upgrade() else {
                    return;
                };
                let Ok(text) = HubEnvelope::new(ServerFrame::Ping).to_text() else {
                    return;
                };
                if outbox.send(text).is_err() {
                    return;
                }
            }
        });
    }
}

fn encode_push(event: &ChatEvent) -> Option<String> {
    match event.to_frame().and_then(|frame| HubEnvelope::new(frame).to_text()) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("Failed to encode {} event: {}", event.kind(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(
            vec![TransportKind::WebSockets, TransportKind::LongPolling],
            Duration::from_secs(3600),
        ))
    }

    fn caller(user_id: &str, role: ParticipantRole) -> Caller {
        Caller {
            user_id: user_id.to_string(),
            role,
        }
    }

    fn invoke(target: &str, arguments: Vec<serde_json::Value>) -> (String, String) {
        let envelope = HubEnvelope::new(ClientFrame::Invoke {
            target: target.to_string(),
            arguments,
        });
        let id = envelope.id.clone();
        (id, envelope.to_text().expect("encode"))
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> HubEnvelope<ServerFrame> {
        let text = rx.try_recv().expect("frame queued");
        HubEnvelope::from_text(&text).expect("decode")
    }

    async fn handshake(hub: &Hub, connection_id: &str) {
        let text = HubEnvelope::new(ClientFrame::handshake()).to_text().expect("encode");
        hub.handle_text(connection_id, &text).await;
    }

    #[tokio::test]
    async fn negotiated_id_opens_once_for_its_owner() {
        let hub = hub();
        let client = caller("client-1", ParticipantRole::Client);
        let negotiated = hub.negotiate(client.clone()).await;
        assert_eq!(negotiated.available_transports.len(), 2);

        let other = caller("intruder", ParticipantRole::Client);
        assert_eq!(
            hub.connect(Some(&negotiated.connection_id), other).await.err(),
            Some(HubError::NotOwner(negotiated.connection_id.clone()))
        );

        let (id, _rx) = hub
            .connect(Some(&negotiated.connection_id), client.clone())
            .await
            .expect("open");
        assert_eq!(id, negotiated.connection_id);
        assert!(matches!(
            hub.connect(Some(&id), client).await,
            Err(HubError::UnknownConnection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unopened_negotiations_expire() {
        let hub = hub();
        let client = caller("client-1", ParticipantRole::Client);
        let stale = hub.negotiate(client.clone()).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = hub.negotiate(client.clone()).await;

        assert_eq!(hub.reap_pending(Duration::from_secs(60)).await, 0);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(hub.reap_pending(Duration::from_secs(60)).await, 1);

        assert_eq!(
            hub.check_pending(&stale.connection_id, &client).await,
            Err(HubError::UnknownConnection(stale.connection_id.clone()))
        );
        assert_eq!(hub.check_pending(&fresh.connection_id, &client).await, Ok(()));
    }

    #[tokio::test]
    async fn answers_handshake_and_rejects_other_protocols() {
        let hub = hub();
        let (id, mut rx) = hub
            .connect(None, caller("client-1", ParticipantRole::Client))
            .await
            .expect("open");
        assert!(rx.try_recv().is_err());

        handshake(&hub, &id).await;
        assert_eq!(next_frame(&mut rx).payload, ServerFrame::Handshake { error: None });
        assert!(matches!(
            next_frame(&mut rx).payload,
            ServerFrame::Push { ref target, .. } if target == "UserOnline"
        ));

        let bad = HubEnvelope::new(ClientFrame::Handshake {
            protocol: "messagepack".to_string(),
            version: 1,
        })
        .to_text()
        .expect("encode");
        hub.handle_text(&id, &bad).await;
        assert!(matches!(
            next_frame(&mut rx).payload,
            ServerFrame::Handshake { error: Some(_) }
        ));
    }

    #[tokio::test]
    async fn send_requires_membership_and_reaches_group() {
        let hub = hub();
        let (client, mut client_rx) = hub
            .connect(None, caller("client-1", ParticipantRole::Client))
            .await
            .expect("client");
        let (advisor, mut advisor_rx) = hub
            .connect(None, caller("advisor-1", ParticipantRole::Advisor))
            .await
            .expect("advisor");
        while client_rx.try_recv().is_ok() {}
        while advisor_rx.try_recv().is_ok() {}

        let (id, text) = invoke("SendMessage", vec![json!("conv-42"), json!("hi"), json!("text")]);
        hub.handle_text(&client, &text).await;
        let completion = next_frame(&mut client_rx);
        assert_eq!(completion.correlation_id.as_deref(), Some(id.as_str()));
        assert!(matches!(completion.payload, ServerFrame::Completion { error: Some(_) }));

        for connection in [&client, &advisor] {
            let (_, join) = invoke("JoinConversation", vec![json!("conv-42")]);
            hub.handle_text(connection, &join).await;
        }
        next_frame(&mut client_rx);
        next_frame(&mut advisor_rx);

        let (_, text) = invoke("SendMessage", vec![json!("conv-42"), json!("hi"), json!("text")]);
        hub.handle_text(&client, &text).await;

        let ServerFrame::Push { target, arguments } = next_frame(&mut advisor_rx).payload else {
            panic!("expected push");
        };
        let ChatEvent::ReceiveMessage(message) =
            ChatEvent::from_push(&target, &arguments).expect("event")
        else {
            panic!("expected message");
        };
        assert_eq!(message.sender_id, "client-1");
        assert_eq!(message.sender_role, ParticipantRole::Client);
        assert_eq!(message.content, "hi");
        assert!(!message.is_read);
    }

    #[tokio::test]
    async fn typing_skips_the_sender() {
        let hub = hub();
        let (client, mut client_rx) = hub
            .connect(None, caller("client-1", ParticipantRole::Client))
            .await
            .expect("client");
        let (advisor, mut advisor_rx) = hub
            .connect(None, caller("advisor-1", ParticipantRole::Advisor))
            .await
            .expect("advisor");
        for connection in [&client, &advisor] {
            let (_, join) = invoke("JoinConversation", vec![json!("conv-42")]);
            hub.handle_text(connection, &join).await;
        }
        while client_rx.try_recv().is_ok() {}
        while advisor_rx.try_recv().is_ok() {}

        let (_, typing) = invoke("Typing", vec![json!("conv-42")]);
        hub.handle_text(&client, &typing).await;

        assert!(matches!(
            next_frame(&mut client_rx).payload,
            ServerFrame::Completion { error: None }
        ));
        assert!(client_rx.try_recv().is_err());
        assert!(matches!(
            next_frame(&mut advisor_rx).payload,
            ServerFrame::Push { ref target, .. } if target == "UserTyping"
        ));
    }

    #[tokio::test]
    async fn presence_follows_first_and_last_connection() {
        let hub = hub();
        let (watcher, mut watcher_rx) = hub
            .connect(None, caller("advisor-1", ParticipantRole::Advisor))
            .await
            .expect("watcher");
        handshake(&hub, &watcher).await;
        while watcher_rx.try_recv().is_ok() {}

        let client = caller("client-1", ParticipantRole::Client);
        let (first, _first_rx) = hub.connect(None, client.clone()).await.expect("first");
        assert!(!hub.is_online("client-1").await);
        handshake(&hub, &first).await;
        let (second, _second_rx) = hub.connect(None, client).await.expect("second");
        handshake(&hub, &second).await;
        handshake(&hub, &second).await;
        assert!(matches!(
            next_frame(&mut watcher_rx).payload,
            ServerFrame::Push { ref target, .. } if target == "UserOnline"
        ));
        assert!(watcher_rx.try_recv().is_err());

        hub.disconnect(&first).await;
        assert!(hub.is_online("client-1").await);
        assert!(watcher_rx.try_recv().is_err());

        hub.disconnect(&second).await;
        assert!(!hub.is_online("client-1").await);
        assert!(matches!(
            next_frame(&mut watcher_rx).payload,
            ServerFrame::Push { ref target, .. } if target == "UserOffline"
        ));
        hub.disconnect(&watcher).await;
    }

    #[tokio::test]
    async fn unknown_method_completes_with_error() {
        let hub = hub();
        let (id, mut rx) = hub
            .connect(None, caller("client-1", ParticipantRole::Client))
            .await
            .expect("open");

        let (_, text) = invoke("DeleteEverything", vec![]);
        hub.handle_text(&id, &text).await;
        assert!(matches!(
            next_frame(&mut rx).payload,
            ServerFrame::Completion { error: Some(_) }
        ));
    }
}
