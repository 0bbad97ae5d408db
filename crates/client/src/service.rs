//! Service facade bundling the connection, invoker and router.
//!
//! Applications build one [`ChatServiceProvider`] at start-up, keep it in
//! their top-level context and call [`ChatServiceProvider::get`] wherever a
//! [`ChatService`] is needed. The service is created on first access and
//! every later `get` returns a handle to the same instance.

use std::sync::Arc;

use fitchat_shared::{ChatEvent, ChatEventKind, MessageType, TransportKind};
use once_cell::sync::OnceCell;

use crate::config::ChatConfig;
use crate::connection::{HubConnection, TokenProvider};
use crate::error::ChatError;
use crate::invoker::RemoteInvoker;
use crate::retry::{BackoffPolicy, ReconnectPolicy};
use crate::router::{ChatEventHandlers, EventRouter, Subscription};
use crate::state::{ConnectionState, StateChange};
use crate::transport::{Connector, HubConnector};

/// Handle to one chat connection. Clones share the same connection.
#[derive(Debug, Clone)]
pub struct ChatService {
    connection: Arc<HubConnection>,
    invoker: RemoteInvoker,
    router: Arc<EventRouter>,
}

/// Builder for a [`ChatService`] with non-default seams.
#[derive(Clone)]
pub struct ChatServiceBuilder {
    config: ChatConfig,
    connector: Option<Arc<dyn Connector>>,
    policy: Arc<dyn ReconnectPolicy>,
}

impl std::fmt::Debug for ChatServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServiceBuilder")
            .field("config", &self.config)
            .field("custom_connector", &self.connector.is_some())
            .finish_non_exhaustive()
    }
}

impl ChatServiceBuilder {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            connector: None,
            policy: Arc::new(BackoffPolicy::default()),
        }
    }

    /// Replace the negotiating network connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> ChatService {
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HubConnector::new(&self.config)),
        };
        let router = Arc::new(EventRouter::new());
        let connection = Arc::new(HubConnection::new(
            self.config,
            connector,
            self.policy,
            router.clone(),
        ));
        ChatService {
            invoker: RemoteInvoker::new(connection.clone()),
            connection,
            router,
        }
    }
}

impl ChatService {
    /// Service with the default connector and backoff policy.
    pub fn new(config: ChatConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ChatConfig) -> ChatServiceBuilder {
        ChatServiceBuilder::new(config)
    }

    /// Connect with a fixed access token.
    pub async fn start(&self, access_token: impl Into<String>) -> Result<(), ChatError> {
        let token = access_token.into();
        self.connection
            .start(Arc::new(move || Some(token.clone())))
            .await
    }

    /// Connect, pulling a fresh token on every attempt including reconnects.
    pub async fn start_with_token_provider<F>(&self, tokens: F) -> Result<(), ChatError>
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        let tokens: TokenProvider = Arc::new(tokens);
        self.connection.start(tokens).await
    }

    pub async fn stop(&self) {
        self.connection.stop().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.connection.transport()
    }

    pub fn config(&self) -> &ChatConfig {
        self.connection.config()
    }

    /// Register the single state observer, replacing any previous one.
    ///
    /// Runs synchronously on every transition, in order. It must not await
    /// `start` or `stop` itself; spawn a task for that.
    pub fn on_connection_state_change<F>(&self, observer: F)
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        self.connection.set_state_observer(Some(Arc::new(observer)));
    }

    pub fn clear_connection_state_observer(&self) {
        self.connection.set_state_observer(None);
    }

    /// Merge `handlers` into the handler table.
    pub fn set_event_handlers(&self, handlers: ChatEventHandlers) {
        self.router.set_handlers(handlers);
    }

    pub fn subscribe<F>(&self, kind: ChatEventKind, handler: F) -> Subscription
    where
        F: Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.router.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.router.unsubscribe(subscription)
    }

    pub fn invoker(&self) -> &RemoteInvoker {
        &self.invoker
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn connection(&self) -> &Arc<HubConnection> {
        &self.connection
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), ChatError> {
        self.invoker
            .send_message(conversation_id, content, message_type)
            .await
    }

    pub async fn join_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.invoker.join_conversation(conversation_id).await
    }

    pub async fn leave_conversation(&self, conversation_id: &str) {
        self.invoker.leave_conversation(conversation_id).await
    }

    pub async fn typing(&self, conversation_id: &str) {
        self.invoker.typing(conversation_id).await
    }

    pub async fn stop_typing(&self, conversation_id: &str) {
        self.invoker.stop_typing(conversation_id).await
    }

    pub async fn mark_as_read(&self, conversation_id: &str) {
        self.invoker.mark_as_read(conversation_id).await
    }
}

/// Lazily builds the one [`ChatService`] for an application.
#[derive(Debug)]
pub struct ChatServiceProvider {
    builder: ChatServiceBuilder,
    instance: OnceCell<ChatService>,
}

impl ChatServiceProvider {
    pub fn new(config: ChatConfig) -> Self {
        Self::from_builder(ChatService::builder(config))
    }

    pub fn from_builder(builder: ChatServiceBuilder) -> Self {
        Self {
            builder,
            instance: OnceCell::new(),
        }
    }

    /// The shared service, built on first call.
    pub fn get(&self) -> ChatService {
        self.instance
            .get_or_init(|| {
                crate::log_debug!("creating chat service for {}", self.builder.config.hub_url);
                self.builder.clone().build()
            })
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.instance.get().is_some()
    }
}
