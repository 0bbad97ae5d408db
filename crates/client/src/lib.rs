//! Fitchat Client - real-time chat connection manager
//!
//! Keeps one connection to the coaching platform's chat hub: connects with
//! a bearer token, negotiates a transport, reconnects with backoff after
//! drops, routes pushed events to handlers and invokes hub methods.

pub mod config;
pub mod connection;
pub mod error;
pub mod invoker;
pub mod logging;
pub mod retry;
pub mod router;
pub mod service;
pub mod state;
pub mod transport;

pub use config::ChatConfig;
pub use connection::{HubConnection, TokenProvider};
pub use error::{ChatError, TransportError};
pub use invoker::RemoteInvoker;
pub use logging::init_logging;
pub use retry::{BackoffPolicy, ReconnectPolicy, RetryContext};
pub use router::{ChatEventHandlers, EventHandler, EventRouter, Subscription};
pub use service::{ChatService, ChatServiceBuilder, ChatServiceProvider};
pub use state::{ConnectionState, StateChange, StateObserver};
pub use transport::{Connector, HubConnector, TransportChannel};

pub use fitchat_shared::{
    ChatEvent, ChatEventKind, ChatMessage, MessageType, ParticipantRole, PresenceEvent,
    ReadReceipt, TransportKind, TypingSignal,
};
