//! Hub wire protocol: frame envelope, frame kinds, negotiation and the typed
//! method/event sets carried inside invocation frames.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::models::{ChatMessage, MessageType, ParticipantRole, PresenceEvent, ReadReceipt, TypingSignal};

/// Protocol name announced in the handshake.
pub const PROTOCOL_NAME: &str = "json";
/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Outbound hub method names.
pub mod methods {
    pub const SEND_MESSAGE: &str = "SendMessage";
    pub const JOIN_CONVERSATION: &str = "JoinConversation";
    pub const LEAVE_CONVERSATION: &str = "LeaveConversation";
    pub const TYPING: &str = "Typing";
    pub const STOP_TYPING: &str = "StopTyping";
    pub const MARK_AS_READ: &str = "MarkAsRead";
}

/// Inbound push event names.
pub mod events {
    pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
    pub const USER_ONLINE: &str = "UserOnline";
    pub const USER_OFFLINE: &str = "UserOffline";
    pub const USER_TYPING: &str = "UserTyping";
    pub const USER_STOPPED_TYPING: &str = "UserStoppedTyping";
    pub const MESSAGES_READ: &str = "MessagesRead";
}

// --- Envelope ---

/// Envelope wrapping every frame on every transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HubEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> HubEnvelope<T> {
    /// Wrap a payload in a fresh envelope.
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    /// Wrap a payload answering the frame with id `correlation_id`.
    pub fn reply_to(correlation_id: impl Into<String>, payload: T) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::new(payload)
        }
    }
}

impl<T: Serialize> HubEnvelope<T> {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl<T: for<'de> Deserialize<'de>> HubEnvelope<T> {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    Handshake { protocol: String, version: u32 },
    /// Remote call; the envelope id is the invocation id.
    Invoke { target: String, arguments: Vec<Value> },
    Ping,
}

impl ClientFrame {
    pub fn handshake() -> Self {
        ClientFrame::Handshake {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// Frames sent by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    Handshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Server-initiated event for the client's handlers.
    Push { target: String, arguments: Vec<Value> },
    /// Result of an invocation, correlated through the envelope.
    Completion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, rename = "allowReconnect")]
        allow_reconnect: bool,
    },
}

// --- Negotiation ---

/// Transports a hub can offer, richest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSockets,
    LongPolling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::LongPolling => "LongPolling",
        }
    }

    /// Parse a transport name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "websockets" | "websocket" | "ws" => Some(TransportKind::WebSockets),
            "longpolling" | "long-polling" | "longpoll" => Some(TransportKind::LongPolling),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of the `negotiate` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: String,
    pub available_transports: Vec<TransportKind>,
}

// --- Typed methods ---

/// Outbound hub methods with their positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMethod {
    SendMessage {
        conversation_id: String,
        content: String,
        message_type: MessageType,
    },
    JoinConversation { conversation_id: String },
    LeaveConversation { conversation_id: String },
    Typing { conversation_id: String },
    StopTyping { conversation_id: String },
    MarkAsRead { conversation_id: String },
}

impl HubMethod {
    pub fn target(&self) -> &'static str {
        match self {
            HubMethod::SendMessage { .. } => methods::SEND_MESSAGE,
            HubMethod::JoinConversation { .. } => methods::JOIN_CONVERSATION,
            HubMethod::LeaveConversation { .. } => methods::LEAVE_CONVERSATION,
            HubMethod::Typing { .. } => methods::TYPING,
            HubMethod::StopTyping { .. } => methods::STOP_TYPING,
            HubMethod::MarkAsRead { .. } => methods::MARK_AS_READ,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            HubMethod::SendMessage { conversation_id, .. }
            | HubMethod::JoinConversation { conversation_id }
            | HubMethod::LeaveConversation { conversation_id }
            | HubMethod::Typing { conversation_id }
            | HubMethod::StopTyping { conversation_id }
            | HubMethod::MarkAsRead { conversation_id } => conversation_id,
        }
    }

    pub fn arguments(&self) -> Vec<Value> {
        match self {
            HubMethod::SendMessage {
                conversation_id,
                content,
                message_type,
            } => vec![
                Value::from(conversation_id.as_str()),
                Value::from(content.as_str()),
                Value::from(message_type.as_str()),
            ],
            other => vec![Value::from(other.conversation_id())],
        }
    }

    /// Build the `invoke` frame for this method.
    pub fn into_frame(self) -> ClientFrame {
        ClientFrame::Invoke {
            target: self.target().to_string(),
            arguments: self.arguments(),
        }
    }

    /// Decode an `invoke` frame received by the hub.
    pub fn from_invocation(target: &str, arguments: &[Value]) -> Result<Self, ProtocolError> {
        let args = Arguments::new(target, arguments);
        let method = match target {
            methods::SEND_MESSAGE => HubMethod::SendMessage {
                conversation_id: args.string(0)?,
                content: args.string(1)?,
                message_type: args
                    .optional_string(2)?
                    .map(|kind| MessageType::from(kind.as_str()))
                    .unwrap_or_default(),
            },
            methods::JOIN_CONVERSATION => HubMethod::JoinConversation {
                conversation_id: args.string(0)?,
            },
            methods::LEAVE_CONVERSATION => HubMethod::LeaveConversation {
                conversation_id: args.string(0)?,
            },
            methods::TYPING => HubMethod::Typing {
                conversation_id: args.string(0)?,
            },
            methods::STOP_TYPING => HubMethod::StopTyping {
                conversation_id: args.string(0)?,
            },
            methods::MARK_AS_READ => HubMethod::MarkAsRead {
                conversation_id: args.string(0)?,
            },
            other => return Err(ProtocolError::UnknownTarget(other.to_string())),
        };
        Ok(method)
    }
}

impl From<&str> for MessageType {
    fn from(kind: &str) -> Self {
        match kind {
            "text" => MessageType::Text,
            "image" => MessageType::Image,
            "file" => MessageType::File,
            other => MessageType::Other(other.to_string()),
        }
    }
}

// --- Typed events ---

/// Discriminant of [`ChatEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatEventKind {
    ReceiveMessage,
    UserOnline,
    UserOffline,
    UserTyping,
    UserStoppedTyping,
    MessagesRead,
}

impl ChatEventKind {
    pub const ALL: [ChatEventKind; 6] = [
        ChatEventKind::ReceiveMessage,
        ChatEventKind::UserOnline,
        ChatEventKind::UserOffline,
        ChatEventKind::UserTyping,
        ChatEventKind::UserStoppedTyping,
        ChatEventKind::MessagesRead,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChatEventKind::ReceiveMessage => events::RECEIVE_MESSAGE,
            ChatEventKind::UserOnline => events::USER_ONLINE,
            ChatEventKind::UserOffline => events::USER_OFFLINE,
            ChatEventKind::UserTyping => events::USER_TYPING,
            ChatEventKind::UserStoppedTyping => events::USER_STOPPED_TYPING,
            ChatEventKind::MessagesRead => events::MESSAGES_READ,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ChatEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inbound push events, decoded from `push` frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ReceiveMessage(ChatMessage),
    UserOnline(PresenceEvent),
    UserOffline(PresenceEvent),
    UserTyping(TypingSignal),
    UserStoppedTyping(TypingSignal),
    MessagesRead(ReadReceipt),
}

impl ChatEvent {
    pub fn kind(&self) -> ChatEventKind {
        match self {
            ChatEvent::ReceiveMessage(_) => ChatEventKind::ReceiveMessage,
            ChatEvent::UserOnline(_) => ChatEventKind::UserOnline,
            ChatEvent::UserOffline(_) => ChatEventKind::UserOffline,
            ChatEvent::UserTyping(_) => ChatEventKind::UserTyping,
            ChatEvent::UserStoppedTyping(_) => ChatEventKind::UserStoppedTyping,
            ChatEvent::MessagesRead(_) => ChatEventKind::MessagesRead,
        }
    }

    /// Positional arguments as sent on the wire.
    pub fn arguments(&self) -> Result<Vec<Value>, ProtocolError> {
        let args = match self {
            ChatEvent::ReceiveMessage(message) => {
                vec![serde_json::to_value(message).map_err(ProtocolError::Encode)?]
            }
            ChatEvent::UserOnline(presence) => vec![
                Value::from(presence.user_id.as_str()),
                Value::from(
                    presence
                        .user_role
                        .as_ref()
                        .map(ParticipantRole::as_str)
                        .unwrap_or_default(),
                ),
            ],
            ChatEvent::UserOffline(presence) => vec![Value::from(presence.user_id.as_str())],
            ChatEvent::UserTyping(signal) => vec![
                Value::from(signal.conversation_id.as_str()),
                Value::from(signal.user_id.as_str()),
                signal
                    .user_name
                    .as_deref()
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            ],
            ChatEvent::UserStoppedTyping(signal) => vec![
                Value::from(signal.conversation_id.as_str()),
                Value::from(signal.user_id.as_str()),
            ],
            ChatEvent::MessagesRead(receipt) => vec![
                Value::from(receipt.conversation_id.as_str()),
                Value::from(receipt.user_id.as_str()),
            ],
        };
        Ok(args)
    }

    /// Build the `push` frame for this event.
    pub fn to_frame(&self) -> Result<ServerFrame, ProtocolError> {
        Ok(ServerFrame::Push {
            target: self.kind().name().to_string(),
            arguments: self.arguments()?,
        })
    }

    /// Decode a `push` frame received by the client.
    pub fn from_push(target: &str, arguments: &[Value]) -> Result<Self, ProtocolError> {
        let kind = ChatEventKind::from_name(target)
            .ok_or_else(|| ProtocolError::UnknownTarget(target.to_string()))?;
        let args = Arguments::new(target, arguments);

        let event = match kind {
            ChatEventKind::ReceiveMessage => ChatEvent::ReceiveMessage(args.object(0)?),
            ChatEventKind::UserOnline => ChatEvent::UserOnline(PresenceEvent {
                user_id: args.string(0)?,
                user_role: args
                    .optional_string(1)?
                    .filter(|role| !role.is_empty())
                    .map(|role| ParticipantRole::parse(&role)),
                online: true,
            }),
            ChatEventKind::UserOffline => ChatEvent::UserOffline(PresenceEvent {
                user_id: args.string(0)?,
                user_role: None,
                online: false,
            }),
            ChatEventKind::UserTyping => ChatEvent::UserTyping(TypingSignal {
                conversation_id: args.string(0)?,
                user_id: args.string(1)?,
                user_name: args.optional_string(2)?.filter(|name| !name.is_empty()),
            }),
            ChatEventKind::UserStoppedTyping => ChatEvent::UserStoppedTyping(TypingSignal {
                conversation_id: args.string(0)?,
                user_id: args.string(1)?,
                user_name: None,
            }),
            ChatEventKind::MessagesRead => ChatEvent::MessagesRead(ReadReceipt {
                conversation_id: args.string(0)?,
                user_id: args.string(1)?,
            }),
        };
        Ok(event)
    }
}

/// Positional argument reader with target-aware errors.
struct Arguments<'a> {
    target: &'a str,
    values: &'a [Value],
}

impl<'a> Arguments<'a> {
    fn new(target: &'a str, values: &'a [Value]) -> Self {
        Self { target, values }
    }

    fn bad(&self, index: usize, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::BadArguments {
            target: self.target.to_string(),
            index,
            reason: reason.into(),
        }
    }

    fn string(&self, index: usize) -> Result<String, ProtocolError> {
        self.optional_string(index)?
            .ok_or_else(|| self.bad(index, "missing string argument"))
    }

    fn optional_string(&self, index: usize) -> Result<Option<String>, ProtocolError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.bad(index, format!("expected string, got {other}"))),
        }
    }

    fn object<T: for<'de> Deserialize<'de>>(&self, index: usize) -> Result<T, ProtocolError> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| self.bad(index, "missing object argument"))?;
        T::deserialize(value).map_err(|e| self.bad(index, e.to_string()))
    }
}
