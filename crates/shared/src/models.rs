//! Chat payloads exchanged with the hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Messaging ---

/// Kind of content carried by a [`ChatMessage`].
///
/// Values the client does not know are kept verbatim in `Other` so a message
/// survives a round trip unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    #[serde(untagged)]
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Other(other) => other,
        }
    }
}

/// Role of a conversation participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    #[default]
    Client,
    Advisor,
    Admin,
    #[serde(untagged)]
    Other(String),
}

impl ParticipantRole {
    pub fn as_str(&self) -> &str {
        match self {
            ParticipantRole::Client => "client",
            ParticipantRole::Advisor => "advisor",
            ParticipantRole::Admin => "admin",
            ParticipantRole::Other(other) => other,
        }
    }

    /// Parse a role string, keeping unknown roles as `Other`.
    pub fn parse(role: &str) -> Self {
        match role {
            "client" => ParticipantRole::Client,
            "advisor" => ParticipantRole::Advisor,
            "admin" => ParticipantRole::Admin,
            other => ParticipantRole::Other(other.to_string()),
        }
    }
}

/// A chat message as pushed by the hub.
///
/// Every field is required on the wire except `attachmentUrl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_role: ParticipantRole,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

// --- Signals ---

/// Point-in-time presence signal for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    /// Only `UserOnline` carries a role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<ParticipantRole>,
    pub online: bool,
}

/// Typing start/stop signal. Stop signals carry no user name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// `user_id` has read everything in `conversation_id` up to now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: String,
    pub user_id: String,
}
