//! Typed outbound calls.
//!
//! `send_message` and `join_conversation` surface failures to the caller.
//! The remaining calls are best-effort: while not connected they do nothing,
//! and failures are logged and swallowed.

use std::sync::Arc;

use fitchat_shared::{HubMethod, MessageType};

use crate::connection::HubConnection;
use crate::error::ChatError;

/// Issues hub methods over the shared connection.
#[derive(Debug, Clone)]
pub struct RemoteInvoker {
    connection: Arc<HubConnection>,
}

impl RemoteInvoker {
    pub fn new(connection: Arc<HubConnection>) -> Self {
        Self { connection }
    }

    /// Send a chat message. Fails with `NotConnected` unless connected.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), ChatError> {
        self.required(
            "send message",
            HubMethod::SendMessage {
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
                message_type,
            },
        )
        .await
    }

    /// [`send_message`](Self::send_message) with [`MessageType::Text`].
    pub async fn send_text(&self, conversation_id: &str, content: &str) -> Result<(), ChatError> {
        self.send_message(conversation_id, content, MessageType::Text)
            .await
    }

    pub async fn join_conversation(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.required(
            "join conversation",
            HubMethod::JoinConversation {
                conversation_id: conversation_id.to_string(),
            },
        )
        .await
    }

    pub async fn leave_conversation(&self, conversation_id: &str) {
        self.best_effort(HubMethod::LeaveConversation {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    pub async fn typing(&self, conversation_id: &str) {
        self.best_effort(HubMethod::Typing {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    pub async fn stop_typing(&self, conversation_id: &str) {
        self.best_effort(HubMethod::StopTyping {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    pub async fn mark_as_read(&self, conversation_id: &str) {
        self.best_effort(HubMethod::MarkAsRead {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    async fn required(&self, operation: &'static str, method: HubMethod) -> Result<(), ChatError> {
        if !self.connection.state().is_connected() {
            crate::log_warn!("Cannot {}: not connected", operation);
            return Err(ChatError::NotConnected { operation });
        }
        match self.connection.invoke(method).await {
            // Lost the race with a drop between the check and the send.
            Err(ChatError::NotConnected { .. }) => {
                crate::log_warn!("Cannot {}: not connected", operation);
                Err(ChatError::NotConnected { operation })
            }
            other => other,
        }
    }

    async fn best_effort(&self, method: HubMethod) {
        if !self.connection.state().is_connected() {
            crate::log_debug!("skipping {} while {:?}", method.target(), self.connection.state());
            return;
        }
        let target = method.target();
        match self.connection.invoke(method).await {
            Ok(()) | Err(ChatError::NotConnected { .. }) => {}
            Err(e) => crate::log_warn!("{} failed: {}", target, e),
        }
    }
}
