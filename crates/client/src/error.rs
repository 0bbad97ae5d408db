//! Client error types.

use fitchat_shared::{ProtocolError, TransportKind};
use thiserror::Error;

use crate::state::ConnectionState;

/// Failures opening or running one physical channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid hub url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("access token is not a valid header value")]
    InvalidToken,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub answered {status} to {operation}")]
    UnexpectedStatus { operation: &'static str, status: u16 },
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("no usable transport (client wants {wanted:?}, hub offers {offered:?})")]
    NoTransport {
        wanted: Vec<TransportKind>,
        offered: Vec<TransportKind>,
    },
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("channel closed{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed(Option<String>),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors surfaced by the chat service to its callers.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not connected: cannot {operation}")]
    NotConnected { operation: &'static str },
    #[error("access token unavailable")]
    TokenUnavailable,
    #[error("failed to connect: {0}")]
    Connect(#[from] TransportError),
    #[error("hub rejected {target}: {message}")]
    Invocation { target: String, message: String },
    #[error("connection lost before the call completed")]
    ConnectionLost,
    #[error("connection stopped while starting")]
    Stopped,
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChatError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ChatError::NotConnected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_closed_reason_when_present() {
        assert_eq!(TransportError::Closed(None).to_string(), "channel closed");
        assert_eq!(
            TransportError::Closed(Some("server restart".into())).to_string(),
            "channel closed: server restart"
        );
    }

    #[test]
    fn names_operation_in_not_connected() {
        let err = ChatError::NotConnected {
            operation: "send message",
        };
        assert!(err.is_not_connected());
        assert_eq!(err.to_string(), "not connected: cannot send message");
    }
}
