//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding hub frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error("bad argument {index} for '{target}': {reason}")]
    BadArguments {
        target: String,
        index: usize,
        reason: String,
    },
}

impl ProtocolError {
    /// Whether the frame was well-formed but named something this side
    /// does not handle.
    pub fn is_unknown_target(&self) -> bool {
        matches!(self, ProtocolError::UnknownTarget(_))
    }
}
