use thiserror::Error;

use crate::types::{MessageId, Username};

/// Per-event routing failures. None of these is fatal: each one is contained
/// to the handling of a single inbound event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Event from a connection that has not logged in. Dropped.
    #[error("Authentication required")]
    AuthRequired,

    /// Token rejected by the identity service (or the service was unreachable).
    #[error("Authentication failed")]
    AuthFailed,

    /// The recipient has blocked the sender.
    #[error("{recipient} has blocked {sender}")]
    Blocked { sender: Username, recipient: Username },

    /// Recall of an unknown, foreign or already recalled message.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// Frame that is not a valid client event.
    #[error("Malformed event: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Malformed(e.to_string())
    }
}
