use serde::{Deserialize, Serialize};

use crate::types::{local_timestamp, MessageId, Username};

// ---------------------------------------------------------------------------
// Stored models
// ---------------------------------------------------------------------------

/// A room-wide message. Immutable once appended to the broadcast log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// Message typed by a user.
    Chat {
        username: Username,
        content: String,
        timestamp: String,
    },
    /// Join/leave notices and operator broadcasts. No author.
    System { content: String, timestamp: String },
}

impl BroadcastMessage {
    pub fn chat(username: Username, content: impl Into<String>) -> Self {
        Self::Chat {
            username,
            content: content.into(),
            timestamp: local_timestamp(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
            timestamp: local_timestamp(),
        }
    }

    pub fn author(&self) -> Option<&Username> {
        match self {
            Self::Chat { username, .. } => Some(username),
            Self::System { .. } => None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Chat { content, .. } | Self::System { content, .. } => content,
        }
    }
}

/// Lifecycle of a private message. Moves forward only:
/// `sent -> read`, `sent -> recalled`, `read -> recalled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Read,
    Recalled,
}

/// A one-to-one message. Content never changes after creation; only the
/// status and its matching timestamp do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: MessageId,
    pub from: Username,
    pub to: Username,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_at: Option<String>,
}

impl PrivateMessage {
    /// New message in status `sent` with a fresh id.
    pub fn new(from: Username, to: Username, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            from,
            to,
            content: content.into(),
            status: MessageStatus::Sent,
            timestamp: local_timestamp(),
            read_at: None,
            recall_at: None,
        }
    }

    /// `sent -> read`. Returns `false` (and changes nothing) from any other status.
    pub fn mark_read(&mut self, at: &str) -> bool {
        if self.status != MessageStatus::Sent {
            return false;
        }
        self.status = MessageStatus::Read;
        self.read_at = Some(at.to_string());
        true
    }

    /// Moves to `recalled`. Returns `false` if it already was.
    pub fn recall(&mut self, at: &str) -> bool {
        if self.status == MessageStatus::Recalled {
            return false;
        }
        self.status = MessageStatus::Recalled;
        self.recall_at = Some(at.to_string());
        true
    }
}

// ---------------------------------------------------------------------------
// Wire events
// ---------------------------------------------------------------------------

/// Events a client may send. One JSON object per frame, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Login { token: String },
    Chat { content: String },
    Private { to: Username, content: String },
    LoadPrivateHistory { with: Username },
    MarkRead { from: Username },
    Recall { message_id: MessageId },
    BlockUser { username: Username },
    UnblockUser { username: Username },
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Chat { .. } => "chat",
            Self::Private { .. } => "private",
            Self::LoadPrivateHistory { .. } => "load_private_history",
            Self::MarkRead { .. } => "mark_read",
            Self::Recall { .. } => "recall",
            Self::BlockUser { .. } => "block_user",
            Self::UnblockUser { .. } => "unblock_user",
        }
    }
}

/// Events the server pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Chat {
        username: Username,
        content: String,
        timestamp: String,
    },
    System {
        content: String,
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    Private(PrivateMessage),
}

impl ServerEvent {
    /// A system notice addressed to one connection.
    pub fn notice(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
            timestamp: local_timestamp(),
            message_id: None,
        }
    }

    /// Tells a participant that a private message was withdrawn.
    pub fn recall_notice(message_id: MessageId) -> Self {
        Self::System {
            content: "message recalled".to_string(),
            timestamp: local_timestamp(),
            message_id: Some(message_id),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<BroadcastMessage> for ServerEvent {
    fn from(message: BroadcastMessage) -> Self {
        match message {
            BroadcastMessage::Chat {
                username,
                content,
                timestamp,
            } => Self::Chat {
                username,
                content,
                timestamp,
            },
            BroadcastMessage::System { content, timestamp } => Self::System {
                content,
                timestamp,
                message_id: None,
            },
        }
    }
}

impl From<PrivateMessage> for ServerEvent {
    fn from(message: PrivateMessage) -> Self {
        Self::Private(message)
    }
}
