//! Per-connection session state machine and event dispatch.
//!
//! A connection starts anonymous. A `login` with a token the identity
//! service accepts binds a username to it; from then on it may chat, send
//! private messages and manage its block list. Anything but `login` from an
//! anonymous connection is dropped without a reply.
//!
//! The router owns no durable state. It validates the sender, asks the
//! stores what to do and tells the registry whom to deliver to.
//!
//! Locks are always taken in the order admission, history, registry. Login
//! and private delivery both run under the admission lock, so a private
//! message reaches a user logging in either through the pending replay or
//! live, never both.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use parley_shared::constants::{BROADCAST_REPLAY_LIMIT, PRIVATE_HISTORY_LIMIT};
use parley_shared::{
    BroadcastMessage, ChatError, ClientEvent, ConnectionId, ContentFilter, MessageId,
    ServerEvent, Username,
};
use parley_store::DocumentStore;

use crate::broadcast::BroadcastLog;
use crate::conversations::ConversationStore;
use crate::moderation::ModerationStore;
use crate::registry::{BindOutcome, ConnectionRegistry};
use crate::verifier::IdentityVerifier;

/// How a stored private message reached its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's live connection.
    Delivered,
    /// Recipient offline; it will be replayed at their next login.
    StoredOffline,
}

/// What handling an event did. Mostly useful for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Authenticated(Username),
    AlreadyAuthenticated,
    Broadcast,
    Private { id: MessageId, delivery: Delivery },
    Replayed(usize),
    MarkedRead(usize),
    Recalled(MessageId),
    BlockListChanged(bool),
    /// Event was well-formed but carried nothing to act on.
    Ignored,
}

pub struct ChatRouter {
    registry: ConnectionRegistry,
    broadcasts: BroadcastLog,
    conversations: ConversationStore,
    moderation: Arc<ModerationStore>,
    filter: ContentFilter,
    verifier: Arc<dyn IdentityVerifier>,
    admission: Mutex<()>,
}

impl ChatRouter {
    /// Load all state from `store` and build the router.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        verifier: Arc<dyn IdentityVerifier>,
        filter: ContentFilter,
    ) -> Self {
        let moderation = Arc::new(ModerationStore::load(store.clone()));
        let conversations =
            ConversationStore::load(store.clone(), moderation.clone(), filter.clone());
        let broadcasts = BroadcastLog::load(store);

        Self {
            registry: ConnectionRegistry::new(),
            broadcasts,
            conversations,
            moderation,
            filter,
            verifier,
            admission: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn broadcasts(&self) -> &BroadcastLog {
        &self.broadcasts
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn moderation(&self) -> &ModerationStore {
        &self.moderation
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub async fn connect(&self, tx: mpsc::Sender<String>) -> ConnectionId {
        self.registry.register(tx).await
    }

    /// Transport went away. Announces the departure if the connection was
    /// logged in. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId) {
        if let Some(user) = self.registry.unregister(conn).await {
            self.broadcasts
                .append_and_broadcast(
                    BroadcastMessage::system(format!("{user} left the chat")),
                    &self.registry,
                    None,
                )
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle one raw text frame. Errors are logged and contained here.
    pub async fn handle_frame(&self, conn: ConnectionId, text: &str) {
        let event = match ClientEvent::from_json(text).map_err(ChatError::from) {
            Ok(event) => event,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Dropping frame");
                return;
            }
        };

        let kind = event.kind();
        match self.dispatch(conn, event).await {
            Ok(outcome) => debug!(conn = %conn, kind, ?outcome, "Event handled"),
            Err(ChatError::AuthRequired) => {
                debug!(conn = %conn, kind, "Dropping event from anonymous connection")
            }
            Err(e) => debug!(conn = %conn, kind, error = %e, "Event rejected"),
        }
    }

    pub async fn dispatch(
        &self,
        conn: ConnectionId,
        event: ClientEvent,
    ) -> Result<Outcome, ChatError> {
        if let ClientEvent::Login { token } = event {
            return self.login(conn, &token).await;
        }

        let user = self
            .registry
            .identity_of(conn)
            .await
            .ok_or(ChatError::AuthRequired)?;

        match event {
            ClientEvent::Login { .. } => Ok(Outcome::AlreadyAuthenticated),
            ClientEvent::Chat { content } => self.chat(&user, &content).await,
            ClientEvent::Private { to, content } => {
                self.private(conn, &user, &to, &content).await
            }
            ClientEvent::LoadPrivateHistory { with } => {
                self.load_private_history(conn, &user, &with).await
            }
            ClientEvent::MarkRead { from } => {
                if from.is_empty() {
                    return Ok(Outcome::Ignored);
                }
                let changed = self.conversations.mark_read(&user, &from).await;
                Ok(Outcome::MarkedRead(changed))
            }
            ClientEvent::Recall { message_id } => self.recall(&user, message_id).await,
            ClientEvent::BlockUser { username } => {
                self.set_blocked(conn, &user, &username, true).await
            }
            ClientEvent::UnblockUser { username } => {
                self.set_blocked(conn, &user, &username, false).await
            }
        }
    }

    async fn login(&self, conn: ConnectionId, token: &str) -> Result<Outcome, ChatError> {
        if self.registry.identity_of(conn).await.is_some() {
            return Ok(Outcome::AlreadyAuthenticated);
        }

        let user = match self.verifier.verify(token).await {
            Ok(user) => user,
            Err(e) => {
                info!(conn = %conn, "Login failed");
                self.registry
                    .send(conn, &ServerEvent::notice("authentication failed"))
                    .await;
                return Err(e);
            }
        };

        let _admission = self.admission.lock().await;

        // Everyone else hears about the join live; this connection sees it
        // as the newest entry of the replayed history.
        let outcome = self
            .broadcasts
            .admit(&self.registry, conn, &user, BROADCAST_REPLAY_LIMIT)
            .await;
        let superseded = match outcome {
            BindOutcome::Bound { superseded } => superseded,
            BindOutcome::UnknownConnection => {
                debug!(conn = %conn, user = %user, "Connection closed during login");
                return Ok(Outcome::Ignored);
            }
        };
        if let Some(old) = superseded {
            self.registry
                .send(
                    old,
                    &ServerEvent::notice("signed in from another connection"),
                )
                .await;
        }

        info!(conn = %conn, user = %user, "User logged in");

        for message in self
            .conversations
            .pending_for(&user, PRIVATE_HISTORY_LIMIT)
            .await
        {
            self.registry.send(conn, &ServerEvent::from(message)).await;
        }

        Ok(Outcome::Authenticated(user))
    }

    async fn chat(&self, user: &Username, content: &str) -> Result<Outcome, ChatError> {
        if content.is_empty() {
            return Ok(Outcome::Ignored);
        }
        let message = BroadcastMessage::chat(user.clone(), self.filter.apply(content));
        self.broadcasts
            .append_and_broadcast(message, &self.registry, None)
            .await;
        Ok(Outcome::Broadcast)
    }

    async fn private(
        &self,
        conn: ConnectionId,
        from: &Username,
        to: &Username,
        content: &str,
    ) -> Result<Outcome, ChatError> {
        if to.is_empty() || content.is_empty() {
            return Ok(Outcome::Ignored);
        }

        let _admission = self.admission.lock().await;
        let message = match self.conversations.send_private(from, to, content).await {
            Ok(message) => message,
            Err(e @ ChatError::Blocked { .. }) => {
                self.registry
                    .send(
                        conn,
                        &ServerEvent::notice(format!("message not delivered: {to} has blocked you")),
                    )
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let id = message.id;
        let event = ServerEvent::from(message);

        let delivery = match self.registry.find_connection(to).await {
            Some(target) => {
                self.registry.send(target, &event).await;
                if target != conn {
                    self.registry.send(conn, &event).await;
                }
                Delivery::Delivered
            }
            None => {
                self.registry.send(conn, &event).await;
                self.registry
                    .send(
                        conn,
                        &ServerEvent::notice(format!("message stored, {to} is offline")),
                    )
                    .await;
                Delivery::StoredOffline
            }
        };

        Ok(Outcome::Private { id, delivery })
    }

    async fn load_private_history(
        &self,
        conn: ConnectionId,
        user: &Username,
        with: &Username,
    ) -> Result<Outcome, ChatError> {
        if with.is_empty() {
            return Ok(Outcome::Ignored);
        }
        let history = self
            .conversations
            .history(user, with, PRIVATE_HISTORY_LIMIT)
            .await;
        let count = history.len();
        for message in history {
            self.registry.send(conn, &ServerEvent::from(message)).await;
        }
        Ok(Outcome::Replayed(count))
    }

    async fn recall(&self, user: &Username, message_id: MessageId) -> Result<Outcome, ChatError> {
        let recalled = self.conversations.recall(message_id, user).await?;

        let mut targets = BTreeSet::new();
        for participant in &recalled.notify {
            if let Some(conn) = self.registry.find_connection(participant).await {
                targets.insert(conn);
            }
        }

        let notice = ServerEvent::recall_notice(message_id);
        for conn in &targets {
            self.registry.send(*conn, &notice).await;
        }
        debug!(
            id = %message_id,
            recall_at = recalled.message.recall_at.as_deref().unwrap_or_default(),
            notified = targets.len(),
            "Recall notices sent"
        );
        Ok(Outcome::Recalled(message_id))
    }

    async fn set_blocked(
        &self,
        conn: ConnectionId,
        user: &Username,
        target: &Username,
        blocked: bool,
    ) -> Result<Outcome, ChatError> {
        if target.is_empty() {
            return Ok(Outcome::Ignored);
        }

        let (changed, confirmation) = if blocked {
            (
                self.moderation.block(user, target).await,
                format!("blocked {target}"),
            )
        } else {
            (
                self.moderation.unblock(user, target).await,
                format!("unblocked {target}"),
            )
        };
        self.registry
            .send(conn, &ServerEvent::notice(confirmation))
            .await;
        Ok(Outcome::BlockListChanged(changed))
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    /// Announce something to the whole room.
    pub async fn system_broadcast(&self, content: &str) -> usize {
        let message = BroadcastMessage::system(format!("System broadcast: {content}"));
        self.broadcasts
            .append_and_broadcast(message, &self.registry, None)
            .await
    }

    /// Write every document again.
    pub async fn flush(&self) {
        self.broadcasts.flush().await;
        self.conversations.flush().await;
        self.moderation.flush().await;
        info!("State flushed to storage");
    }
}
