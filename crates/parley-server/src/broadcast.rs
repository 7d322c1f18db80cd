//! Room-wide message history.
//!
//! Append-only. Every append rewrites the `broadcast_history` document and
//! queues the fan-out while the write lock is held, so the on-disk order and
//! the order every connection receives both match the in-memory order. The
//! rewrite is a synchronous whole-document write on the async worker; appends
//! are serialized behind it. A failed write is logged and the in-memory
//! history stays authoritative.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use parley_shared::constants::DOC_BROADCAST_HISTORY;
use parley_shared::{BroadcastMessage, ConnectionId, ServerEvent, Username};
use parley_store::DocumentStore;

use crate::registry::{BindOutcome, ConnectionRegistry};

pub struct BroadcastLog {
    history: RwLock<Vec<BroadcastMessage>>,
    store: Arc<dyn DocumentStore>,
}

impl BroadcastLog {
    /// Load the history from `store`. A missing or unreadable document
    /// starts an empty history.
    pub fn load(store: Arc<dyn DocumentStore>) -> Self {
        let history = match store.load::<Vec<BroadcastMessage>>(DOC_BROADCAST_HISTORY) {
            Ok(Some(history)) => {
                info!(messages = history.len(), "Loaded broadcast history");
                history
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(error = %e, "Failed to load broadcast history, starting empty");
                Vec::new()
            }
        };

        Self {
            history: RwLock::new(history),
            store,
        }
    }

    /// Append, persist, then queue the message for every authenticated
    /// connection except `skip`. Returns how many connections accepted it.
    pub async fn append_and_broadcast(
        &self,
        message: BroadcastMessage,
        registry: &ConnectionRegistry,
        skip: Option<ConnectionId>,
    ) -> usize {
        let mut history = self.history.write().await;
        history.push(message.clone());
        self.persist(&history);
        registry.broadcast(&ServerEvent::from(message), skip).await
    }

    /// Bind `identity` to `conn`, announce the join to every other
    /// connection and replay the last `replay` messages to `conn`.
    ///
    /// All of it happens under the history write lock. A message appended
    /// concurrently either lands in the replay or reaches `conn` live after
    /// it, never both.
    pub async fn admit(
        &self,
        registry: &ConnectionRegistry,
        conn: ConnectionId,
        identity: &Username,
        replay: usize,
    ) -> BindOutcome {
        let mut history = self.history.write().await;
        let outcome = registry.bind(conn, identity.clone()).await;
        if outcome == BindOutcome::UnknownConnection {
            return outcome;
        }

        let joined = BroadcastMessage::system(format!("{identity} joined the chat"));
        history.push(joined.clone());
        self.persist(&history);
        registry.broadcast(&ServerEvent::from(joined), Some(conn)).await;

        let start = history.len().saturating_sub(replay);
        for message in &history[start..] {
            registry.send(conn, &ServerEvent::from(message.clone())).await;
        }
        outcome
    }

    /// The last `n` messages, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<BroadcastMessage> {
        let history = self.history.read().await;
        let start = history.len().saturating_sub(n);
        history[start..].to_vec()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    /// Write the current history again (used on shutdown).
    pub async fn flush(&self) {
        let history = self.history.read().await;
        self.persist(&history);
    }

    fn persist(&self, history: &[BroadcastMessage]) {
        if let Err(e) = self.store.save(DOC_BROADCAST_HISTORY, history) {
            error!(error = %e, backend = self.store.backend(), "Failed to save broadcast history");
        }
    }
}
