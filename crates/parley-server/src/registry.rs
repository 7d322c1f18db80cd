//! Live connections and the identities bound to them.
//!
//! Each connection owns a bounded outbound queue drained by its socket writer
//! task. Sending never awaits the socket: a full or closed queue is logged
//! and reported as `false`, so a slow or dead peer cannot stall the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use parley_shared::{ConnectionId, ServerEvent, Username};

#[derive(Debug)]
struct ConnectionEntry {
    tx: mpsc::Sender<String>,
    identity: Option<Username>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_identity: HashMap<Username, ConnectionId>,
}

/// Result of binding an identity to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// Bound. `superseded` is the connection that held the identity before
    /// and has now been unbound.
    Bound { superseded: Option<ConnectionId> },
    /// The connection closed before the bind happened.
    UnknownConnection,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an anonymous connection whose events go to `tx`.
    pub async fn register(&self, tx: mpsc::Sender<String>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut inner = self.inner.write().await;
        inner
            .connections
            .insert(id, ConnectionEntry { tx, identity: None });
        info!(conn = %id, connections = inner.connections.len(), "Connection registered");
        id
    }

    /// Remove a connection. Returns the identity it was bound to, if any.
    /// Unknown connections are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Username> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&id)?;
        let identity = entry.identity?;

        if inner.by_identity.get(&identity) == Some(&id) {
            inner.by_identity.remove(&identity);
        }
        info!(
            conn = %id,
            user = %identity,
            connections = inner.connections.len(),
            "Connection unregistered"
        );
        Some(identity)
    }

    /// Bind `identity` to `id`. The last login wins: a connection that held
    /// the same identity is unbound but stays open.
    pub async fn bind(&self, id: ConnectionId, identity: Username) -> BindOutcome {
        let mut inner = self.inner.write().await;
        let RegistryInner {
            connections,
            by_identity,
        } = &mut *inner;

        let Some(entry) = connections.get_mut(&id) else {
            return BindOutcome::UnknownConnection;
        };
        if let Some(previous) = entry.identity.replace(identity.clone()) {
            if previous != identity && by_identity.get(&previous) == Some(&id) {
                by_identity.remove(&previous);
            }
        }

        let superseded = by_identity
            .insert(identity.clone(), id)
            .filter(|old| *old != id);
        if let Some(old) = superseded {
            if let Some(old_entry) = connections.get_mut(&old) {
                old_entry.identity = None;
            }
            info!(user = %identity, old = %old, new = %id, "Identity rebound to newer connection");
        }

        BindOutcome::Bound { superseded }
    }

    pub async fn find_connection(&self, identity: &Username) -> Option<ConnectionId> {
        self.inner.read().await.by_identity.get(identity).copied()
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Option<Username> {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .and_then(|entry| entry.identity.clone())
    }

    /// Queue `event` for one connection. Returns whether it was queued.
    pub async fn send(&self, id: ConnectionId, event: &ServerEvent) -> bool {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound event");
                return false;
            }
        };

        let inner = self.inner.read().await;
        match inner.connections.get(&id) {
            Some(entry) => enqueue(id, &entry.tx, text),
            None => {
                debug!(conn = %id, "Dropping event for closed connection");
                false
            }
        }
    }

    /// Queue `event` for every authenticated connection except `skip`.
    /// Each queue is independent; returns how many accepted the event.
    pub async fn broadcast(&self, event: &ServerEvent, skip: Option<ConnectionId>) -> usize {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast event");
                return 0;
            }
        };

        let inner = self.inner.read().await;
        let mut delivered = 0;
        for (id, entry) in &inner.connections {
            if entry.identity.is_none() || Some(*id) == skip {
                continue;
            }
            if enqueue(*id, &entry.tx, text.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Connections that currently carry an identity.
    pub async fn bound_count(&self) -> usize {
        self.inner
            .read()
            .await
            .connections
            .values()
            .filter(|entry| entry.identity.is_some())
            .count()
    }

    /// Sorted usernames of everyone online.
    pub async fn online_users(&self) -> Vec<Username> {
        let mut users: Vec<Username> = self.inner.read().await.by_identity.keys().cloned().collect();
        users.sort();
        users
    }
}

fn enqueue(id: ConnectionId, tx: &mpsc::Sender<String>, text: String) -> bool {
    match tx.try_send(text) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(conn = %id, "Outbound queue full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(conn = %id, "Outbound queue closed, dropping event");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn test_register_bind_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = queue();

        let id = registry.register(tx).await;
        assert_eq!(registry.identity_of(id).await, None);
        assert_eq!(registry.bound_count().await, 0);

        let alice = Username::from("alice");
        assert_eq!(
            registry.bind(id, alice.clone()).await,
            BindOutcome::Bound { superseded: None }
        );
        assert_eq!(registry.find_connection(&alice).await, Some(id));
        assert_eq!(registry.bound_count().await, 1);

        assert_eq!(registry.unregister(id).await, Some(alice.clone()));
        assert_eq!(registry.find_connection(&alice).await, None);
        assert_eq!(registry.connection_count().await, 0);

        // Second unregister is a no-op.
        assert_eq!(registry.unregister(id).await, None);
    }

    #[tokio::test]
    async fn test_bind_unknown_connection() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.bind(ConnectionId(42), "alice".into()).await,
            BindOutcome::UnknownConnection
        );
        assert!(registry.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_last_login_wins() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = queue();
        let (tx2, _rx2) = queue();
        let first = registry.register(tx1).await;
        let second = registry.register(tx2).await;
        let alice = Username::from("alice");

        registry.bind(first, alice.clone()).await;
        assert_eq!(
            registry.bind(second, alice.clone()).await,
            BindOutcome::Bound {
                superseded: Some(first)
            }
        );

        assert_eq!(registry.find_connection(&alice).await, Some(second));
        assert_eq!(registry.identity_of(first).await, None);
        assert_eq!(registry.bound_count().await, 1);

        // The stale connection leaving must not release the live binding.
        assert_eq!(registry.unregister(first).await, None);
        assert_eq!(registry.find_connection(&alice).await, Some(second));
    }

    #[tokio::test]
    async fn test_bound_count_tracks_register_unregister_sequence() {
        let registry = ConnectionRegistry::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..6 {
            let (tx, rx) = queue();
            receivers.push(rx);
            let id = registry.register(tx).await;
            if i % 2 == 0 {
                registry.bind(id, Username::new(format!("user{i}"))).await;
            }
            ids.push(id);
        }
        assert_eq!(registry.connection_count().await, 6);
        assert_eq!(registry.bound_count().await, 3);

        registry.unregister(ids[0]).await;
        registry.unregister(ids[1]).await;
        registry.unregister(ids[1]).await;

        assert_eq!(registry.connection_count().await, 4);
        assert_eq!(registry.bound_count().await, 2);
        assert_eq!(
            registry.online_users().await,
            vec![Username::from("user2"), Username::from("user4")]
        );
    }

    #[tokio::test]
    async fn test_send_to_closed_queue_is_reported_not_raised() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = queue();
        let id = registry.register(tx).await;
        drop(rx);

        assert!(!registry.send(id, &ServerEvent::notice("hi")).await);
        assert!(!registry.send(ConnectionId(999), &ServerEvent::notice("hi")).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_authenticated_only_and_survives_dead_peers() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = queue();
        let (tx_b, rx_b) = queue();
        let (tx_anon, mut rx_anon) = queue();

        let a = registry.register(tx_a).await;
        let b = registry.register(tx_b).await;
        registry.register(tx_anon).await;
        registry.bind(a, "alice".into()).await;
        registry.bind(b, "bob".into()).await;
        drop(rx_b);

        let delivered = registry.broadcast(&ServerEvent::notice("hello"), None).await;
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_anon.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_connection() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = queue();
        let (tx_b, mut rx_b) = queue();
        let a = registry.register(tx_a).await;
        let b = registry.register(tx_b).await;
        registry.bind(a, "alice".into()).await;
        registry.bind(b, "bob".into()).await;

        assert_eq!(registry.broadcast(&ServerEvent::notice("x"), Some(a)).await, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
