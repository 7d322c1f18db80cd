//! Private message threads, unread counters and read/recall state.
//!
//! A thread is keyed by the unordered pair of its participants and holds a
//! single copy of each message, so "alice's view" and "bob's view" of a
//! message are the same record and cannot disagree. An id index finds the
//! thread of a message for recall.
//!
//! Two documents back this store: `private_threads` and `unread_counters`.
//! Both are rewritten under the write lock after each mutation, synchronously
//! on the calling worker, so writes land in mutation order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use parley_shared::constants::{DOC_PRIVATE_THREADS, DOC_UNREAD_COUNTERS};
use parley_shared::{
    local_timestamp, ChatError, ContentFilter, MessageId, MessageStatus, PrivateMessage, Username,
};
use parley_store::DocumentStore;

use crate::moderation::ModerationStore;

/// Unordered pair of participants. `ThreadKey::new(a, b) == ThreadKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(Username, Username);

impl ThreadKey {
    pub fn new(a: &Username, b: &Username) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn participants(&self) -> [&Username; 2] {
        [&self.0, &self.1]
    }

    pub fn involves(&self, user: &Username) -> bool {
        &self.0 == user || &self.1 == user
    }
}

/// On-disk form of one thread.
#[derive(Debug, Serialize, Deserialize)]
struct ThreadRecord {
    participants: [Username; 2],
    messages: Vec<PrivateMessage>,
}

/// recipient -> sender -> count
type UnreadCounters = BTreeMap<Username, BTreeMap<Username, u64>>;

#[derive(Debug, Default)]
struct Threads {
    threads: BTreeMap<ThreadKey, Vec<PrivateMessage>>,
    index: HashMap<MessageId, ThreadKey>,
    unread: UnreadCounters,
}

impl Threads {
    fn from_records(records: Vec<ThreadRecord>, unread: UnreadCounters) -> Self {
        let mut state = Self {
            unread,
            ..Self::default()
        };
        for record in records {
            let [a, b] = &record.participants;
            let key = ThreadKey::new(a, b);
            for message in &record.messages {
                state.index.insert(message.id, key.clone());
            }
            state
                .threads
                .entry(key)
                .or_default()
                .extend(record.messages);
        }
        state
    }

    fn to_records(&self) -> Vec<ThreadRecord> {
        self.threads
            .iter()
            .map(|(key, messages)| ThreadRecord {
                participants: [key.0.clone(), key.1.clone()],
                messages: messages.clone(),
            })
            .collect()
    }
}

/// A successful recall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recalled {
    /// The message as it now reads (status `recalled`).
    pub message: PrivateMessage,
    /// Both participants of the thread.
    pub notify: [Username; 2],
}

pub struct ConversationStore {
    state: RwLock<Threads>,
    store: Arc<dyn DocumentStore>,
    moderation: Arc<ModerationStore>,
    filter: ContentFilter,
}

impl ConversationStore {
    pub fn load(
        store: Arc<dyn DocumentStore>,
        moderation: Arc<ModerationStore>,
        filter: ContentFilter,
    ) -> Self {
        let records = match store.load::<Vec<ThreadRecord>>(DOC_PRIVATE_THREADS) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "Failed to load private threads, starting empty");
                Vec::new()
            }
        };
        let unread = match store.load::<UnreadCounters>(DOC_UNREAD_COUNTERS) {
            Ok(unread) => unread.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "Failed to load unread counters, starting empty");
                UnreadCounters::new()
            }
        };

        let state = Threads::from_records(records, unread);
        info!(
            threads = state.threads.len(),
            messages = state.index.len(),
            "Loaded private threads"
        );

        Self {
            state: RwLock::new(state),
            store,
            moderation,
            filter,
        }
    }

    /// Store a new private message from `from` to `to`.
    ///
    /// Rejected with [`ChatError::Blocked`] if `to` has blocked `from`.
    /// Otherwise the content is filtered, the message is appended in status
    /// `sent`, `to`'s unread counter for `from` goes up by one, and the
    /// stored message is returned. Delivery is up to the caller.
    pub async fn send_private(
        &self,
        from: &Username,
        to: &Username,
        content: &str,
    ) -> Result<PrivateMessage, ChatError> {
        if self.moderation.is_blocked(to, from).await {
            debug!(from = %from, to = %to, "Private message rejected: blocked");
            return Err(ChatError::Blocked {
                sender: from.clone(),
                recipient: to.clone(),
            });
        }

        let message = PrivateMessage::new(from.clone(), to.clone(), self.filter.apply(content));
        let key = ThreadKey::new(from, to);

        let mut state = self.state.write().await;
        state.index.insert(message.id, key.clone());
        state.threads.entry(key).or_default().push(message.clone());
        *state
            .unread
            .entry(to.clone())
            .or_default()
            .entry(from.clone())
            .or_default() += 1;

        self.persist_threads(&state);
        self.persist_unread(&state);

        debug!(id = %message.id, from = %from, to = %to, "Private message stored");
        Ok(message)
    }

    /// `user` has read the conversation with `from`: reset the unread
    /// counter and move every `sent` message of the thread to `read`.
    /// Returns how many messages changed status.
    pub async fn mark_read(&self, user: &Username, from: &Username) -> usize {
        let now = local_timestamp();
        let mut state = self.state.write().await;

        if let Some(count) = state
            .unread
            .get_mut(user)
            .and_then(|counters| counters.get_mut(from))
        {
            *count = 0;
        }

        let mut changed = 0;
        if let Some(messages) = state.threads.get_mut(&ThreadKey::new(user, from)) {
            for message in messages.iter_mut() {
                if message.mark_read(&now) {
                    changed += 1;
                }
            }
        }

        self.persist_threads(&state);
        self.persist_unread(&state);

        debug!(user = %user, from = %from, changed, "Conversation marked read");
        changed
    }

    /// Withdraw a message. Only its sender may do so, whatever its current
    /// status, and only once.
    pub async fn recall(
        &self,
        message_id: MessageId,
        requester: &Username,
    ) -> Result<Recalled, ChatError> {
        let now = local_timestamp();
        let mut state = self.state.write().await;

        let Some(key) = state.index.get(&message_id).cloned() else {
            return Err(ChatError::NotFound(message_id));
        };
        let message = state
            .threads
            .get_mut(&key)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .filter(|m| &m.from == requester)
            .ok_or(ChatError::NotFound(message_id))?;

        if !message.recall(&now) {
            return Err(ChatError::NotFound(message_id));
        }
        let message = message.clone();

        self.persist_threads(&state);

        info!(id = %message_id, by = %requester, "Private message recalled");
        let [a, b] = key.participants();
        Ok(Recalled {
            message,
            notify: [a.clone(), b.clone()],
        })
    }

    /// The most recent `limit` messages between two users, oldest first.
    pub async fn history(
        &self,
        user1: &Username,
        user2: &Username,
        limit: usize,
    ) -> Vec<PrivateMessage> {
        let state = self.state.read().await;
        state
            .threads
            .get(&ThreadKey::new(user1, user2))
            .map(|messages| tail(messages, limit).to_vec())
            .unwrap_or_default()
    }

    /// Messages addressed to `user` that are still `sent`, looking only at
    /// the last `per_thread` messages of each of `user`'s threads.
    pub async fn pending_for(&self, user: &Username, per_thread: usize) -> Vec<PrivateMessage> {
        let state = self.state.read().await;
        state
            .threads
            .iter()
            .filter(|(key, _)| key.involves(user))
            .flat_map(|(_, messages)| tail(messages, per_thread))
            .filter(|m| &m.to == user && m.status == MessageStatus::Sent)
            .cloned()
            .collect()
    }

    pub async fn unread_count(&self, user: &Username, from: &Username) -> u64 {
        self.state
            .read()
            .await
            .unread
            .get(user)
            .and_then(|counters| counters.get(from))
            .copied()
            .unwrap_or(0)
    }

    /// Non-zero unread counters of `user`, keyed by sender.
    pub async fn unread_counts(&self, user: &Username) -> BTreeMap<Username, u64> {
        self.state
            .read()
            .await
            .unread
            .get(user)
            .map(|counters| {
                counters
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(from, count)| (from.clone(), *count))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn flush(&self) {
        let state = self.state.read().await;
        self.persist_threads(&state);
        self.persist_unread(&state);
    }

    fn persist_threads(&self, state: &Threads) {
        if let Err(e) = self.store.save(DOC_PRIVATE_THREADS, &state.to_records()) {
            error!(error = %e, backend = self.store.backend(), "Failed to save private threads");
        }
    }

    fn persist_unread(&self, state: &Threads) {
        if let Err(e) = self.store.save(DOC_UNREAD_COUNTERS, &state.unread) {
            error!(error = %e, backend = self.store.backend(), "Failed to save unread counters");
        }
    }
}

fn tail(messages: &[PrivateMessage], n: usize) -> &[PrivateMessage] {
    &messages[messages.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::MemoryStore;

    struct Fixture {
        store: Arc<dyn DocumentStore>,
        moderation: Arc<ModerationStore>,
        conversations: ConversationStore,
    }

    fn fixture_with(store: Arc<dyn DocumentStore>, filter: ContentFilter) -> Fixture {
        let moderation = Arc::new(ModerationStore::load(store.clone()));
        let conversations = ConversationStore::load(store.clone(), moderation.clone(), filter);
        Fixture {
            store,
            moderation,
            conversations,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), ContentFilter::default())
    }

    fn alice() -> Username {
        Username::from("alice")
    }

    fn bob() -> Username {
        Username::from("bob")
    }

    #[test]
    fn test_thread_key_is_unordered() {
        assert_eq!(ThreadKey::new(&alice(), &bob()), ThreadKey::new(&bob(), &alice()));
        assert!(ThreadKey::new(&alice(), &bob()).involves(&bob()));
        assert!(!ThreadKey::new(&alice(), &bob()).involves(&Username::from("eve")));
    }

    #[tokio::test]
    async fn test_send_private_stores_and_counts_unread() {
        let f = fixture();
        let msg = f
            .conversations
            .send_private(&alice(), &bob(), "hi bob")
            .await
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.from, alice());
        assert_eq!(msg.to, bob());
        assert_eq!(f.conversations.unread_count(&bob(), &alice()).await, 1);
        assert_eq!(f.conversations.unread_count(&alice(), &bob()).await, 0);

        // Same record from both sides.
        let from_alice = f.conversations.history(&alice(), &bob(), 50).await;
        let from_bob = f.conversations.history(&bob(), &alice(), 50).await;
        assert_eq!(from_alice, vec![msg.clone()]);
        assert_eq!(from_alice, from_bob);
    }

    #[tokio::test]
    async fn test_send_private_filters_content() {
        let f = fixture_with(Arc::new(MemoryStore::new()), ContentFilter::new(["foo"]));
        let msg = f
            .conversations
            .send_private(&alice(), &bob(), "foo you")
            .await
            .unwrap();
        assert_eq!(msg.content, "*** you");
        assert_eq!(f.conversations.history(&bob(), &alice(), 1).await[0].content, "*** you");
    }

    #[tokio::test]
    async fn test_blocking_is_directional() {
        let f = fixture();
        f.moderation.block(&alice(), &bob()).await;

        let err = f
            .conversations
            .send_private(&bob(), &alice(), "let me in")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChatError::Blocked {
                sender: bob(),
                recipient: alice()
            }
        );
        assert!(f.conversations.history(&alice(), &bob(), 50).await.is_empty());
        assert_eq!(f.conversations.unread_count(&alice(), &bob()).await, 0);

        assert!(f
            .conversations
            .send_private(&alice(), &bob(), "you can still hear me")
            .await
            .is_ok());

        f.moderation.block(&bob(), &alice()).await;
        assert!(f
            .conversations
            .send_private(&alice(), &bob(), "and now?")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mark_read_leaves_no_sent_messages() {
        let f = fixture();
        for i in 0..3 {
            f.conversations
                .send_private(&alice(), &bob(), &format!("a{i}"))
                .await
                .unwrap();
        }
        f.conversations
            .send_private(&bob(), &alice(), "b0")
            .await
            .unwrap();

        let changed = f.conversations.mark_read(&bob(), &alice()).await;
        assert_eq!(changed, 4);
        assert_eq!(f.conversations.unread_count(&bob(), &alice()).await, 0);

        let history = f.conversations.history(&bob(), &alice(), 50).await;
        assert!(history.iter().all(|m| m.status != MessageStatus::Sent));
        assert!(history.iter().all(|m| m.read_at.is_some()));

        // Nothing left to change.
        assert_eq!(f.conversations.mark_read(&bob(), &alice()).await, 0);
    }

    #[tokio::test]
    async fn test_mark_read_on_empty_thread() {
        let f = fixture();
        assert_eq!(f.conversations.mark_read(&bob(), &alice()).await, 0);
    }

    #[tokio::test]
    async fn test_recall_requires_ownership() {
        let f = fixture();
        let msg = f
            .conversations
            .send_private(&alice(), &bob(), "oops")
            .await
            .unwrap();

        assert_eq!(
            f.conversations.recall(msg.id, &bob()).await,
            Err(ChatError::NotFound(msg.id))
        );

        let recalled = f.conversations.recall(msg.id, &alice()).await.unwrap();
        assert_eq!(recalled.message.status, MessageStatus::Recalled);
        assert_eq!(recalled.notify, [alice(), bob()]);

        let from_alice = f.conversations.history(&alice(), &bob(), 50).await;
        let from_bob = f.conversations.history(&bob(), &alice(), 50).await;
        assert_eq!(from_alice[0].status, MessageStatus::Recalled);
        assert_eq!(from_alice[0].recall_at, from_bob[0].recall_at);
        assert!(from_alice[0].recall_at.is_some());

        // Second attempt is a no-op.
        assert_eq!(
            f.conversations.recall(msg.id, &alice()).await,
            Err(ChatError::NotFound(msg.id))
        );
    }

    #[tokio::test]
    async fn test_recall_of_read_message_and_unknown_id() {
        let f = fixture();
        let msg = f
            .conversations
            .send_private(&alice(), &bob(), "read me")
            .await
            .unwrap();
        f.conversations.mark_read(&bob(), &alice()).await;

        let recalled = f.conversations.recall(msg.id, &alice()).await.unwrap();
        assert_eq!(recalled.message.status, MessageStatus::Recalled);
        assert!(recalled.message.read_at.is_some());

        let unknown = MessageId::new();
        assert_eq!(
            f.conversations.recall(unknown, &alice()).await,
            Err(ChatError::NotFound(unknown))
        );
    }

    #[tokio::test]
    async fn test_recall_does_not_decrement_unread() {
        let f = fixture();
        let msg = f
            .conversations
            .send_private(&alice(), &bob(), "never mind")
            .await
            .unwrap();
        f.conversations.recall(msg.id, &alice()).await.unwrap();

        // The counter keeps counting the recalled message until bob reads the thread.
        assert_eq!(f.conversations.unread_count(&bob(), &alice()).await, 1);
        assert!(f.conversations.pending_for(&bob(), 50).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_limit_keeps_newest_oldest_first() {
        let f = fixture();
        for i in 0..60 {
            f.conversations
                .send_private(&alice(), &bob(), &format!("m{i}"))
                .await
                .unwrap();
        }
        let history = f.conversations.history(&bob(), &alice(), 50).await;
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].content, "m10");
        assert_eq!(history[49].content, "m59");
        assert!(f
            .conversations
            .history(&alice(), &Username::from("eve"), 50)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_pending_for_only_includes_incoming_sent() {
        let f = fixture();
        let carol = Username::from("carol");
        let incoming = f
            .conversations
            .send_private(&alice(), &bob(), "to bob")
            .await
            .unwrap();
        f.conversations
            .send_private(&bob(), &alice(), "from bob")
            .await
            .unwrap();
        let read = f
            .conversations
            .send_private(&carol, &bob(), "read soon")
            .await
            .unwrap();
        f.conversations.mark_read(&bob(), &carol).await;

        let pending = f.conversations.pending_for(&bob(), 50).await;
        assert_eq!(pending, vec![incoming]);
        let thread = f.conversations.history(&bob(), &carol, 50).await;
        assert_eq!(thread[0].id, read.id);
        assert_eq!(thread[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_unread_counts_lists_nonzero_senders() {
        let f = fixture();
        let carol = Username::from("carol");
        f.conversations.send_private(&alice(), &bob(), "1").await.unwrap();
        f.conversations.send_private(&alice(), &bob(), "2").await.unwrap();
        f.conversations.send_private(&carol, &bob(), "3").await.unwrap();
        f.conversations.mark_read(&bob(), &carol).await;

        let counts = f.conversations.unread_counts(&bob()).await;
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get(&alice()), Some(&2));
    }

    #[tokio::test]
    async fn test_threads_and_counters_survive_reload() {
        let f = fixture();
        let msg = f
            .conversations
            .send_private(&alice(), &bob(), "persist me")
            .await
            .unwrap();

        let reloaded = fixture_with(f.store.clone(), ContentFilter::default());
        assert_eq!(
            reloaded.conversations.history(&alice(), &bob(), 50).await,
            vec![msg.clone()]
        );
        assert_eq!(reloaded.conversations.unread_count(&bob(), &alice()).await, 1);

        // The id index is rebuilt, so recall still works after a restart.
        assert!(reloaded.conversations.recall(msg.id, &alice()).await.is_ok());
    }
}
