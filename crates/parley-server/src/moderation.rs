//! Per-user block lists.
//!
//! A block is a directed edge: `block(alice, eve)` stops eve's private
//! messages from reaching alice and nothing else.
//!
//! The `blocks` document is rewritten under the write lock on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use parley_shared::constants::DOC_BLOCKS;
use parley_shared::Username;
use parley_store::DocumentStore;

type BlockLists = BTreeMap<Username, BTreeSet<Username>>;

pub struct ModerationStore {
    blocks: RwLock<BlockLists>,
    store: Arc<dyn DocumentStore>,
}

impl ModerationStore {
    pub fn load(store: Arc<dyn DocumentStore>) -> Self {
        let blocks = match store.load::<BlockLists>(DOC_BLOCKS) {
            Ok(Some(blocks)) => {
                info!(users = blocks.len(), "Loaded block lists");
                blocks
            }
            Ok(None) => BlockLists::new(),
            Err(e) => {
                error!(error = %e, "Failed to load block lists, starting empty");
                BlockLists::new()
            }
        };

        Self {
            blocks: RwLock::new(blocks),
            store,
        }
    }

    /// `user` blocks `target`. Returns `false` if it already was blocked.
    pub async fn block(&self, user: &Username, target: &Username) -> bool {
        let mut blocks = self.blocks.write().await;
        let added = blocks
            .entry(user.clone())
            .or_default()
            .insert(target.clone());
        if added {
            self.persist(&blocks);
            info!(user = %user, target = %target, "User blocked");
        }
        added
    }

    /// Returns `false` if `target` was not blocked.
    pub async fn unblock(&self, user: &Username, target: &Username) -> bool {
        let mut blocks = self.blocks.write().await;
        let removed = match blocks.get_mut(user) {
            Some(set) => {
                let removed = set.remove(target);
                if set.is_empty() {
                    blocks.remove(user);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.persist(&blocks);
            info!(user = %user, target = %target, "User unblocked");
        }
        removed
    }

    /// Has `user` blocked `target`?
    pub async fn is_blocked(&self, user: &Username, target: &Username) -> bool {
        self.blocks
            .read()
            .await
            .get(user)
            .is_some_and(|set| set.contains(target))
    }

    /// Everyone `user` has blocked, sorted.
    pub async fn blocked_by(&self, user: &Username) -> Vec<Username> {
        self.blocks
            .read()
            .await
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn flush(&self) {
        let blocks = self.blocks.read().await;
        self.persist(&blocks);
    }

    fn persist(&self, blocks: &BlockLists) {
        if let Err(e) = self.store.save(DOC_BLOCKS, blocks) {
            error!(error = %e, backend = self.store.backend(), "Failed to save block lists");
        }
    }
}
