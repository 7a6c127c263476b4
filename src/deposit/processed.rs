use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ReconcileResult;
use crate::ledger::models::{Checkpoint, ProcessedOutcome, TxSummary};
use crate::ledger::repository::DepositStore;

/// Durable dedup set of handled transaction hashes plus the resumption checkpoint.
///
/// The hot set is a bounded window over the store's most recent markers; the
/// monitor only ever looks a few transactions back, so older hashes never need
/// to be consulted again.
///
/// INVARIANTS:
/// - a hash is persisted before it is added to the in-memory window
/// - the checkpoint never moves to a head observed at a lower block height
pub struct ProcessedSet {
    store: Arc<dyn DepositStore>,
    hashes: HashSet<String>,
    order: VecDeque<String>,
    limit: usize,
    checkpoint: Option<Checkpoint>,
}

impl ProcessedSet {
    /// Restore the window and checkpoint from the store
    pub async fn load(store: Arc<dyn DepositStore>, limit: usize) -> ReconcileResult<Self> {
        let limit = limit.max(1);
        let recent = store.load_processed(limit).await?;
        let checkpoint = store.load_checkpoint().await?;

        let mut set = Self {
            store,
            hashes: HashSet::with_capacity(recent.len()),
            order: VecDeque::with_capacity(recent.len()),
            limit,
            checkpoint,
        };

        // Store returns newest first; rebuild oldest first so eviction drops the oldest
        for tx_hash in recent.into_iter().rev() {
            set.remember(tx_hash);
        }

        info!(
            "📂 Restored {} processed markers, checkpoint {:?}",
            set.hashes.len(),
            set.last_seen()
        );
        Ok(set)
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.hashes.contains(tx_hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub fn last_seen(&self) -> Option<&str> {
        self.checkpoint.as_ref().map(|c| c.last_seen_tx_hash.as_str())
    }

    /// Persist a processed marker, then remember it. Marking twice is harmless.
    pub async fn mark(&mut self, tx_hash: &str, outcome: ProcessedOutcome) -> ReconcileResult<()> {
        self.store.mark_processed(tx_hash, outcome).await?;
        if self.remember(tx_hash.to_string()) {
            debug!("Marked {} as {}", tx_hash, outcome.as_str());
        }
        Ok(())
    }

    /// Move the checkpoint to `head` and persist it.
    ///
    /// Returns `false` without touching the store when `head` is already the
    /// checkpoint or sits below it.
    pub async fn advance(&mut self, head: &TxSummary, at: DateTime<Utc>) -> ReconcileResult<bool> {
        if let Some(current) = &self.checkpoint {
            if current.last_seen_tx_hash == head.tx_hash {
                return Ok(false);
            }
            if head.block_height < current.block_height {
                warn!(
                    "⚠️ Refusing to rewind checkpoint from {} (height {}) to {} (height {})",
                    current.last_seen_tx_hash, current.block_height, head.tx_hash, head.block_height
                );
                return Ok(false);
            }
        }

        let next = Checkpoint {
            last_seen_tx_hash: head.tx_hash.clone(),
            block_height: head.block_height,
            updated_at: at,
        };
        self.store.save_checkpoint(&next).await?;
        debug!("📍 Checkpoint -> {} (height {})", next.last_seen_tx_hash, next.block_height);
        self.checkpoint = Some(next);
        Ok(true)
    }

    fn remember(&mut self, tx_hash: String) -> bool {
        if !self.hashes.insert(tx_hash.clone()) {
            return false;
        }
        self.order.push_back(tx_hash);
        while self.order.len() > self.limit {
            if let Some(evicted) = self.order.pop_front() {
                self.hashes.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryDepositStore;

    fn head(tx_hash: &str, block_height: u64) -> TxSummary {
        TxSummary {
            tx_hash: tx_hash.to_string(),
            block_height,
            block_time: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_marks_survive_reload() {
        let store = Arc::new(InMemoryDepositStore::new());
        let mut set = ProcessedSet::load(store.clone(), 100).await.unwrap();
        assert!(set.is_empty());

        set.mark("tx-a", ProcessedOutcome::Refunded).await.unwrap();
        set.mark("tx-a", ProcessedOutcome::Refunded).await.unwrap();
        set.advance(&head("tx-a", 10), Utc::now()).await.unwrap();

        let reloaded = ProcessedSet::load(store.clone(), 100).await.unwrap();
        assert!(reloaded.contains("tx-a"));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.last_seen(), Some("tx-a"));
        assert_eq!(store.processed_count().await, 1);
    }

    #[tokio::test]
    async fn test_window_evicts_oldest() {
        let store = Arc::new(InMemoryDepositStore::new());
        let mut set = ProcessedSet::load(store, 2).await.unwrap();

        set.mark("tx-1", ProcessedOutcome::Refunded).await.unwrap();
        set.mark("tx-2", ProcessedOutcome::Refunded).await.unwrap();
        set.mark("tx-3", ProcessedOutcome::Skipped).await.unwrap();

        assert!(!set.contains("tx-1"));
        assert!(set.contains("tx-2"));
        assert!(set.contains("tx-3"));
    }

    #[tokio::test]
    async fn test_checkpoint_never_rewinds() {
        let store = Arc::new(InMemoryDepositStore::new());
        let mut set = ProcessedSet::load(store.clone(), 10).await.unwrap();

        assert!(set.advance(&head("tx-new", 200), Utc::now()).await.unwrap());
        assert!(!set.advance(&head("tx-new", 200), Utc::now()).await.unwrap());
        assert!(!set.advance(&head("tx-old", 150), Utc::now()).await.unwrap());
        assert_eq!(set.last_seen(), Some("tx-new"));

        // same height is a sibling in the same block, still forward in explorer order
        assert!(set.advance(&head("tx-sibling", 200), Utc::now()).await.unwrap());

        let persisted = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(persisted.last_seen_tx_hash, "tx-sibling");
        assert_eq!(persisted.block_height, 200);
    }
}
