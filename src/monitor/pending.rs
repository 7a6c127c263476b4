use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::warn;

use crate::ledger::models::{TxSummary, UtxoDetail};

/// A transfer that passed every rule except confirmations
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub summary: TxSummary,
    pub detail: UtxoDetail,
    pub first_seen: DateTime<Utc>,
    pub attempts: u32,
}

/// Bounded retry queue for transfers waiting on confirmations.
///
/// The UTXO detail is kept so a retry only needs a fresh chain tip. Not
/// persisted: a restart forgets pending transfers.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingTransfer>,
    limit: usize,
}

impl PendingQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.entries.iter().any(|entry| entry.summary.tx_hash == tx_hash)
    }

    /// Queue a transfer; when full the oldest entry is dropped
    pub fn push(&mut self, entry: PendingTransfer) {
        if self.contains(&entry.summary.tx_hash) {
            return;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            if let Some(evicted) = self.entries.pop_front() {
                warn!(
                    "⚠️ Pending queue full, dropping {} after {} attempts",
                    evicted.summary.tx_hash, evicted.attempts
                );
            }
        }
    }

    /// Remove every entry for re-evaluation, oldest first
    pub fn take_all(&mut self) -> Vec<PendingTransfer> {
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tx_hash: &str) -> PendingTransfer {
        PendingTransfer {
            summary: TxSummary {
                tx_hash: tx_hash.to_string(),
                block_height: 1,
                block_time: 0,
            },
            detail: UtxoDetail {
                hash: tx_hash.to_string(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
            first_seen: Utc::now(),
            attempts: 1,
        }
    }

    #[test]
    fn test_queue_dedups_and_evicts_oldest() {
        let mut queue = PendingQueue::new(2);
        queue.push(entry("a"));
        queue.push(entry("a"));
        queue.push(entry("b"));
        queue.push(entry("c"));

        assert_eq!(queue.len(), 2);
        assert!(!queue.contains("a"));

        let drained: Vec<String> = queue.take_all().into_iter().map(|e| e.summary.tx_hash).collect();
        assert_eq!(drained, vec!["b", "c"]);
        assert!(queue.is_empty());
    }
}
