use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::models::*;
use super::repository::DepositStore;
use crate::error::{ReconcileError, ReconcileResult};

#[derive(Default)]
struct MemoryTables {
    deposits: HashMap<String, Deposit>,
    transactions: HashMap<String, TransactionRecord>,
    /// Insertion order doubles as processing order
    processed: Vec<(String, ProcessedOutcome)>,
    checkpoint: Option<Checkpoint>,
}

/// In-process deposit store for tests and `STORE_BACKEND=memory` dev runs.
/// One lock over all tables gives the same atomicity the Postgres store gets
/// from transactions.
#[derive(Default)]
pub struct InMemoryDepositStore {
    tables: RwLock<MemoryTables>,
}

impl InMemoryDepositStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transactions(&self) -> Vec<TransactionRecord> {
        let tables = self.tables.read().await;
        tables.transactions.values().cloned().collect()
    }

    pub async fn processed_count(&self) -> usize {
        self.tables.read().await.processed.len()
    }
}

#[async_trait]
impl DepositStore for InMemoryDepositStore {
    async fn get_deposit(&self, source_address: &str) -> ReconcileResult<Option<Deposit>> {
        let tables = self.tables.read().await;
        Ok(tables.deposits.get(source_address).cloned())
    }

    async fn create_deposit(&self, deposit: &Deposit) -> ReconcileResult<Deposit> {
        let mut tables = self.tables.write().await;
        if tables.deposits.contains_key(&deposit.source_address) {
            return Err(ReconcileError::Conflict(format!(
                "Deposit already registered for {}",
                deposit.source_address
            )));
        }

        tables
            .deposits
            .insert(deposit.source_address.clone(), deposit.clone());
        info!("📝 Deposit registered for {}", deposit.source_address);
        Ok(deposit.clone())
    }

    async fn ensure_deposit(
        &self,
        source_address: &str,
        required_amount: u64,
        now: DateTime<Utc>,
    ) -> ReconcileResult<Deposit> {
        let mut tables = self.tables.write().await;
        let deposit = tables
            .deposits
            .entry(source_address.to_string())
            .or_insert_with(|| Deposit::new(source_address, None, required_amount, now));
        Ok(deposit.clone())
    }

    async fn record_verification(
        &self,
        source_address: &str,
        at: DateTime<Utc>,
        accepted: Option<&Transfer>,
    ) -> ReconcileResult<Deposit> {
        let mut tables = self.tables.write().await;
        let deposit = tables.deposits.get_mut(source_address).ok_or_else(|| {
            ReconcileError::Rejected(format!("No deposit registered for {}", source_address))
        })?;

        deposit.record_attempt(at, accepted);
        Ok(deposit.clone())
    }

    async fn complete_refund(
        &self,
        source_address: &str,
        record: &TransactionRecord,
    ) -> ReconcileResult<()> {
        let mut tables = self.tables.write().await;
        let deposit = tables.deposits.get_mut(source_address).ok_or_else(|| {
            ReconcileError::Rejected(format!("No deposit registered for {}", source_address))
        })?;

        if deposit.refunded {
            warn!("⚠️ Deposit {} was already marked refunded", source_address);
        } else {
            deposit.refunded = true;
            deposit.refund_tx_hash = Some(record.tx_hash.clone());
            deposit.refund_timestamp = Some(record.created_at);
            deposit.updated_at = record.created_at;
        }

        if tables.transactions.contains_key(&record.tx_hash) {
            return Err(ReconcileError::Conflict(format!(
                "Transaction {} already recorded",
                record.tx_hash
            )));
        }
        tables
            .transactions
            .insert(record.tx_hash.clone(), record.clone());
        Ok(())
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> ReconcileResult<()> {
        let mut tables = self.tables.write().await;
        if tables.transactions.contains_key(&record.tx_hash) {
            return Err(ReconcileError::Conflict(format!(
                "Transaction {} already recorded",
                record.tx_hash
            )));
        }
        tables
            .transactions
            .insert(record.tx_hash.clone(), record.clone());
        Ok(())
    }

    async fn mark_processed(&self, tx_hash: &str, outcome: ProcessedOutcome) -> ReconcileResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.processed.iter().any(|(hash, _)| hash == tx_hash) {
            tables.processed.push((tx_hash.to_string(), outcome));
        }
        Ok(())
    }

    async fn load_processed(&self, limit: usize) -> ReconcileResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .processed
            .iter()
            .rev()
            .take(limit)
            .map(|(hash, _)| hash.clone())
            .collect())
    }

    async fn load_checkpoint(&self) -> ReconcileResult<Option<Checkpoint>> {
        Ok(self.tables.read().await.checkpoint.clone())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ReconcileResult<()> {
        let mut tables = self.tables.write().await;
        tables.checkpoint = Some(checkpoint.clone());
        Ok(())
    }
}
