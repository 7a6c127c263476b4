// Ledger explorer access: the only way the monitor learns about transfers

pub mod blockfrost;

use async_trait::async_trait;

use crate::error::ReconcileResult;
use crate::ledger::models::{TxSummary, UtxoDetail};

pub use blockfrost::{BlockfrostClient, BlockfrostConfig};

/// Read-only view of the ledger explorer
///
/// Implementations map every provider failure into `ReconcileError`; a
/// quota/payment-required response must come back as `QuotaExceeded`.
#[async_trait]
pub trait LedgerQueryClient: Send + Sync {
    /// Up to `count` transactions touching `address`, newest first
    async fn list_recent_transactions(
        &self,
        address: &str,
        count: usize,
    ) -> ReconcileResult<Vec<TxSummary>>;

    async fn get_utxo_detail(&self, tx_hash: &str) -> ReconcileResult<UtxoDetail>;

    /// Height of the chain tip, used to count confirmations
    async fn latest_block_height(&self) -> ReconcileResult<u64>;
}
