use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::ReconcileError;
use crate::execution::RefundSubmitter;
use crate::ledger::models::{TransactionRecord, Transfer};
use crate::ledger::repository::DepositStore;

/// Result of one refund attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundOutcome {
    pub success: bool,
    pub tx_hash: Option<String>,
    /// The deposit was already refunded; nothing was submitted
    pub already_processed: bool,
    pub error: Option<String>,
}

impl RefundOutcome {
    pub fn issued(tx_hash: String) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            already_processed: false,
            error: None,
        }
    }

    pub fn already_processed(tx_hash: Option<String>) -> Self {
        Self {
            success: true,
            tx_hash,
            already_processed: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            already_processed: false,
            error: Some(error.into()),
        }
    }
}

/// Issues refunds for accepted transfers.
///
/// INVARIANTS:
/// - at most one refund is submitted per source address; `Deposit.refunded` is
///   checked before the submitter is contacted
/// - every refund has exactly one owning Deposit (created on the fly when the
///   sender was never registered)
/// - a submission is never retried here
pub struct RefundIssuer {
    store: Arc<dyn DepositStore>,
    submitter: Arc<dyn RefundSubmitter>,
    clock: Arc<dyn Clock>,
    required_amount: u64,
}

impl RefundIssuer {
    pub fn new(
        store: Arc<dyn DepositStore>,
        submitter: Arc<dyn RefundSubmitter>,
        clock: Arc<dyn Clock>,
        required_amount: u64,
    ) -> Self {
        Self {
            store,
            submitter,
            clock,
            required_amount,
        }
    }

    /// Refund `amount` to `source_address` unless it was already refunded
    #[instrument(skip(self))]
    pub async fn issue_refund(&self, source_address: &str, amount: u64) -> RefundOutcome {
        let deposit = match self
            .store
            .ensure_deposit(source_address, self.required_amount, self.clock.now())
            .await
        {
            Ok(deposit) => deposit,
            Err(e) => {
                error!("❌ Could not load deposit for {}: {}", source_address, e);
                return RefundOutcome::failed(format!("Deposit lookup failed: {}", e));
            }
        };

        if deposit.refunded {
            info!(
                "⏭️ Deposit {} already refunded ({:?}), skipping",
                source_address, deposit.refund_tx_hash
            );
            return RefundOutcome::already_processed(deposit.refund_tx_hash);
        }

        let refund_tx_hash = match self.submitter.submit_refund(source_address, amount).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                error!("❌ Refund submission to {} failed: {}", source_address, e);
                return RefundOutcome::failed(format!("Refund submission failed: {}", e));
            }
        };

        let record = TransactionRecord::refund(
            refund_tx_hash.clone(),
            source_address,
            amount,
            self.clock.now(),
        );

        match self.store.complete_refund(source_address, &record).await {
            Ok(()) => {
                info!("✓ Refund {} recorded for {}", refund_tx_hash, source_address);
                RefundOutcome::issued(refund_tx_hash)
            }
            Err(ReconcileError::Conflict(detail)) => {
                warn!("⚠️ Refund record {} already exists: {}", refund_tx_hash, detail);
                RefundOutcome::issued(refund_tx_hash)
            }
            Err(e) => {
                // The refund is on its way; only the bookkeeping is missing
                error!(
                    "🚨 Refund {} to {} submitted but not recorded: {}. Manual reconciliation required.",
                    refund_tx_hash, source_address, e
                );
                RefundOutcome {
                    success: true,
                    tx_hash: Some(refund_tx_hash),
                    already_processed: false,
                    error: Some(format!("Refund submitted but bookkeeping failed: {}", e)),
                }
            }
        }
    }

    /// Record an accepted transfer against its sender's deposit and refund it
    pub async fn refund_transfer(&self, transfer: &Transfer) -> RefundOutcome {
        let now = self.clock.now();

        if let Err(e) = self
            .store
            .ensure_deposit(&transfer.from_address, self.required_amount, now)
            .await
        {
            error!("❌ Could not create deposit for {}: {}", transfer.from_address, e);
            return RefundOutcome::failed(format!("Deposit lookup failed: {}", e));
        }

        if let Err(e) = self
            .store
            .record_verification(&transfer.from_address, now, Some(transfer))
            .await
        {
            warn!("⚠️ Could not record verification for {}: {}", transfer.from_address, e);
        }

        match self
            .store
            .insert_transaction(&TransactionRecord::deposit(transfer, now))
            .await
        {
            Ok(()) | Err(ReconcileError::Conflict(_)) => {}
            Err(e) => warn!("⚠️ Could not record incoming transfer {}: {}", transfer.tx_hash, e),
        }

        self.issue_refund(&transfer.from_address, transfer.amount).await
    }
}
