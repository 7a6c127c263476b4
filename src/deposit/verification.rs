use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::verifier::{RejectionReason, TransferVerifier, Verdict};
use crate::clock::Clock;
use crate::error::{ReconcileError, ReconcileResult};
use crate::explorer::LedgerQueryClient;
use crate::ledger::models::{Deposit, Transfer};
use crate::ledger::repository::DepositStore;
use crate::monitor::retry::with_backoff;

/// Acceptance parameters shared with the monitor
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub required_amount: u64,
    pub max_age: Duration,
    pub min_confirmations: u64,
    pub fetch_count: usize,
    pub max_fetch_attempts: u32,
}

/// Outcome of an explicit verification request
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub source_address: String,
    pub verified: bool,
    pub tx_hash: Option<String>,
    pub reason: Option<RejectionReason>,
    pub verification_attempts: u32,
}

impl VerificationResult {
    fn from_deposit(deposit: &Deposit, reason: Option<RejectionReason>) -> Self {
        Self {
            source_address: deposit.source_address.clone(),
            verified: deposit.verified,
            tx_hash: deposit.tx_hash.clone(),
            reason,
            verification_attempts: deposit.verification_attempts,
        }
    }
}

/// Cardano payment addresses: bech32 with an `addr1`/`addr_test1` prefix
pub fn is_valid_address(address: &str) -> bool {
    let body = match address
        .strip_prefix("addr_test1")
        .or_else(|| address.strip_prefix("addr1"))
    {
        Some(body) => body,
        None => return false,
    };

    (50..=110).contains(&body.len())
        && body
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Registration and on-demand verification of deposits.
///
/// Refunds stay with the monitor; this service only records what the ledger shows.
pub struct DepositVerificationService {
    store: Arc<dyn DepositStore>,
    explorer: Arc<dyn LedgerQueryClient>,
    verifier: Arc<TransferVerifier>,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
}

impl DepositVerificationService {
    pub fn new(
        store: Arc<dyn DepositStore>,
        explorer: Arc<dyn LedgerQueryClient>,
        verifier: Arc<TransferVerifier>,
        clock: Arc<dyn Clock>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            store,
            explorer,
            verifier,
            clock,
            config,
        }
    }

    pub async fn get_deposit(&self, source_address: &str) -> ReconcileResult<Option<Deposit>> {
        self.store.get_deposit(source_address).await
    }

    /// Register a source address ahead of its transfer
    pub async fn register_deposit(
        &self,
        source_address: &str,
        owner_id: Option<Uuid>,
        required_amount: Option<u64>,
    ) -> ReconcileResult<Deposit> {
        if !is_valid_address(source_address) {
            return Err(ReconcileError::Rejected(format!(
                "Invalid source address: {}",
                source_address
            )));
        }

        let deposit = Deposit::new(
            source_address,
            owner_id,
            required_amount.unwrap_or(self.config.required_amount),
            self.clock.now(),
        );
        let created = self.store.create_deposit(&deposit).await?;
        info!(
            "📥 Deposit registered: {} (required {})",
            created.source_address, created.required_amount
        );
        Ok(created)
    }

    /// Look for a transfer from `source_address` among the recent deposits.
    ///
    /// The registered address is the expected sender. Every call counts as one
    /// verification attempt unless the deposit is already verified.
    pub async fn verify_deposit(&self, source_address: &str) -> ReconcileResult<VerificationResult> {
        let deposit = self.store.get_deposit(source_address).await?.ok_or_else(|| {
            ReconcileError::Rejected(format!("No deposit registered for {}", source_address))
        })?;

        if deposit.verified {
            return Ok(VerificationResult::from_deposit(&deposit, None));
        }

        let (accepted, reason) = self.scan_for_sender(&deposit).await?;
        let updated = self
            .store
            .record_verification(source_address, self.clock.now(), accepted.as_ref())
            .await?;

        match &accepted {
            Some(transfer) => info!("✓ Deposit {} verified by {}", source_address, transfer.tx_hash),
            None => info!(
                "Deposit {} not verified yet (attempt {}): {:?}",
                source_address, updated.verification_attempts, reason
            ),
        }

        Ok(VerificationResult::from_deposit(&updated, reason))
    }

    async fn scan_for_sender(
        &self,
        deposit: &Deposit,
    ) -> ReconcileResult<(Option<Transfer>, Option<RejectionReason>)> {
        let deposit_address = self.verifier.deposit_address().to_string();
        let attempts = self.config.max_fetch_attempts;

        let summaries = with_backoff("list recent transactions", attempts, || {
            self.explorer
                .list_recent_transactions(&deposit_address, self.config.fetch_count)
        })
        .await?;
        if summaries.is_empty() {
            return Ok((None, None));
        }

        let tip = with_backoff("fetch chain tip", attempts, || self.explorer.latest_block_height()).await?;

        // Rejections of the registered sender's own transfers are reported first
        let mut own_reason: Option<RejectionReason> = None;
        let mut other_reason: Option<RejectionReason> = None;
        for summary in &summaries {
            let detail = match with_backoff("fetch utxo detail", attempts, || {
                self.explorer.get_utxo_detail(&summary.tx_hash)
            })
            .await
            {
                Ok(detail) => detail,
                Err(ReconcileError::Rejected(e)) => {
                    warn!("⚠️ Explorer has no detail for {}: {}", summary.tx_hash, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let transfer = match Transfer::from_explorer(summary, &detail, &deposit_address, tip) {
                Ok(transfer) => transfer,
                Err(e) => {
                    warn!("⚠️ Skipping {}: {}", summary.tx_hash, e);
                    continue;
                }
            };

            match self.verifier.verify(
                &transfer,
                deposit.required_amount,
                self.config.max_age,
                self.config.min_confirmations,
                Some(&deposit.source_address),
            ) {
                Verdict::Accepted => return Ok((Some(transfer), None)),
                Verdict::Rejected(reason) => {
                    let slot = if transfer.from_address == deposit.source_address {
                        &mut own_reason
                    } else {
                        &mut other_reason
                    };
                    slot.get_or_insert(reason);
                }
            }
        }

        Ok((None, own_reason.or(other_reason)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::InMemoryDepositStore;
    use crate::test_utils::{address, payment, FakeExplorer, DEPOSIT_ADDRESS};
    use chrono::{TimeZone, Utc};

    struct Harness {
        service: DepositVerificationService,
        explorer: Arc<FakeExplorer>,
        store: Arc<InMemoryDepositStore>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let store = Arc::new(InMemoryDepositStore::new());
        let explorer = Arc::new(FakeExplorer::new());
        let verifier = Arc::new(TransferVerifier::new(DEPOSIT_ADDRESS, Arc::new(clock.clone())));
        let service = DepositVerificationService::new(
            store.clone(),
            explorer.clone(),
            verifier,
            Arc::new(clock.clone()),
            VerificationConfig {
                required_amount: 2_000_000,
                max_age: Duration::from_secs(3600),
                min_confirmations: 0,
                fetch_count: 10,
                max_fetch_attempts: 3,
            },
        );
        Harness { service, explorer, store, clock }
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(&address("alice")));
        assert!(is_valid_address(&format!("addr1{}", "q".repeat(98))));
        assert!(!is_valid_address("addr_test1short"));
        assert!(!is_valid_address(&format!("stake1{}", "q".repeat(60))));
        assert!(!is_valid_address(&format!("addr1{}", "Q".repeat(60))));
    }

    #[tokio::test]
    async fn test_register_twice_conflicts() {
        let h = harness();
        let alice = address("alice");

        let deposit = h.service.register_deposit(&alice, None, None).await.unwrap();
        assert_eq!(deposit.required_amount, 2_000_000);

        let again = h.service.register_deposit(&alice, None, Some(5)).await;
        assert!(matches!(again, Err(ReconcileError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_address() {
        let h = harness();
        let result = h.service.register_deposit("not-an-address", None, None).await;
        assert!(matches!(result, Err(ReconcileError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_verify_unknown_deposit() {
        let h = harness();
        let result = h.service.verify_deposit(&address("nobody")).await;
        assert!(matches!(result, Err(ReconcileError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_verify_matches_transfer_from_registered_sender() {
        let h = harness();
        let alice = address("alice");
        let bob = address("bob");
        h.service.register_deposit(&alice, None, None).await.unwrap();

        let now = h.clock.now().timestamp();
        h.explorer.set_tip(500);
        h.explorer.receive(payment("a1", &alice, 2_000_000, 300, now - 60));
        h.explorer.receive(payment("b1", &bob, 2_000_000, 400, now - 5));

        let result = h.service.verify_deposit(&alice).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.tx_hash, Some(FakeExplorer::hash("a1")));
        assert_eq!(result.verification_attempts, 1);

        let deposit = h.store.get_deposit(&alice).await.unwrap().unwrap();
        assert_eq!(deposit.sender_address, Some(alice.clone()));
        assert!(!deposit.refunded);
    }

    #[tokio::test]
    async fn test_verify_skips_transaction_without_detail() {
        let h = harness();
        let alice = address("alice");
        let bob = address("bob");
        h.service.register_deposit(&alice, None, None).await.unwrap();

        let now = h.clock.now().timestamp();
        h.explorer.receive(payment("a1", &alice, 2_000_000, 300, now - 60));
        h.explorer.receive(payment("b1", &bob, 2_000_000, 400, now - 5));
        // newest first: b1's detail lookup is the one that 404s
        h.explorer.fail_utxo(ReconcileError::Rejected("404 b1".to_string()));

        let result = h.service.verify_deposit(&alice).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.tx_hash, Some(FakeExplorer::hash("a1")));
        assert_eq!(h.explorer.utxo_calls(), 2);
    }

    #[tokio::test]
    async fn test_verify_reports_closest_rejection() {
        let h = harness();
        let alice = address("alice");
        let bob = address("bob");
        h.service.register_deposit(&alice, None, None).await.unwrap();

        let now = h.clock.now().timestamp();
        h.explorer.set_tip(500);
        h.explorer.receive(payment("a1", &alice, 1_999_999, 300, now - 60));
        h.explorer.receive(payment("b1", &bob, 2_000_000, 400, now - 5));

        let result = h.service.verify_deposit(&alice).await.unwrap();
        assert!(!result.verified);
        assert_eq!(
            result.reason,
            Some(RejectionReason::InsufficientAmount { required: 2_000_000, received: 1_999_999 })
        );

        let second = h.service.verify_deposit(&alice).await.unwrap();
        assert_eq!(second.verification_attempts, 2);
    }
}
