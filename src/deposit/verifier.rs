use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::ledger::models::Transfer;

/// Why a transfer was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    NotAddressedToUs { to_address: String },
    InsufficientAmount { required: u64, received: u64 },
    Stale { age_secs: u64, max_age_secs: u64 },
    SenderMismatch { expected: String, actual: String },
    /// Everything else passed; try again once more blocks land
    PendingConfirmation { confirmations: u64, required: u64 },
}

impl RejectionReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectionReason::PendingConfirmation { .. })
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NotAddressedToUs { to_address } => {
                write!(f, "not addressed to the deposit address (to {})", to_address)
            }
            RejectionReason::InsufficientAmount { required, received } => {
                write!(f, "insufficient amount: required {}, received {}", required, received)
            }
            RejectionReason::Stale { age_secs, max_age_secs } => {
                write!(f, "stale: {}s old, limit {}s", age_secs, max_age_secs)
            }
            RejectionReason::SenderMismatch { expected, actual } => {
                write!(f, "sender mismatch: expected {}, got {}", expected, actual)
            }
            RejectionReason::PendingConfirmation { confirmations, required } => {
                write!(f, "pending confirmation: {}/{}", confirmations, required)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectionReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Acceptance rules for transfers arriving at the monitored deposit address
pub struct TransferVerifier {
    deposit_address: String,
    clock: Arc<dyn Clock>,
}

impl TransferVerifier {
    pub fn new(deposit_address: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            deposit_address: deposit_address.into(),
            clock,
        }
    }

    pub fn deposit_address(&self) -> &str {
        &self.deposit_address
    }

    /// Decide whether `transfer` is accepted.
    ///
    /// Rules run in order and the first failure wins: destination, amount,
    /// age, expected sender, confirmations. Confirmations come last so that a
    /// `PendingConfirmation` rejection means the transfer is otherwise good.
    pub fn verify(
        &self,
        transfer: &Transfer,
        required_amount: u64,
        max_age: Duration,
        min_confirmations: u64,
        expected_sender: Option<&str>,
    ) -> Verdict {
        let verdict = self.evaluate(
            transfer,
            required_amount,
            max_age,
            min_confirmations,
            expected_sender,
        );

        match &verdict {
            Verdict::Accepted => {
                debug!("✓ Transfer {} accepted ({} from {})", transfer.tx_hash, transfer.amount, transfer.from_address);
            }
            Verdict::Rejected(reason @ RejectionReason::SenderMismatch { .. }) => {
                warn!("⚠️ Transfer {} rejected: {}", transfer.tx_hash, reason);
            }
            Verdict::Rejected(reason) => {
                debug!("⏭️ Transfer {} rejected: {}", transfer.tx_hash, reason);
            }
        }

        verdict
    }

    fn evaluate(
        &self,
        transfer: &Transfer,
        required_amount: u64,
        max_age: Duration,
        min_confirmations: u64,
        expected_sender: Option<&str>,
    ) -> Verdict {
        if transfer.to_address != self.deposit_address {
            return Verdict::Rejected(RejectionReason::NotAddressedToUs {
                to_address: transfer.to_address.clone(),
            });
        }

        if transfer.amount < required_amount {
            return Verdict::Rejected(RejectionReason::InsufficientAmount {
                required: required_amount,
                received: transfer.amount,
            });
        }

        // Blocks stamped slightly in the future count as age zero
        let age_secs = (self.clock.now() - transfer.block_time).num_seconds().max(0) as u64;
        if age_secs > max_age.as_secs() {
            return Verdict::Rejected(RejectionReason::Stale {
                age_secs,
                max_age_secs: max_age.as_secs(),
            });
        }

        if let Some(expected) = expected_sender {
            if transfer.from_address != expected {
                return Verdict::Rejected(RejectionReason::SenderMismatch {
                    expected: expected.to_string(),
                    actual: transfer.from_address.clone(),
                });
            }
        }

        if transfer.confirmations < min_confirmations {
            return Verdict::Rejected(RejectionReason::PendingConfirmation {
                confirmations: transfer.confirmations,
                required: min_confirmations,
            });
        }

        Verdict::Accepted
    }
}
