use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ReconcileError, ReconcileResult};

/// Unit name of the ledger's native asset in explorer amount lists
pub const NATIVE_UNIT: &str = "lovelace";

// ========== EXPLORER DATA ==========

/// Transaction summary as listed by the explorer for an address (newest first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSummary {
    pub tx_hash: String,
    pub block_height: u64,
    /// Unix seconds
    pub block_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub unit: String,
    pub quantity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInput {
    pub address: String,
    #[serde(default)]
    pub amount: Vec<AssetAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoOutput {
    pub address: String,
    #[serde(default)]
    pub amount: Vec<AssetAmount>,
}

/// Inputs and outputs of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoDetail {
    pub hash: String,
    pub inputs: Vec<UtxoInput>,
    pub outputs: Vec<UtxoOutput>,
}

impl UtxoDetail {
    /// Resolve the sender of a transaction.
    ///
    /// UTXO transactions carry no single "from" field, so the address of the
    /// first input is taken. Transactions spending inputs owned by several
    /// parties are not disambiguated.
    pub fn sender(&self) -> Option<&str> {
        self.inputs.first().map(|input| input.address.as_str())
    }

    /// Native-asset amount paid to `address`, summed over all outputs.
    /// Quantities that fail to parse are ignored.
    pub fn amount_paid_to(&self, address: &str) -> u64 {
        self.outputs
            .iter()
            .filter(|output| output.address == address)
            .flat_map(|output| output.amount.iter())
            .filter(|amount| amount.unit == NATIVE_UNIT)
            .filter_map(|amount| amount.quantity.parse::<u64>().ok())
            .fold(0u64, |total, quantity| total.saturating_add(quantity))
    }

    pub fn pays(&self, address: &str) -> bool {
        self.outputs.iter().any(|output| output.address == address)
    }
}

// ========== TRANSFERS ==========

/// An observed incoming value transfer. Sourced entirely from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    /// Minor units of the native asset credited to `to_address`
    pub amount: u64,
    pub block_time: DateTime<Utc>,
    pub block_height: u64,
    pub confirmations: u64,
}

impl Transfer {
    /// Build a transfer from explorer data as seen from `deposit_address`.
    ///
    /// `to_address` is the deposit address when any output pays it, otherwise the
    /// first output's address. Confirmations count the including block itself, as
    /// Blockfrost does: a transaction in the tip block has one.
    pub fn from_explorer(
        summary: &TxSummary,
        detail: &UtxoDetail,
        deposit_address: &str,
        tip_height: u64,
    ) -> ReconcileResult<Self> {
        let from_address = detail
            .sender()
            .ok_or_else(|| {
                ReconcileError::Rejected(format!("Transaction {} has no inputs", summary.tx_hash))
            })?
            .to_string();

        let to_address = if detail.pays(deposit_address) {
            deposit_address.to_string()
        } else {
            detail
                .outputs
                .first()
                .map(|output| output.address.clone())
                .unwrap_or_default()
        };

        let block_time = Utc
            .timestamp_opt(summary.block_time, 0)
            .single()
            .ok_or_else(|| {
                ReconcileError::Rejected(format!(
                    "Transaction {} has invalid block time {}",
                    summary.tx_hash, summary.block_time
                ))
            })?;

        Ok(Self {
            tx_hash: summary.tx_hash.clone(),
            from_address,
            to_address,
            amount: detail.amount_paid_to(deposit_address),
            block_time,
            block_height: summary.block_height,
            confirmations: confirmations(tip_height, summary.block_height),
        })
    }
}

// ========== DEPOSITS ==========

/// Local reconciliation record for one source address
///
/// INVARIANTS:
/// - `verified` goes false -> true at most once
/// - `refunded` goes false -> true at most once and is terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub source_address: String,
    pub owner_id: Option<Uuid>,
    pub required_amount: u64,
    pub tx_hash: Option<String>,
    pub verified: bool,
    pub refunded: bool,
    pub verification_attempts: u32,
    pub last_verification_attempt: Option<DateTime<Utc>>,
    pub sender_address: Option<String>,
    pub refund_tx_hash: Option<String>,
    pub refund_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn new(
        source_address: impl Into<String>,
        owner_id: Option<Uuid>,
        required_amount: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source_address: source_address.into(),
            owner_id,
            required_amount,
            tx_hash: None,
            verified: false,
            refunded: false,
            verification_attempts: 0,
            last_verification_attempt: None,
            sender_address: None,
            refund_tx_hash: None,
            refund_timestamp: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a verification attempt, accepted or not
    pub fn record_attempt(&mut self, at: DateTime<Utc>, accepted: Option<&Transfer>) {
        self.verification_attempts = self.verification_attempts.saturating_add(1);
        self.last_verification_attempt = Some(at);
        self.updated_at = at;

        if let Some(transfer) = accepted {
            if !self.verified {
                self.verified = true;
                self.tx_hash = Some(transfer.tx_hash.clone());
                self.sender_address = Some(transfer.from_address.clone());
            }
        }
    }
}

/// Zero while the tip lags behind the including block
fn confirmations(tip_height: u64, block_height: u64) -> u64 {
    if tip_height >= block_height {
        tip_height - block_height + 1
    } else {
        0
    }
}

// ========== TRANSACTION LEDGER ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Refund => "refund",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only ledger entry, unique on `tx_hash`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub tx_type: TransactionType,
    pub source_address: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn refund(
        tx_hash: impl Into<String>,
        source_address: impl Into<String>,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            tx_type: TransactionType::Refund,
            source_address: source_address.into(),
            amount,
            created_at: at,
        }
    }

    pub fn deposit(transfer: &Transfer, at: DateTime<Utc>) -> Self {
        Self {
            tx_hash: transfer.tx_hash.clone(),
            tx_type: TransactionType::Deposit,
            source_address: transfer.from_address.clone(),
            amount: transfer.amount,
            created_at: at,
        }
    }
}

// ========== PROCESSED MARKERS & CHECKPOINT ==========

/// How a transaction hash left the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessedOutcome {
    Refunded,
    Skipped,
}

impl ProcessedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedOutcome::Refunded => "refunded",
            ProcessedOutcome::Skipped => "skipped",
        }
    }
}

/// Head transaction observed on the last successful poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_seen_tx_hash: String,
    pub block_height: u64,
    pub updated_at: DateTime<Utc>,
}
