// Scripted collaborators shared by the unit tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::clock::ManualClock;
use crate::error::{ReconcileError, ReconcileResult};
use crate::execution::RefundSubmitter;
use crate::explorer::LedgerQueryClient;
use crate::ledger::models::{
    AssetAmount, Transfer, TxSummary, UtxoDetail, UtxoInput, UtxoOutput, NATIVE_UNIT,
};

pub const DEPOSIT_ADDRESS: &str =
    "addr_test1qdeposit0000000000000000000000000000000000000000000000";

/// Syntactically valid test address derived from a short lowercase name
pub fn address(name: &str) -> String {
    format!("addr_test1q{:0<57}", name)
}

pub fn test_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
}

fn lovelace(quantity: u64) -> Vec<AssetAmount> {
    vec![AssetAmount {
        unit: NATIVE_UNIT.to_string(),
        quantity: quantity.to_string(),
    }]
}

#[derive(Debug, Clone)]
pub struct ScriptedTx {
    pub summary: TxSummary,
    pub detail: UtxoDetail,
}

/// A transaction from `sender` paying `amount` to the deposit address
pub fn payment(label: &str, sender: &str, amount: u64, block_height: u64, block_time: i64) -> ScriptedTx {
    let tx_hash = FakeExplorer::hash(label);
    ScriptedTx {
        summary: TxSummary {
            tx_hash: tx_hash.clone(),
            block_height,
            block_time,
        },
        detail: UtxoDetail {
            hash: tx_hash,
            inputs: vec![UtxoInput {
                address: sender.to_string(),
                amount: lovelace(amount + 1_000_000),
            }],
            outputs: vec![
                UtxoOutput {
                    address: DEPOSIT_ADDRESS.to_string(),
                    amount: lovelace(amount),
                },
                UtxoOutput {
                    address: sender.to_string(),
                    amount: lovelace(800_000),
                },
            ],
        },
    }
}

/// An accepted-looking transfer, without going through the explorer
pub fn sample_transfer(label: &str, sender: &str, amount: u64) -> Transfer {
    Transfer {
        tx_hash: FakeExplorer::hash(label),
        from_address: sender.to_string(),
        to_address: DEPOSIT_ADDRESS.to_string(),
        amount,
        block_time: Utc::now(),
        block_height: 100,
        confirmations: 0,
    }
}

// ========== EXPLORER ==========

#[derive(Default)]
struct ExplorerScript {
    /// Newest first, like the real listing
    txs: Vec<ScriptedTx>,
    tip: u64,
    list_failures: VecDeque<ReconcileError>,
    utxo_failures: VecDeque<ReconcileError>,
    list_calls: usize,
    utxo_calls: usize,
}

#[derive(Default)]
pub struct FakeExplorer {
    script: Mutex<ExplorerScript>,
}

impl FakeExplorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic 32-byte hex hash for a label
    pub fn hash(label: &str) -> String {
        format!("{:0<64}", hex::encode(label))
    }

    /// A new transaction lands on the address and becomes the listing head
    pub fn receive(&self, tx: ScriptedTx) {
        self.script.lock().txs.insert(0, tx);
    }

    pub fn set_tip(&self, height: u64) {
        self.script.lock().tip = height;
    }

    pub fn fail_list(&self, error: ReconcileError) {
        self.script.lock().list_failures.push_back(error);
    }

    pub fn fail_utxo(&self, error: ReconcileError) {
        self.script.lock().utxo_failures.push_back(error);
    }

    pub fn list_calls(&self) -> usize {
        self.script.lock().list_calls
    }

    pub fn utxo_calls(&self) -> usize {
        self.script.lock().utxo_calls
    }
}

#[async_trait]
impl LedgerQueryClient for FakeExplorer {
    async fn list_recent_transactions(
        &self,
        _address: &str,
        count: usize,
    ) -> ReconcileResult<Vec<TxSummary>> {
        let mut script = self.script.lock();
        script.list_calls += 1;
        if let Some(error) = script.list_failures.pop_front() {
            return Err(error);
        }
        Ok(script
            .txs
            .iter()
            .take(count)
            .map(|tx| tx.summary.clone())
            .collect())
    }

    async fn get_utxo_detail(&self, tx_hash: &str) -> ReconcileResult<UtxoDetail> {
        let mut script = self.script.lock();
        script.utxo_calls += 1;
        if let Some(error) = script.utxo_failures.pop_front() {
            return Err(error);
        }
        script
            .txs
            .iter()
            .find(|tx| tx.summary.tx_hash == tx_hash)
            .map(|tx| tx.detail.clone())
            .ok_or_else(|| ReconcileError::Rejected(format!("404 {}", tx_hash)))
    }

    async fn latest_block_height(&self) -> ReconcileResult<u64> {
        Ok(self.script.lock().tip)
    }
}

// ========== SUBMITTER ==========

#[derive(Default)]
struct SubmitterState {
    submissions: Vec<(String, u64)>,
    failures: VecDeque<ReconcileError>,
}

/// Records refunds instead of sending them; hashes are `refund-1`, `refund-2`, ...
#[derive(Default)]
pub struct FakeSubmitter {
    state: Mutex<SubmitterState>,
}

impl FakeSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ReconcileError) {
        self.state.lock().failures.push_back(error);
    }

    pub fn submissions(&self) -> Vec<(String, u64)> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }
}

#[async_trait]
impl RefundSubmitter for FakeSubmitter {
    async fn submit_refund(&self, to_address: &str, amount: u64) -> ReconcileResult<String> {
        let mut state = self.state.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.submissions.push((to_address.to_string(), amount));
        Ok(format!("refund-{}", state.submissions.len()))
    }
}
