// Deposit Monitor - polls the deposit address and refunds accepted transfers
//
// One monitor per deposit address:
// - Single-shot timer re-armed after every tick (ticks never overlap)
// - Checkpoint + processed markers make restarts resume, not replay
// - Quota errors pause polling for a fixed cooldown
// - Interval tightens on activity and relaxes while idle

pub mod cadence;
pub mod listeners;
pub mod pending;
pub mod retry;


use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as TickLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::deposit::{
    ProcessedSet, RefundIssuer, RefundOutcome, TransferVerifier, VerificationConfig, Verdict,
};
use crate::error::{ReconcileError, ReconcileResult};
use crate::execution::RefundSubmitter;
use crate::explorer::LedgerQueryClient;
use crate::ledger::models::{ProcessedOutcome, Transfer, TxSummary, UtxoDetail};
use crate::ledger::repository::DepositStore;

pub use cadence::AdaptiveCadence;
pub use listeners::{ListenerRegistry, Subscription, TransferEvent, TransferListener};
pub use pending::{PendingQueue, PendingTransfer};

/// Failed polls in a row before the monitor reports unhealthy
const UNHEALTHY_FAILURE_STREAK: u32 = 3;
/// Recent error messages kept for the health report
const RECENT_ERROR_LIMIT: usize = 10;

/// Deposit monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub deposit_address: String,
    /// Minimum accepted transfer, in minor units
    pub required_amount: u64,
    pub max_age: Duration,
    pub min_confirmations: u64,
    /// Transactions fetched per poll, clamped to 5..=20
    pub fetch_count: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub growth_factor: f64,
    pub rearm_threshold: Duration,
    /// Pause after a quota/payment-required error
    pub cooldown: Duration,
    /// Pause between successive accepted transfers within one tick
    pub transfer_spacing: Duration,
    pub max_fetch_attempts: u32,
    pub processed_cache_limit: usize,
    pub pending_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            deposit_address: String::new(),
            required_amount: 2_000_000,
            max_age: Duration::from_secs(3600),
            min_confirmations: 0,
            fetch_count: 10,
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            growth_factor: 1.5,
            rearm_threshold: Duration::from_secs(1),
            cooldown: Duration::from_secs(3600),
            transfer_spacing: Duration::from_secs(1),
            max_fetch_attempts: retry::DEFAULT_MAX_ATTEMPTS,
            processed_cache_limit: 1000,
            pending_limit: 100,
        }
    }
}

impl MonitorConfig {
    pub fn effective_fetch_count(&self) -> usize {
        self.fetch_count.clamp(5, 20)
    }

    pub fn verification_config(&self) -> VerificationConfig {
        VerificationConfig {
            required_amount: self.required_amount,
            max_age: self.max_age,
            min_confirmations: self.min_confirmations,
            fetch_count: self.effective_fetch_count(),
            max_fetch_attempts: self.max_fetch_attempts,
        }
    }
}

// ========== STATUS & HEALTH ==========

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub ticks_run: u64,
    pub ticks_skipped_cooldown: u64,
    pub transfers_accepted: u64,
    pub transfers_rejected: u64,
    pub refunds_issued: u64,
    pub refund_failures: u64,
    pub listener_failures: u64,
    pub consecutive_failures: u32,
    pub pending_confirmations: usize,
    pub last_error: Option<String>,
    pub last_successful_poll: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub is_running: bool,
    pub deposit_address: String,
    pub processed_count: usize,
    pub current_interval_ms: u64,
    pub last_seen_tx_hash: Option<String>,
    pub payment_error_cooldown_active: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub listener_count: usize,
    pub stats: MonitorStats,
    pub recent_errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub errors: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub pending: usize,
    pub refunds_issued: usize,
    pub refund_failures: usize,
    pub listener_failures: usize,
    pub checkpoint_advanced: bool,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Skipped: the payment-error cooldown is active
    CooledDown { until: DateTime<Utc> },
    Completed(TickReport),
    Failed(ReconcileError),
}

// ========== MONITOR ==========

/// State touched only from inside a tick; the lock doubles as the tick guard
struct TickState {
    processed: ProcessedSet,
    cadence: AdaptiveCadence,
    pending: PendingQueue,
}

/// Snapshot state read by status and health without waiting for a tick
struct SharedState {
    running: bool,
    cooldown_until: Option<DateTime<Utc>>,
    current_interval: Duration,
    last_seen_tx_hash: Option<String>,
    processed_count: usize,
    stats: MonitorStats,
    recent_errors: Vec<String>,
}

struct MonitorInner {
    config: MonitorConfig,
    explorer: Arc<dyn LedgerQueryClient>,
    verifier: Arc<TransferVerifier>,
    issuer: RefundIssuer,
    clock: Arc<dyn Clock>,
    listeners: ListenerRegistry,
    tick: TickLock<TickState>,
    shared: parking_lot::Mutex<SharedState>,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls one deposit address and refunds accepted transfers
pub struct DepositMonitor {
    inner: Arc<MonitorInner>,
    runner: parking_lot::Mutex<Option<Runner>>,
}

impl DepositMonitor {
    /// Build a stopped monitor, restoring processed markers and checkpoint from `store`
    pub async fn new(
        config: MonitorConfig,
        explorer: Arc<dyn LedgerQueryClient>,
        submitter: Arc<dyn RefundSubmitter>,
        store: Arc<dyn DepositStore>,
        clock: Arc<dyn Clock>,
    ) -> ReconcileResult<Self> {
        if config.deposit_address.is_empty() {
            return Err(ReconcileError::Fatal("Deposit address is not configured".to_string()));
        }

        let processed = ProcessedSet::load(store.clone(), config.processed_cache_limit).await?;
        let cadence = AdaptiveCadence::new(
            config.min_interval,
            config.max_interval,
            config.growth_factor,
            config.rearm_threshold,
        );
        let verifier = Arc::new(TransferVerifier::new(
            config.deposit_address.clone(),
            clock.clone(),
        ));
        let issuer = RefundIssuer::new(store, submitter, clock.clone(), config.required_amount);

        let shared = SharedState {
            running: false,
            cooldown_until: None,
            current_interval: cadence.current(),
            last_seen_tx_hash: processed.last_seen().map(str::to_owned),
            processed_count: processed.len(),
            stats: MonitorStats::default(),
            recent_errors: Vec::new(),
        };

        let inner = MonitorInner {
            tick: TickLock::new(TickState {
                processed,
                cadence,
                pending: PendingQueue::new(config.pending_limit),
            }),
            shared: parking_lot::Mutex::new(shared),
            config,
            explorer,
            verifier,
            issuer,
            clock,
            listeners: ListenerRegistry::new(),
        };

        Ok(Self {
            inner: Arc::new(inner),
            runner: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// The verifier this monitor applies, for sharing with on-demand verification
    pub fn verifier(&self) -> Arc<TransferVerifier> {
        self.inner.verifier.clone()
    }

    /// Start polling in a background task. Returns `false` if already running.
    ///
    /// Must be called from within a Tokio runtime. The first tick runs immediately.
    pub fn start(&self) -> bool {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            debug!("Deposit monitor already running");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.inner.shared.lock().running = true;
        let handle = tokio::spawn(run_loop(self.inner.clone(), shutdown_rx));
        *runner = Some(Runner { shutdown, handle });

        info!("🚀 Deposit monitor started for {}", self.inner.config.deposit_address);
        true
    }

    /// Stop scheduling ticks. Returns `false` if not running.
    ///
    /// A tick already in flight finishes; nothing is aborted mid-refund.
    pub fn stop(&self) -> bool {
        let Some(runner) = self.runner.lock().take() else {
            debug!("Deposit monitor not running");
            return false;
        };

        self.inner.shared.lock().running = false;
        if runner.shutdown.send(true).is_err() {
            debug!("Monitor loop already exited");
        }
        // Detach: the loop exits on its own once the current tick completes
        drop(runner.handle);

        info!("🛑 Deposit monitor stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.lock().running
    }

    /// Run one tick now, outside the timer. Works whether or not the loop is running.
    pub async fn trigger_manual_check(&self) -> TickOutcome {
        info!("🔧 Manual deposit check triggered");
        self.inner.run_tick().await
    }

    /// Register a listener called once per accepted transfer, after its refund attempt
    pub fn register_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TransferEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.listeners.register(listener)
    }

    pub fn status(&self) -> MonitorStatus {
        let now = self.inner.clock.now();
        let shared = self.inner.shared.lock();
        let cooldown_until = shared.cooldown_until.filter(|until| *until > now);

        MonitorStatus {
            is_running: shared.running,
            deposit_address: self.inner.config.deposit_address.clone(),
            processed_count: shared.processed_count,
            current_interval_ms: shared.current_interval.as_millis() as u64,
            last_seen_tx_hash: shared.last_seen_tx_hash.clone(),
            payment_error_cooldown_active: cooldown_until.is_some(),
            cooldown_until,
            listener_count: self.inner.listeners.len(),
            stats: shared.stats.clone(),
            recent_errors: shared.recent_errors.clone(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let now = self.inner.clock.now();
        let shared = self.inner.shared.lock();
        let stats = &shared.stats;
        let mut status = HealthStatus::Healthy;
        let mut errors = Vec::new();

        if !shared.running {
            status = HealthStatus::Unhealthy;
            errors.push("Monitor is not running".to_string());
        }

        if stats.consecutive_failures >= UNHEALTHY_FAILURE_STREAK {
            status = status.max(HealthStatus::Unhealthy);
        } else if stats.consecutive_failures > 0 {
            status = status.max(HealthStatus::Degraded);
        }
        if stats.consecutive_failures > 0 {
            errors.push(format!(
                "{} consecutive polls failed, last error: {}",
                stats.consecutive_failures,
                stats.last_error.as_deref().unwrap_or("unknown")
            ));
        }

        let cooling_down = match shared.cooldown_until {
            Some(until) if until > now => {
                status = status.max(HealthStatus::Degraded);
                errors.push(format!("Explorer quota exhausted, polling paused until {}", until));
                true
            }
            _ => false,
        };

        if stats.refund_failures > 0 {
            status = status.max(HealthStatus::Degraded);
            errors.push(format!(
                "{} refund(s) failed and need manual reconciliation",
                stats.refund_failures
            ));
        }

        if shared.running && !cooling_down {
            if let Some(last) = stats.last_successful_poll {
                let limit = self.inner.config.max_interval * 3;
                let limit = chrono::Duration::from_std(limit).unwrap_or_else(|_| chrono::Duration::days(365));
                if now - last > limit {
                    status = status.max(HealthStatus::Degraded);
                    errors.push(format!("No successful poll since {}", last));
                }
            }
        }

        HealthReport {
            status,
            errors,
            checked_at: now,
        }
    }
}

impl Drop for DepositMonitor {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get_mut().take() {
            let _ = runner.shutdown.send(true);
        }
    }
}

async fn run_loop(inner: Arc<MonitorInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        inner.run_tick().await;

        let period = inner.tick.lock().await.cadence.armed();
        tokio::select! {
            // only `true` is ever sent; a dropped sender also ends the loop
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    debug!("Monitor loop for {} exited", inner.config.deposit_address);
}

// ========== TICK ==========

impl MonitorInner {
    #[instrument(skip(self), fields(address = %self.config.deposit_address))]
    async fn run_tick(&self) -> TickOutcome {
        let mut tick = self.tick.lock().await;
        let now = self.clock.now();

        if let Some(until) = self.active_cooldown(now) {
            debug!("⏸️ Payment-error cooldown active until {}, skipping tick", until);
            return TickOutcome::CooledDown { until };
        }

        self.shared.lock().stats.ticks_run += 1;

        let outcome = match self.poll(&mut tick).await {
            Ok(report) => {
                if report.accepted > 0 {
                    tick.cadence.record_activity();
                } else {
                    tick.cadence.record_idle();
                }
                self.record_success(&tick, &report);
                TickOutcome::Completed(report)
            }
            Err(e) => {
                self.record_failure(&e);
                TickOutcome::Failed(e)
            }
        };

        if let Some(period) = tick.cadence.rearm() {
            info!("⏱️ Polling interval now {:.1}s", period.as_secs_f64());
        }
        self.shared.lock().current_interval = tick.cadence.current();

        outcome
    }

    /// Returns the end of the cooldown while it lasts; clears it once elapsed
    fn active_cooldown(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut shared = self.shared.lock();
        match shared.cooldown_until {
            Some(until) if now < until => {
                shared.stats.ticks_skipped_cooldown += 1;
                Some(until)
            }
            Some(_) => {
                shared.cooldown_until = None;
                info!("✓ Payment-error cooldown elapsed, resuming polling");
                None
            }
            None => None,
        }
    }

    async fn poll(&self, tick: &mut TickState) -> ReconcileResult<TickReport> {
        let config = &self.config;
        let attempts = config.max_fetch_attempts;
        let mut report = TickReport::default();

        let summaries = retry::with_backoff("list recent transactions", attempts, || {
            self.explorer
                .list_recent_transactions(&config.deposit_address, config.effective_fetch_count())
        })
        .await?;
        report.fetched = summaries.len();

        let head = summaries.first().cloned();
        let checkpoint = tick.processed.last_seen().map(str::to_owned);

        let candidates: Vec<TxSummary> = match (&head, &checkpoint) {
            (Some(head), Some(seen)) if head.tx_hash == *seen => {
                debug!("No new transactions since {}", seen);
                Vec::new()
            }
            _ => summaries
                .iter()
                .take_while(|summary| checkpoint.as_deref() != Some(summary.tx_hash.as_str()))
                .filter(|summary| {
                    !tick.processed.contains(&summary.tx_hash) && !tick.pending.contains(&summary.tx_hash)
                })
                .cloned()
                .collect(),
        };
        report.candidates = candidates.len();

        if candidates.is_empty() && tick.pending.is_empty() {
            self.advance_checkpoint(tick, head.as_ref(), &mut report).await?;
            return Ok(report);
        }

        let tip = retry::with_backoff("fetch chain tip", attempts, || {
            self.explorer.latest_block_height()
        })
        .await?;

        // Transfers queued by earlier ticks go first, against the fresh tip
        for entry in tick.pending.take_all() {
            if tick.processed.contains(&entry.summary.tx_hash) {
                continue;
            }
            let retry = (entry.attempts + 1, entry.first_seen);
            self.evaluate(tick, &entry.summary, entry.detail, tip, retry, &mut report)
                .await;
        }

        for summary in &candidates {
            let detail = match retry::with_backoff("fetch utxo detail", attempts, || {
                self.explorer.get_utxo_detail(&summary.tx_hash)
            })
            .await
            {
                Ok(detail) => detail,
                Err(ReconcileError::Rejected(detail)) => {
                    warn!("⚠️ Explorer has no detail for {}: {}", summary.tx_hash, detail);
                    report.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let seen_at = self.clock.now();
            self.evaluate(tick, summary, detail, tip, (1, seen_at), &mut report).await;
        }

        self.advance_checkpoint(tick, head.as_ref(), &mut report).await?;
        Ok(report)
    }

    async fn advance_checkpoint(
        &self,
        tick: &mut TickState,
        head: Option<&TxSummary>,
        report: &mut TickReport,
    ) -> ReconcileResult<()> {
        if let Some(head) = head {
            report.checkpoint_advanced = tick.processed.advance(head, self.clock.now()).await?;
        }
        Ok(())
    }

    /// Verify one transfer and act on the verdict.
    /// `seen` is the attempt number and when the transfer was first observed.
    async fn evaluate(
        &self,
        tick: &mut TickState,
        summary: &TxSummary,
        detail: UtxoDetail,
        tip: u64,
        seen: (u32, DateTime<Utc>),
        report: &mut TickReport,
    ) {
        let config = &self.config;
        let transfer = match Transfer::from_explorer(summary, &detail, &config.deposit_address, tip) {
            Ok(transfer) => transfer,
            Err(e) => {
                debug!("⏭️ Skipping {}: {}", summary.tx_hash, e);
                report.rejected += 1;
                return;
            }
        };

        match self.verifier.verify(
            &transfer,
            config.required_amount,
            config.max_age,
            config.min_confirmations,
            None,
        ) {
            Verdict::Accepted => {
                if report.accepted > 0 {
                    tokio::time::sleep(config.transfer_spacing).await;
                }
                report.accepted += 1;
                self.accept(tick, transfer, report).await;
            }
            Verdict::Rejected(reason) if reason.is_retryable() => {
                debug!("⏳ {} waiting for confirmations ({})", transfer.tx_hash, reason);
                report.pending += 1;
                tick.pending.push(PendingTransfer {
                    summary: summary.clone(),
                    detail,
                    first_seen: seen.1,
                    attempts: seen.0,
                });
            }
            Verdict::Rejected(_) => {
                report.rejected += 1;
            }
        }
    }

    async fn accept(&self, tick: &mut TickState, transfer: Transfer, report: &mut TickReport) {
        info!(
            "💰 Accepted transfer {} of {} from {}",
            transfer.tx_hash, transfer.amount, transfer.from_address
        );

        let refund = self.issuer.refund_transfer(&transfer).await;

        if refund.success {
            let outcome = if refund.already_processed {
                ProcessedOutcome::Skipped
            } else {
                report.refunds_issued += 1;
                ProcessedOutcome::Refunded
            };
            if let Err(e) = tick.processed.mark(&transfer.tx_hash, outcome).await {
                error!("❌ Could not mark {} processed: {}", transfer.tx_hash, e);
            }
        } else {
            report.refund_failures += 1;
            self.push_error(format!(
                "Refund for {} failed: {}",
                transfer.tx_hash,
                refund.error.as_deref().unwrap_or("unknown error")
            ));
        }

        self.notify(transfer, refund, report);
    }

    fn notify(&self, transfer: Transfer, refund: RefundOutcome, report: &mut TickReport) {
        if self.listeners.is_empty() {
            return;
        }
        let event = TransferEvent {
            transfer,
            refund,
            observed_at: self.clock.now(),
        };
        report.listener_failures += self.listeners.notify(&event);
    }

    fn record_success(&self, tick: &TickState, report: &TickReport) {
        let mut shared = self.shared.lock();
        let stats = &mut shared.stats;
        stats.consecutive_failures = 0;
        stats.last_successful_poll = Some(self.clock.now());
        stats.transfers_accepted += report.accepted as u64;
        stats.transfers_rejected += report.rejected as u64;
        stats.refunds_issued += report.refunds_issued as u64;
        stats.refund_failures += report.refund_failures as u64;
        stats.listener_failures += report.listener_failures as u64;
        stats.pending_confirmations = tick.pending.len();

        shared.last_seen_tx_hash = tick.processed.last_seen().map(str::to_owned);
        shared.processed_count = tick.processed.len();

        if report.accepted > 0 || report.candidates > 0 {
            info!(
                "✓ Tick complete: {} new, {} accepted, {} refunded, {} pending",
                report.candidates, report.accepted, report.refunds_issued, report.pending
            );
        }
    }

    fn record_failure(&self, e: &ReconcileError) {
        let now = self.clock.now();
        let mut shared = self.shared.lock();
        shared.stats.consecutive_failures += 1;
        shared.stats.last_error = Some(e.to_string());

        if e.is_quota() {
            let window = chrono::Duration::from_std(self.config.cooldown)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            let until = now + window;
            shared.cooldown_until = Some(until);
            warn!("🚫 Explorer quota exceeded, pausing polling until {}: {}", until, e);
        } else {
            error!("❌ Deposit poll failed ({}): {}", e.kind(), e);
        }
        drop(shared);

        self.push_error(e.to_string());
    }

    fn push_error(&self, message: String) {
        let mut shared = self.shared.lock();
        if shared.recent_errors.len() >= RECENT_ERROR_LIMIT {
            shared.recent_errors.remove(0);
        }
        shared.recent_errors.push(message);
    }
}
