use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use crate::deposit::RefundOutcome;
use crate::ledger::models::Transfer;

/// Emitted once per accepted transfer, after the refund attempt
#[derive(Debug, Clone, Serialize)]
pub struct TransferEvent {
    pub transfer: Transfer,
    pub refund: RefundOutcome,
    pub observed_at: DateTime<Utc>,
}

pub type TransferListener = Arc<dyn Fn(&TransferEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, TransferListener)>,
}

/// Ordered set of transfer listeners owned by one monitor
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<ListenerSet>>,
}

/// Capability to remove one listener.
///
/// Dropping it keeps the listener registered; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<ListenerSet>>,
}

impl Subscription {
    /// Returns `false` if the listener was already gone
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut set = registry.lock();
        let before = set.entries.len();
        set.entries.retain(|(id, _)| *id != self.id);
        set.entries.len() != before
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TransferEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut set = self.inner.lock();
        set.next_id += 1;
        let id = set.next_id;
        set.entries.push((id, Arc::new(listener)));
        debug!("Listener {} registered ({} total)", id, set.entries.len());

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener in registration order.
    ///
    /// Errors and panics are logged per listener and never reach the caller.
    /// The set is snapshotted first, so listeners may (un)register freely.
    pub fn notify(&self, event: &TransferEvent) -> usize {
        let snapshot: Vec<(u64, TransferListener)> = self.inner.lock().entries.clone();
        let mut failures = 0;

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("❌ Listener {} failed for {}: {:#}", id, event.transfer.tx_hash, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("🚨 Listener {} panicked for {}", id, event.transfer.tx_hash);
                }
            }
        }

        failures
    }
}
