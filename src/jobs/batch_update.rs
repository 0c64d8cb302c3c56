//! Background job: coalesce quota deltas and flush them periodically.
//!
//! When batch mode is on, the ledger appends signed deltas here instead of
//! writing through. Every interval the job swaps the accumulator for an empty
//! one under the lock, then applies each summed delta as a single relative
//! update. Appends that race with a flush land in the fresh map and go out
//! with the next tick; deltas whose write fails are re-queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::store::RelayStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchKind {
    TokenQuota,
    UserQuota,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub requeued: usize,
}

pub struct BatchUpdater {
    pending: Mutex<HashMap<(BatchKind, i64), i64>>,
    store: Arc<dyn RelayStore>,
}

impl BatchUpdater {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(BatchKind, i64), i64>> {
        // A panic while holding the lock cannot leave a half-written i64.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accumulate a signed delta (positive charges, negative refunds).
    pub fn add(&self, kind: BatchKind, id: i64, delta: i64) {
        if delta == 0 {
            return;
        }
        *self.lock().entry((kind, id)).or_insert(0) += delta;
    }

    /// Net delta not yet written for one key.
    pub fn pending(&self, kind: BatchKind, id: i64) -> i64 {
        self.lock().get(&(kind, id)).copied().unwrap_or(0)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }

    /// Drain the current accumulator and write it out.
    pub async fn flush(&self) -> FlushReport {
        let snapshot = std::mem::take(&mut *self.lock());
        let mut report = FlushReport::default();

        for ((kind, id), delta) in snapshot {
            if delta == 0 {
                continue;
            }
            let result = match kind {
                BatchKind::TokenQuota => self.store.adjust_token_quota(id, delta).await,
                BatchKind::UserQuota => self.store.adjust_user_quota(id, delta).await,
            };
            match result {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::error!(?kind, id, delta, "batch flush failed, re-queued: {}", e);
                    self.add(kind, id, delta);
                    report.requeued += 1;
                }
            }
        }

        if report.applied > 0 || report.requeued > 0 {
            tracing::debug!(
                applied = report.applied,
                requeued = report.requeued,
                "batch update flushed"
            );
        }
        report
    }
}

/// Spawn the periodic flush task. Call this once at startup.
pub fn spawn(updater: Arc<BatchUpdater>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            updater.flush().await;
        }
    })
}
