//! Background write queue for the slower tiers.
//!
//! L2 and L3 writes never sit on the read path: the coordinator schedules
//! them here and one worker task applies them in submission order, so a put
//! followed by an invalidate of the same key lands in that order. When the
//! queue is full new writes are dropped and counted.
//!
//! Keys with a queued but unapplied delete are tracked so readers can avoid
//! resurrecting a value the slower tiers still hold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::entry::{CacheEntry, Tier};
use crate::cache::tier::CacheTier;
use crate::metrics::{MetricEvent, SharedMetrics};

/// A scheduled tier operation.
#[derive(Debug)]
pub enum WriteOp {
    Put { tier: Tier, entry: CacheEntry },
    Delete { tier: Tier, key: String },
    /// Resolves once every op queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

impl WriteOp {
    fn describe(&self) -> (&'static str, Option<Tier>, &str) {
        match self {
            WriteOp::Put { tier, entry } => ("put", Some(*tier), entry.key.as_str()),
            WriteOp::Delete { tier, key } => ("delete", Some(*tier), key.as_str()),
            WriteOp::Flush(_) => ("flush", None, ""),
        }
    }
}

/// Outstanding delete count per key.
#[derive(Debug, Default)]
struct PendingDeletes(Mutex<HashMap<String, usize>>);

impl PendingDeletes {
    fn mark(&self, key: &str) {
        *self.0.lock().entry(key.to_string()).or_insert(0) += 1;
    }

    fn clear(&self, key: &str) {
        let mut pending = self.0.lock();
        if let Some(count) = pending.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                pending.remove(key);
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.0.lock().contains_key(key)
    }
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    pending_deletes: PendingDeletes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteQueueStats {
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
}

/// The tiers a worker writes to, indexed by kind.
#[derive(Clone, Default)]
pub struct WriteTargets {
    pub disk: Option<Arc<dyn CacheTier>>,
    pub remote: Option<Arc<dyn CacheTier>>,
}

impl WriteTargets {
    fn get(&self, tier: Tier) -> Option<&Arc<dyn CacheTier>> {
        match tier {
            Tier::Disk => self.disk.as_ref(),
            Tier::Remote => self.remote.as_ref(),
            Tier::Memory | Tier::Upstream => None,
        }
    }
}

/// Handle for scheduling writes. Cheap to clone.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteOp>,
    counters: Arc<Counters>,
    metrics: SharedMetrics,
}

impl WriteQueue {
    /// Start the worker. Must be called from within a tokio runtime.
    ///
    /// The worker exits once every handle has been dropped and the queue
    /// is drained.
    pub fn spawn(capacity: usize, targets: WriteTargets, metrics: SharedMetrics) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run(rx, targets, counters.clone(), metrics.clone()));
        (Self { tx, counters, metrics }, worker)
    }

    /// Queue a write without waiting. Returns false if it was dropped.
    pub fn schedule(&self, op: WriteOp) -> bool {
        // Marked before sending so the worker cannot clear it first.
        if let WriteOp::Delete { key, .. } = &op {
            self.counters.pending_deletes.mark(key);
        }
        let (op, reason) = match self.tx.try_send(op) {
            Ok(()) => {
                self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(mpsc::error::TrySendError::Full(op)) => {
                self.metrics.record(MetricEvent::WriteQueueDropped);
                (op, "Write queue full, dropping background write")
            }
            Err(mpsc::error::TrySendError::Closed(op)) => (op, "Write worker stopped, dropping background write"),
        };
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        if let WriteOp::Delete { key, .. } = &op {
            self.counters.pending_deletes.clear(key);
        }
        let (kind, tier, key) = op.describe();
        warn!(op = kind, tier = ?tier, key = %key, "{}", reason);
        false
    }

    /// Wait until everything scheduled before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Whether a delete of `key` has been queued and not yet applied.
    pub fn delete_pending(&self, key: &str) -> bool {
        self.counters.pending_deletes.contains(key)
    }

    pub fn stats(&self) -> WriteQueueStats {
        WriteQueueStats {
            total_scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            total_completed: self.counters.completed.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            total_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<WriteOp>,
    targets: WriteTargets,
    counters: Arc<Counters>,
    metrics: SharedMetrics,
) {
    while let Some(op) = rx.recv().await {
        let (tier, result) = match op {
            WriteOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            WriteOp::Put { tier, entry } => {
                let Some(target) = targets.get(tier) else {
                    continue;
                };
                let key = entry.key.clone();
                let result = target.put(entry).await;
                debug!(tier = %tier, key = %key, ok = result.is_ok(), "Background put");
                (tier, result)
            }
            WriteOp::Delete { tier, key } => {
                let Some(target) = targets.get(tier) else {
                    counters.pending_deletes.clear(&key);
                    continue;
                };
                let result = target.delete(&key).await;
                counters.pending_deletes.clear(&key);
                debug!(tier = %tier, key = %key, ok = result.is_ok(), "Background delete");
                (tier, result)
            }
        };

        match result {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics.record(MetricEvent::TierError(tier));
                warn!(tier = %tier, error = %e, "Background tier write failed");
            }
        }
    }
    debug!("Write queue worker exiting");
}
