use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::TxId;

/// Sink for counts store activity.
///
/// Implementations record how often transactions were skipped as already applied,
/// how often the store was rebuilt, and how much work checkpoints and cache flushes
/// did. All methods are called from hot paths and must not block.
pub trait CountsMetrics: Send + Sync {
    /// Records that an updater request for `tx_id` was ignored.
    fn ignored_transaction(&self, tx_id: TxId);

    /// Records a full rebuild of the persisted counts.
    fn rebuild(&self);

    /// Records a completed checkpoint that merged `merged_keys` changed keys.
    fn checkpoint(&self, merged_keys: usize);

    /// Records a merge triggered by the live generation growing too large.
    fn cache_flush(&self, merged_keys: usize);
}

/// A no-op implementation of [`CountsMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl CountsMetrics for NoopMetrics {
    fn ignored_transaction(&self, _tx_id: TxId) {}
    fn rebuild(&self) {}
    fn checkpoint(&self, _merged_keys: usize) {}
    fn cache_flush(&self, _merged_keys: usize) {}
}

/// A thread-safe counter-based implementation of [`CountsMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of updater requests skipped because the id was already applied or
    /// the store awaited recovery.
    pub ignored_transactions: AtomicU64,

    /// Number of rebuilds.
    pub rebuilds: AtomicU64,

    /// Number of checkpoints.
    pub checkpoints: AtomicU64,

    /// Number of cache-size triggered merges.
    pub cache_flushes: AtomicU64,

    /// Total keys merged into the index by checkpoints and cache flushes.
    pub merged_keys: AtomicU64,
}

impl CountsMetrics for CounterMetrics {
    fn ignored_transaction(&self, _tx_id: TxId) {
        self.ignored_transactions.fetch_add(1, Ordering::Relaxed);
    }

    fn rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint(&self, merged_keys: usize) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.merged_keys
            .fetch_add(merged_keys as u64, Ordering::Relaxed);
    }

    fn cache_flush(&self, merged_keys: usize) {
        self.cache_flushes.fetch_add(1, Ordering::Relaxed);
        self.merged_keys
            .fetch_add(merged_keys as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`], wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn CountsMetrics> {
    Arc::new(NoopMetrics)
}
