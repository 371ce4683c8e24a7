//! Counts storage engine.
//!
//! Maintains aggregate node and relationship counts over a persistent sorted
//! index, with transactional apply, checkpointing and rebuild-based recovery.

/// Keys, change generations, updaters and the store itself.
pub mod counts;

/// Persistent sorted index contract and its file-backed implementation.
pub mod index;

mod metrics;
mod options;

pub use counts::{
    node_key, relationship_key, CheckpointStats, CountUpdater, CountsChanges, CountsKey,
    CountsStore, EmptyRebuild, EncodedKey, KeyLayout, Rebuilder, ABSENT, ANY_LABEL,
    ANY_RELATIONSHIP_TYPE, EMPTY_REBUILD, KEY_LEN, NEEDS_REBUILDING_HIGH_ID,
};
pub use index::{
    CountsHeader, CountsIndex, FileCountsIndex, IndexUpdate, PreparedCheckpoint, INVALID_COUNT,
};
pub use metrics::{default_metrics, CounterMetrics, CountsMetrics, NoopMetrics};
pub use options::{CountsStoreOptions, DEFAULT_MAX_CACHE_SIZE};
