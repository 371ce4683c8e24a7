//! Transactional aggregate counts for a graph storage engine.
//!
//! Keeps node counts per label and relationship counts per
//! `(start label, type, end label)` triple next to the graph, so they can be read
//! without scanning it. Transactions add deltas through [`storage::CountUpdater`]s,
//! checkpoints merge them into a persistent sorted index, and a caller supplied
//! [`storage::Rebuilder`] recreates everything when the persisted state is missing,
//! damaged or out of step.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{
    node_key, relationship_key, CheckpointStats, CountUpdater, CountsKey, CountsStore,
    CountsStoreOptions, Rebuilder, EMPTY_REBUILD,
};
pub use types::{CountsError, Result, TxId, BASE_TX_ID};
