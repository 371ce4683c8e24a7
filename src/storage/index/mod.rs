#![forbid(unsafe_code)]
//! Persistent sorted index holding absolute counts.
//!
//! The counts store only depends on the [`CountsIndex`] trait; [`FileCountsIndex`]
//! is the bundled implementation.

mod file;

pub use file::{FileCountsIndex, FORMAT_VERSION, HEADER_LEN, IMAGE_MAGIC};

use crate::storage::counts::EncodedKey;
use crate::types::{Result, TxId};

/// Persisted count value marking a key whose count went negative.
pub const INVALID_COUNT: i64 = -1;

/// Watermark of a checkpoint, stored in the index header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountsHeader {
    /// Highest gap-free transaction id whose changes are contained in the index.
    pub highest_gap_free: TxId,
    /// Transaction ids above the watermark whose changes are also contained.
    pub stray_tx_ids: Vec<TxId>,
}

/// A single mutation applied to the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexUpdate {
    /// Insert or overwrite a count.
    Put(EncodedKey, i64),
    /// Remove a count.
    Remove(EncodedKey),
}

/// Entries and header captured by [`CountsIndex::prepare_checkpoint`], ready to be
/// written by [`CountsIndex::commit_checkpoint`].
#[derive(Debug)]
pub struct PreparedCheckpoint {
    /// Header the image carries.
    pub header: CountsHeader,
    /// Serialized image.
    pub image: Vec<u8>,
}

/// Contract the counts store needs from its backing index.
///
/// Keys are fixed-width and compare byte-wise; `scan` visits them ascending.
/// Mutations become durable only through a checkpoint. A checkpoint captures the
/// entries in [`CountsIndex::prepare_checkpoint`] and writes them in
/// [`CountsIndex::commit_checkpoint`], so later mutations can land while the
/// write is in flight.
pub trait CountsIndex: Send + Sync {
    /// Looks up the stored count for `key`.
    fn get(&self, key: &EncodedKey) -> Result<Option<i64>>;

    /// Visits every entry in ascending key order until `visitor` returns false.
    fn scan(&self, visitor: &mut dyn FnMut(&EncodedKey, i64) -> bool) -> Result<()>;

    /// Applies a batch of puts and removes atomically with respect to readers.
    fn apply(&self, updates: &[IndexUpdate]) -> Result<()>;

    /// Drops every entry and the header.
    fn clear(&self) -> Result<()>;

    /// Header written by the last checkpoint, if any.
    fn header(&self) -> Option<CountsHeader>;

    /// Captures the current entries together with `header`.
    fn prepare_checkpoint(&self, header: &CountsHeader) -> Result<PreparedCheckpoint>;

    /// Durably persists a prepared checkpoint and makes its header current.
    fn commit_checkpoint(&self, prepared: PreparedCheckpoint) -> Result<()>;

    /// Durably persists the current entries together with `header`.
    fn checkpoint(&self, header: &CountsHeader) -> Result<()> {
        let prepared = self.prepare_checkpoint(header)?;
        self.commit_checkpoint(prepared)
    }

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Returns true when no entries are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases the index; later calls fail.
    fn close(&self) -> Result<()>;
}
