#![forbid(unsafe_code)]
//! Shared identifiers, error type and checksum helpers.

use std::fmt;

use crate::storage::CountsKey;

/// Page-style checksum helpers used by the on-disk counts image.
pub mod checksum;

pub use checksum::{image_crc32, Checksum, Crc32Fast};

/// Identifier of a committed transaction as assigned by the transaction manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl TxId {
    /// Returns the next transaction id.
    pub const fn next(self) -> TxId {
        TxId(self.0 + 1)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxId {
    fn from(value: u64) -> Self {
        TxId(value)
    }
}

/// Transaction id of an empty database; no transaction has been committed yet.
pub const BASE_TX_ID: TxId = TxId(1);

/// Errors surfaced by the counts store and its index.
#[derive(thiserror::Error, Debug)]
pub enum CountsError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller broke an API invariant.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The counts file does not exist.
    #[error("counts store not found")]
    NotFound,
    /// A write or rebuild was requested on a read-only store.
    #[error("counts store is read-only: {0}")]
    ReadOnly(&'static str),
    /// The absolute count for a key is negative or was marked invalid on disk.
    #[error("The count value for key '{key}' is invalid. This is a serious error which is typically caused by a store corruption")]
    InvalidCount {
        /// Key whose count could not be produced.
        key: CountsKey,
    },
    /// A transaction id was recorded twice.
    #[error("transaction {tx_id} was already applied (highest gap-free id {highest_gap_free})")]
    Sequencing {
        /// The offending transaction id.
        tx_id: TxId,
        /// Gap-free watermark at the time of the violation.
        highest_gap_free: TxId,
    },
}

impl CountsError {
    /// Returns true when the error means the persisted state cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CountsError::Corruption(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CountsError>;
