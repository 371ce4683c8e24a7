use std::path::{Path, PathBuf};

use crate::types::CountsError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Counts file not found at the specified path.
    #[error("counts store not found: {0}")]
    MissingStore(PathBuf),
    /// Counts store error.
    #[error(transparent)]
    Counts(CountsError),
    /// I/O error, typically from the output sink.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_store(path: impl AsRef<Path>) -> Self {
        AdminError::MissingStore(path.as_ref().to_path_buf())
    }
}

impl From<CountsError> for AdminError {
    fn from(err: CountsError) -> Self {
        match err {
            CountsError::Io(io) => AdminError::Io(io),
            other => AdminError::Counts(other),
        }
    }
}
