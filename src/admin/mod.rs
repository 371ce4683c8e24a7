#![forbid(unsafe_code)]

//! Administrative utilities for counts files.

mod dump;
mod error;

/// Human-readable dump of a counts file.
pub use dump::{dump, DumpReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};
