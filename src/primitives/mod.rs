//! Low-level primitives for building the counts store.
//!
//! Includes byte utilities, positioned file I/O and concurrency controls.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving integer encoders used by the key layout and the on-disk image.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// The out-of-order transaction id sequence backing idempotent replay.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;
