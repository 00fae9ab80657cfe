//! Error types for Tessera
//!
//! This module defines the error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Programming-invariant violations (for example releasing a claim that is
//! not held) are not represented here: they panic at the call site.

use std::io;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Tessera engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, malformed page)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A concurrent transaction wrote the same key; the caller must roll back
    /// and retry.
    #[error("Write-write conflict on {0}")]
    WriteConflict(String),

    /// A claim or wait could not be satisfied in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The journal was written by an incompatible format version
    #[error("Incompatible journal format: expected version {expected}, found {found}")]
    IncompatibleJournal {
        /// Version this build understands
        expected: u32,
        /// Version found on disk
        found: u32,
    },

    /// A page or record refers to a volume that is not open
    #[error("Missing volume: {0}")]
    MissingVolume(String),

    /// The database or journal has been closed
    #[error("Database is closed")]
    Closed,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transaction was rolled back and cannot continue
    #[error("Transaction rolled back: {0}")]
    Rollback(String),
}

impl Error {
    /// Short name of the error variant.
    ///
    /// Background tasks compare kinds to decide whether a failure is new
    /// enough to log.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::Serialization(_) => "Serialization",
            Error::Corruption(_) => "Corruption",
            Error::InvalidOperation(_) => "InvalidOperation",
            Error::WriteConflict(_) => "WriteConflict",
            Error::Timeout(_) => "Timeout",
            Error::IncompatibleJournal { .. } => "IncompatibleJournal",
            Error::MissingVolume(_) => "MissingVolume",
            Error::Closed => "Closed",
            Error::Config(_) => "Config",
            Error::Rollback(_) => "Rollback",
        }
    }

    /// Whether the caller can reasonably retry the operation in a new
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriteConflict(_) | Error::Timeout(_) | Error::Rollback(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
