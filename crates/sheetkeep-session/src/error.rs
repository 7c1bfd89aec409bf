//! Error types for session state operations.
//!
//! Boundary violations (undo at the first checkpoint, lookups of unknown
//! ids) and access to disposed sessions are not errors: those paths return
//! `false` or `None`. `Error` covers swap I/O, codecs and cache calls,
//! which the directory absorbs with logging.

use crate::sheet::SheetKind;

/// Error type for session state operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Swap file or directory I/O failed.
    #[error("Swap I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding session state failed.
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// No decoder registered for a sheet kind.
    #[error("No decoder registered for sheet kind: {0}")]
    UnknownKind(SheetKind),

    /// A swap file header did not carry a known sheet kind.
    #[error("Corrupt swap file: {0}")]
    CorruptSwap(String),

    /// A sheet failed to serialize or deserialize itself.
    #[error("Sheet error: {0}")]
    Sheet(String),

    /// The distributed cache rejected or failed a call.
    #[error("Distributed cache error: {0}")]
    Cache(String),

    /// Session was not found in either tier.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] sheetkeep_config::ConfigError),

    /// Tracing subscriber setup failed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

/// Result type for session state operations.
pub type Result<T> = std::result::Result<T, Error>;
