//! Error types for the CLI

use gc_types::GcError;
use thiserror::Error;

/// CLI-specific errors
#[derive(Debug, Error)]
pub enum CliError {
    /// Collector error
    #[error("GC error: {0}")]
    Gc(#[from] GcError),

    /// File I/O error
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    /// Report serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Argument combination rejected before running
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A background driver thread went away
    #[error("Driver thread exited before replying")]
    DriverGone,

    /// A mutator stack disagreed with the healed root set
    #[error("Stack check failed after cycle {cycle}: {detail}")]
    StackMismatch {
        /// Cycle after which the check ran
        cycle: usize,
        /// What differed
        detail: String,
    },
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
