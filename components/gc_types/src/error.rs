//! Error types for the relocation engine.
//!
//! Runtime failures are reported through [`GcError`]. Programming-contract
//! violations (duplicate promotion registration, out-of-bounds forwarding
//! slots, polling an unjoined queue) are not errors: they panic.

use crate::GenerationId;
use thiserror::Error;

/// Errors surfaced by the collector.
#[derive(Debug, Error)]
pub enum GcError {
    /// Configuration value rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Fewer worker threads started than were requested
    #[error("failed to create {pool}: started {started} of {requested} worker threads")]
    WorkerStartup {
        /// Name of the pool
        pool: String,
        /// Requested thread count
        requested: usize,
        /// Threads that actually started
        started: usize,
    },

    /// An operation was invoked in the wrong collector phase
    #[error("{generation} collector cannot {operation} in phase {phase}")]
    PhaseViolation {
        /// Generation whose state machine rejected the call
        generation: GenerationId,
        /// Operation that was attempted
        operation: &'static str,
        /// Phase the collector was in
        phase: &'static str,
    },

    /// A cycle was started while another one is in flight
    #[error("{0} collection already in progress")]
    CycleInProgress(GenerationId),

    /// The allocator cannot supply another region
    #[error("heap exhausted: cannot allocate {requested} bytes")]
    HeapExhausted {
        /// Size of the failed request
        requested: usize,
    },

    /// I/O failure while loading configuration
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for collector operations.
pub type GcResult<T> = Result<T, GcError>;
