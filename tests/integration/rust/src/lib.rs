//! Integration test suite for the relocation engine
//!
//! This crate provides integration tests that verify the components work
//! together correctly across component boundaries.

/// Re-export components for test convenience
pub mod components {
    pub use gc_cli;
    pub use gc_core;
    pub use gc_types;
}
