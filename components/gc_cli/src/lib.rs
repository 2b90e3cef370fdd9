//! Relocation engine simulation CLI library
//!
//! Provides argument parsing and the synthetic workload driving the
//! collector.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod error;
pub mod simulation;

pub use cli::Cli;
pub use error::{CliError, CliResult};
pub use simulation::{CycleSummary, Simulation, SimulationOptions, SimulationReport};
