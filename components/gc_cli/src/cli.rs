//! Command-line arguments

use crate::error::{CliError, CliResult};
use crate::simulation::SimulationOptions;
use clap::Parser;
use gc_core::GcConfig;
use log::LevelFilter;
use std::path::PathBuf;

/// Drives the relocation engine over a synthetic mutator workload.
#[derive(Debug, Parser)]
#[command(name = "gc-sim", version, about)]
pub struct Cli {
    /// JSON collector configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Worker threads of the young generation pool
    #[arg(long)]
    pub young_workers: Option<usize>,

    /// Worker threads of the old generation pool
    #[arg(long)]
    pub old_workers: Option<usize>,

    /// Collection cycles to run
    #[arg(short = 'n', long, default_value_t = 10)]
    pub cycles: usize,

    /// Run a major collection every N cycles (0: minor collections only)
    #[arg(long, default_value_t = 4)]
    pub major_every: usize,

    /// Objects allocated between cycles
    #[arg(long, default_value_t = 2000)]
    pub objects: usize,

    /// Object size in bytes
    #[arg(long, default_value_t = 256)]
    pub object_size: usize,

    /// Share of new objects kept reachable
    #[arg(long, default_value_t = 0.3)]
    pub live_ratio: f64,

    /// Frames kept on the mutator stack
    #[arg(long, default_value_t = 64)]
    pub max_frames: usize,

    /// Seed of the workload generator
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Request collections from background driver threads
    #[arg(short, long)]
    pub background: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Log level selected by the verbosity flags.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Collector configuration: the config file if given, overridden by
    /// the worker flags.
    pub fn gc_config(&self) -> CliResult<GcConfig> {
        let mut config = match &self.config {
            Some(path) => GcConfig::from_json_file(path)?,
            None => GcConfig::default(),
        };
        if let Some(n) = self.young_workers {
            config.young_workers = n;
        }
        if let Some(n) = self.old_workers {
            config.old_workers = n;
        }
        config.validate()?;
        Ok(config)
    }

    /// Workload options.
    pub fn simulation_options(&self) -> CliResult<SimulationOptions> {
        if !(0.0..=1.0).contains(&self.live_ratio) {
            return Err(CliError::InvalidArgument(format!(
                "live ratio must be within 0..=1, got {}",
                self.live_ratio
            )));
        }
        if self.object_size == 0 {
            return Err(CliError::InvalidArgument("object size must be positive".into()));
        }
        Ok(SimulationOptions {
            cycles: self.cycles,
            major_every: self.major_every,
            objects: self.objects,
            object_size: self.object_size,
            live_ratio: self.live_ratio,
            max_frames: self.max_frames,
            seed: self.seed,
            background: self.background,
        })
    }
}
