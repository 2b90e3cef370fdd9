//! Relocation engine simulation CLI
//!
//! Entry point of the simulator. Parses CLI arguments, sets up logging and
//! runs the workload.

use clap::Parser as ClapParser;
use gc_cli::{Cli, CliError, CliResult, Simulation};
use log::error;

fn run(cli: &Cli) -> CliResult<()> {
    let config = cli.gc_config()?;
    let options = cli.simulation_options()?;
    let mut simulation = Simulation::new(config, options)?;
    let report = simulation.run()?;

    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    if let Err(err) = run(&cli) {
        error!("{}", err);
        match &err {
            CliError::Io(e) => eprintln!("Error: Could not read file: {}", e),
            CliError::StackMismatch { .. } => eprintln!("Internal error: {}", err),
            _ => eprintln!("Error: {}", err),
        }
        std::process::exit(1);
    }
}
