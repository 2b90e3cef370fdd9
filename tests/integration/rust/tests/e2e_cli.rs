//! End-to-End CLI Integration Tests
//!
//! Tests the simulator through its argument parser and the Simulation API.
//! This is the highest level integration test: arguments to final report.

use clap::Parser as ClapParser;
use gc_cli::{Cli, CliError, Simulation};

fn run(args: &[&str]) -> Result<gc_cli::SimulationReport, CliError> {
    let cli = Cli::try_parse_from(args).expect("arguments");
    let mut simulation = Simulation::new(cli.gc_config()?, cli.simulation_options()?)?;
    simulation.run()
}

/// Test: Default-sized run with small worker pools
#[test]
fn test_e2e_default_workload() {
    let report = run(&["gc-sim", "--young-workers", "2", "--old-workers", "1", "-n", "8"]).unwrap();

    assert_eq!(report.minor_collections, 6);
    assert_eq!(report.major_collections, 2);
    // Two cycles per major collection
    assert_eq!(report.cycles.len(), 10);
    assert_eq!(report.allocated_objects, 8 * 2000);
    assert!(report.total_relocated() > 0);
    assert!(report.total_promoted() > 0);
}

/// Test: Large objects take their own regions and are never copied
#[test]
fn test_e2e_large_objects() {
    let report = run(&[
        "gc-sim",
        "-n",
        "3",
        "--major-every",
        "0",
        "--objects",
        "20",
        "--object-size",
        "8388608",
        "--live-ratio",
        "0.5",
    ])
    .unwrap();

    assert_eq!(report.minor_collections, 3);
    assert_eq!(report.total_relocated(), 0);
    assert!(report.total_reclaimed() > 0);
}

/// Test: Background drivers produce the same collection counts
#[test]
fn test_e2e_background() {
    let report = run(&["gc-sim", "-b", "-n", "6", "--major-every", "3", "--objects", "500"]).unwrap();

    assert_eq!(report.minor_collections, 4);
    assert_eq!(report.major_collections, 2);
}

/// Test: Heap pressure stalls allocation until a collection frees space
#[test]
fn test_e2e_allocation_stalls() {
    let dir = std::env::temp_dir().join(format!("gc-sim-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("small.json");
    // 16 granules of 2 MiB, medium regions of 4 MiB
    std::fs::write(
        &path,
        r#"{ "heap_capacity": 33554432, "medium_region_size": 4194304, "young_workers": 1, "old_workers": 1 }"#,
    )
    .unwrap();

    let report = run(&[
        "gc-sim",
        "-c",
        path.to_str().unwrap(),
        "-n",
        "2",
        "--major-every",
        "0",
        "--objects",
        "20000",
        "--object-size",
        "4096",
        "--live-ratio",
        "0.01",
    ]);
    std::fs::remove_dir_all(&dir).unwrap();

    let report = report.unwrap();
    assert!(report.allocation_stalls > 0);
    assert!(report.minor_collections as usize >= 2 + report.allocation_stalls);
    assert!(report.heap_used <= report.heap_capacity);
}

/// Test: JSON report carries the cycle table
#[test]
fn test_e2e_json_report() {
    let report = run(&["gc-sim", "-n", "4", "--objects", "200", "--json"]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

    let cycles = value["cycles"].as_array().unwrap();
    assert_eq!(cycles.len(), 5);
    assert_eq!(cycles[4]["generation"], "Old");
    assert_eq!(cycles[4]["kind"], "major");
    assert_eq!(cycles[4]["seqnum"], 1);
}

/// Test: Invalid arguments are reported before any collection runs
#[test]
fn test_e2e_invalid_arguments() {
    assert!(matches!(
        run(&["gc-sim", "--live-ratio=-0.5"]),
        Err(CliError::InvalidArgument(_))
    ));
    assert!(matches!(
        run(&["gc-sim", "--young-workers", "0"]),
        Err(CliError::Gc(_))
    ));
}
