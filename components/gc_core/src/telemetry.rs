//! Observational hooks.
//!
//! The engine reports phase switches, worker resizes and cycle summaries to a
//! [`Telemetry`] sink. Sinks only observe: swapping [`NoopTelemetry`] for
//! [`LogTelemetry`] (or a recording sink in tests) never changes what the
//! collector does.

use crate::collector::{CycleStats, Phase};
use gc_types::GenerationId;
use log::{debug, info};
use std::time::Duration;

/// Receiver of collector events. Every method defaults to doing nothing.
pub trait Telemetry: Send + Sync {
    /// A generation switched phase.
    fn phase_switch(&self, _generation: GenerationId, _from: Phase, _to: Phase) {}

    /// A generation's active worker count changed.
    fn workers_resized(&self, _generation: GenerationId, _from: usize, _to: usize) {}

    /// A relocation set was installed.
    fn relocation_set_installed(&self, _generation: GenerationId, _nforwardings: usize, _arena_bytes: usize) {}

    /// A worker task finished.
    fn task_completed(&self, _generation: GenerationId, _task: &str, _elapsed: Duration) {}

    /// A cycle finished relocating.
    fn cycle_end(&self, _stats: &CycleStats) {}
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

/// Sink that forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn phase_switch(&self, generation: GenerationId, from: Phase, to: Phase) {
        info!("{} phase: {} -> {}", generation, from, to);
    }

    fn workers_resized(&self, generation: GenerationId, from: usize, to: usize) {
        info!("{} workers: {} -> {}", generation, from, to);
    }

    fn relocation_set_installed(&self, generation: GenerationId, nforwardings: usize, arena_bytes: usize) {
        debug!(
            "{} relocation set: {} forwardings, {} arena bytes",
            generation, nforwardings, arena_bytes
        );
    }

    fn task_completed(&self, generation: GenerationId, task: &str, elapsed: Duration) {
        debug!("{} task {} took {:?}", generation, task, elapsed);
    }

    fn cycle_end(&self, stats: &CycleStats) {
        info!(
            "{} cycle {}: reclaimed {}B relocated {}B promoted {}B ({} forwardings, {} in place) in {:?}",
            stats.generation,
            stats.seqnum,
            stats.reclaimed,
            stats.relocated,
            stats.promoted,
            stats.nforwardings,
            stats.in_place,
            stats.duration
        );
    }
}
