//! Concurrent relocation engine of a generational, region-based collector.
//!
//! This component provides:
//! - Per-generation worker pools with resizable active thread counts
//! - Relocation set selection, installation and teardown
//! - Forwarding records and the granule-indexed forwarding table
//! - The relocation queue coordinating workers and mutator threads
//! - The old-to-young remembered set scanned by young marking
//! - Stack watermark barriers for incremental stack processing
//! - The per-generation collector phase state machine and its driver
//!
//! # Overview
//!
//! - [`GcContext`] - Owns the collectors of both generations
//! - [`Collector`] - Phase state machine of one generation
//! - [`Driver`] - Runs minor and major collections
//! - [`WorkerPool`] - Named GC worker threads of one generation
//! - [`RelocationSet`] - Forwarding records of one cycle
//! - [`RelocateQueue`] - Hand-off of records between mutators and workers
//! - [`StackWatermarkSet`] - Per-thread watermark barriers
//! - [`RegionHeap`] - Region allocator with deferred reclamation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod arena;
pub mod collector;
pub mod config;
pub mod context;
pub mod driver;
pub mod forwarding;
pub mod forwarding_table;
pub mod mark;
pub mod mutator;
pub mod relocate;
pub mod relocation_set;
pub mod remembered;
pub mod selector;
pub mod stack_watermark;
pub mod telemetry;
pub mod workers;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use allocator::{RegionAllocator, RegionHeap};
pub use arena::ForwardingArena;
pub use collector::{Collector, CycleStats, Generation, Phase};
pub use config::GcConfig;
pub use context::GcContext;
pub use driver::{Collection, CollectionKind, Driver, DriverThread, MajorCycleStats};
pub use forwarding::{Forwarding, ForwardingRef};
pub use forwarding_table::ForwardingTable;
pub use mark::{MarkEngine, RootSetMarker};
pub use mutator::{MutatorThread, RelocationWatermark, Remapper};
pub use relocate::{compute_to_age, Polled, QueueParticipant, Relocate, RelocateOps, RelocateQueue};
pub use relocation_set::{RelocationSet, RelocationSetParallelIterator};
pub use remembered::RememberedSet;
pub use selector::{RelocationSetSelector, Selection};
pub use stack_watermark::{Frame, StackWatermark, StackWatermarkSet, WatermarkFixup, WatermarkKind};
pub use telemetry::{LogTelemetry, NoopTelemetry, Telemetry};
pub use workers::{
    current_worker, is_gc_worker, GatherBarrier, RestartableTask, TaskFn, WorkerContext,
    WorkerPool, WorkerTask,
};
