//! Stand-in collaborators for tests.
//!
//! Compiled for this crate's unit tests and, through the `testing` feature,
//! for integration tests of dependent crates.

use crate::allocator::{RegionAllocator, RegionHeap};
use crate::collector::{CycleStats, Phase};
use crate::config::GcConfig;
use crate::mark::MarkEngine;
use crate::telemetry::Telemetry;
use crate::workers::WorkerPool;
use gc_types::{Address, GcResult, GenerationId, Region, RegionAge, RegionId, SizeClass, GRANULE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a heap of `granules` granules with two-granule medium
/// regions and a single static worker per generation.
pub fn small_heap_config(granules: usize) -> GcConfig {
    GcConfig {
        young_workers: 1,
        old_workers: 1,
        dynamic_workers: false,
        medium_region_size: 2 * GRANULE_SIZE,
        heap_capacity: granules * GRANULE_SIZE,
        ..GcConfig::default()
    }
}

/// Allocates `nregions` fresh regions and fills each with `objects` objects
/// of `object_size` bytes.
///
/// # Panics
///
/// Panics if the heap or a region runs out of space.
pub fn populate(
    heap: &RegionHeap,
    size_class: SizeClass,
    age: RegionAge,
    nregions: usize,
    objects: usize,
    object_size: usize,
) -> Vec<Arc<Region>> {
    (0..nregions)
        .map(|_| {
            let region = heap
                .alloc_region(size_class, age)
                .unwrap_or_else(|err| panic!("populate: {}", err));
            for _ in 0..objects {
                if region.alloc_object(object_size).is_none() {
                    panic!("populate: {} is full", region.id());
                }
            }
            region
        })
        .collect()
}

/// Spawns a pool whose thread creation stops after `spawn_limit` threads.
pub fn spawn_limited_pool(
    generation: GenerationId,
    nworkers: usize,
    spawn_limit: usize,
) -> GcResult<WorkerPool> {
    WorkerPool::spawn(generation, nworkers, false, spawn_limit)
}

/// Mark engine that marks a fixed share of every region's objects.
///
/// Object `i` of a region is live when `(i * ratio).fract() < ratio`, which
/// spreads the live objects evenly. The ratio can be overridden per region.
pub struct ScriptedMarkEngine {
    ratio: f64,
    overrides: Mutex<HashMap<RegionId, f64>>,
    regions: Mutex<HashMap<GenerationId, Vec<Arc<Region>>>>,
    try_end_failures: AtomicUsize,
    mark_starts: AtomicUsize,
    roots_calls: AtomicUsize,
    follow_calls: AtomicUsize,
    try_end_calls: AtomicUsize,
    non_strong_calls: AtomicUsize,
    remap_calls: AtomicUsize,
    promotions: Mutex<Vec<Address>>,
}

impl ScriptedMarkEngine {
    /// Creates an engine marking `ratio` of the objects live.
    pub fn new(ratio: f64) -> Self {
        ScriptedMarkEngine {
            ratio,
            overrides: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            try_end_failures: AtomicUsize::new(0),
            mark_starts: AtomicUsize::new(0),
            roots_calls: AtomicUsize::new(0),
            follow_calls: AtomicUsize::new(0),
            try_end_calls: AtomicUsize::new(0),
            non_strong_calls: AtomicUsize::new(0),
            remap_calls: AtomicUsize::new(0),
            promotions: Mutex::new(Vec::new()),
        }
    }

    /// Uses `ratio` for `region` instead of the default.
    pub fn set_region_ratio(&self, region: RegionId, ratio: f64) {
        self.overrides.lock().insert(region, ratio);
    }

    /// Makes the next `n` calls to `try_end` report pending work.
    pub fn fail_try_end(&self, n: usize) {
        self.try_end_failures.store(n, Ordering::Release);
    }

    /// Number of `mark_start` calls.
    pub fn mark_starts(&self) -> usize {
        self.mark_starts.load(Ordering::Acquire)
    }

    /// Number of `mark_roots` calls.
    pub fn roots_calls(&self) -> usize {
        self.roots_calls.load(Ordering::Acquire)
    }

    /// Number of `mark_follow` calls.
    pub fn follow_calls(&self) -> usize {
        self.follow_calls.load(Ordering::Acquire)
    }

    /// Number of `try_end` calls.
    pub fn try_end_calls(&self) -> usize {
        self.try_end_calls.load(Ordering::Acquire)
    }

    /// Number of `process_non_strong_references` calls.
    pub fn non_strong_calls(&self) -> usize {
        self.non_strong_calls.load(Ordering::Acquire)
    }

    /// Number of `roots_remap` calls.
    pub fn remap_calls(&self) -> usize {
        self.remap_calls.load(Ordering::Acquire)
    }

    /// Objects reported through `remember_promoted`, in call order.
    pub fn promotions(&self) -> Vec<Address> {
        self.promotions.lock().clone()
    }

    fn mark_region(&self, region: &Region) {
        let ratio = self
            .overrides
            .lock()
            .get(&region.id())
            .copied()
            .unwrap_or(self.ratio);
        for (i, object) in region.objects().into_iter().enumerate() {
            if (i as f64 * ratio).fract() < ratio {
                region.mark_live(object.addr, object.size);
            }
        }
    }
}

impl MarkEngine for ScriptedMarkEngine {
    fn mark_start(&self, generation: GenerationId, regions: &[Arc<Region>]) {
        self.mark_starts.fetch_add(1, Ordering::AcqRel);
        for region in regions {
            region.clear_live();
        }
        self.regions.lock().insert(generation, regions.to_vec());
    }

    fn mark_roots(&self, _generation: GenerationId, _workers: &WorkerPool) {
        self.roots_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn mark_follow(&self, generation: GenerationId, _workers: &WorkerPool) -> bool {
        self.follow_calls.fetch_add(1, Ordering::AcqRel);
        let regions = self.regions.lock().remove(&generation).unwrap_or_default();
        for region in &regions {
            self.mark_region(region);
        }
        true
    }

    fn try_end(&self, _generation: GenerationId) -> bool {
        self.try_end_calls.fetch_add(1, Ordering::AcqRel);
        self.try_end_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
    }

    fn process_non_strong_references(&self) {
        self.non_strong_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn remember_promoted(&self, obj: Address) {
        self.promotions.lock().push(obj);
    }

    fn roots_remap(&self, _remap: &dyn Fn(Address) -> Address) {
        self.remap_calls.fetch_add(1, Ordering::AcqRel);
    }
}

/// Event captured by [`RecordingTelemetry`].
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A phase switch
    PhaseSwitch {
        /// Generation
        generation: GenerationId,
        /// Previous phase
        from: Phase,
        /// New phase
        to: Phase,
    },
    /// An active worker count change
    WorkersResized {
        /// Generation
        generation: GenerationId,
        /// Previous count
        from: usize,
        /// New count
        to: usize,
    },
    /// A relocation set installation
    RelocationSetInstalled {
        /// Generation
        generation: GenerationId,
        /// Records installed
        nforwardings: usize,
    },
    /// A finished worker task
    TaskCompleted {
        /// Generation
        generation: GenerationId,
        /// Task name
        task: String,
    },
    /// A finished cycle
    CycleEnd(CycleStats),
}

/// Telemetry sink that records every event.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event in order.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Phase switches of `generation` in order.
    pub fn phase_switches(&self, generation: GenerationId) -> Vec<(Phase, Phase)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TelemetryEvent::PhaseSwitch { generation: g, from, to } if *g == generation => {
                    Some((*from, *to))
                }
                _ => None,
            })
            .collect()
    }

    /// Cycle summaries in order.
    pub fn cycle_ends(&self) -> Vec<CycleStats> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TelemetryEvent::CycleEnd(stats) => Some(stats.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

impl Telemetry for RecordingTelemetry {
    fn phase_switch(&self, generation: GenerationId, from: Phase, to: Phase) {
        self.record(TelemetryEvent::PhaseSwitch { generation, from, to });
    }

    fn workers_resized(&self, generation: GenerationId, from: usize, to: usize) {
        self.record(TelemetryEvent::WorkersResized { generation, from, to });
    }

    fn relocation_set_installed(&self, generation: GenerationId, nforwardings: usize, _arena_bytes: usize) {
        self.record(TelemetryEvent::RelocationSetInstalled {
            generation,
            nforwardings,
        });
    }

    fn task_completed(&self, generation: GenerationId, task: &str, _elapsed: Duration) {
        self.record(TelemetryEvent::TaskCompleted {
            generation,
            task: task.to_string(),
        });
    }

    fn cycle_end(&self, stats: &CycleStats) {
        self.record(TelemetryEvent::CycleEnd(stats.clone()));
    }
}
