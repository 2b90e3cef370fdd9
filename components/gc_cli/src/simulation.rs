//! Synthetic mutator workload
//!
//! The simulation allocates objects into eden, keeps a share of them
//! reachable from a mutator stack or from other reachable objects, and runs
//! minor and major collections between allocation rounds. After every
//! collection the mutator stack is processed through its watermark barrier
//! and compared with the root set the marker healed.

use crate::error::{CliError, CliResult};
use gc_core::{
    Collection, CollectionKind, CycleStats, GcConfig, GcContext, LogTelemetry, MutatorThread,
    RegionAllocator, RegionHeap, RootSetMarker,
};
use gc_types::{Address, GcError, RegionAge};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Attempts at reclaiming freed extents before retrying a stalled allocation.
const STALL_FLUSH_ROUNDS: usize = 64;

/// Workload parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOptions {
    /// Collection cycles to run
    pub cycles: usize,
    /// Every Nth cycle is major, 0 for none
    pub major_every: usize,
    /// Objects allocated between cycles
    pub objects: usize,
    /// Object size in bytes
    pub object_size: usize,
    /// Share of new objects kept reachable
    pub live_ratio: f64,
    /// Frames kept on the mutator stack
    pub max_frames: usize,
    /// Workload generator seed
    pub seed: u64,
    /// Request collections from background driver threads
    pub background: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        SimulationOptions {
            cycles: 10,
            major_every: 4,
            objects: 2000,
            object_size: 256,
            live_ratio: 0.3,
            max_frames: 64,
            seed: 1,
            background: false,
        }
    }
}

/// One finished generation cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    /// Simulation cycle that triggered the collection
    pub cycle: usize,
    /// "minor" or "major"
    pub kind: &'static str,
    /// Generation collected
    pub generation: &'static str,
    /// Generation cycle sequence number
    pub seqnum: u64,
    /// Bytes handed back to the allocator
    pub reclaimed: i64,
    /// Bytes copied
    pub relocated: usize,
    /// Bytes moved from young to old
    pub promoted: usize,
    /// Regions in the relocation set
    pub nforwardings: usize,
    /// Regions relocated in place
    pub in_place: usize,
    /// Cycle duration in microseconds
    pub duration_us: u128,
}

impl CycleSummary {
    fn new(cycle: usize, kind: &'static str, stats: &CycleStats) -> Self {
        CycleSummary {
            cycle,
            kind,
            generation: stats.generation.name(),
            seqnum: stats.seqnum,
            reclaimed: stats.reclaimed,
            relocated: stats.relocated,
            promoted: stats.promoted,
            nforwardings: stats.nforwardings,
            in_place: stats.in_place,
            duration_us: stats.duration.as_micros(),
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Every generation cycle in order
    pub cycles: Vec<CycleSummary>,
    /// Minor collections run
    pub minor_collections: u64,
    /// Major collections run
    pub major_collections: u64,
    /// Objects allocated by the mutator
    pub allocated_objects: usize,
    /// Allocations that had to wait for a collection
    pub allocation_stalls: usize,
    /// Roots at the end
    pub roots: usize,
    /// Mutator frames at the end
    pub frames: usize,
    /// Bytes of mapped regions at the end
    pub heap_used: usize,
    /// Heap capacity in bytes
    pub heap_capacity: usize,
}

impl SimulationReport {
    /// Bytes relocated over all cycles.
    pub fn total_relocated(&self) -> usize {
        self.cycles.iter().map(|c| c.relocated).sum()
    }

    /// Bytes promoted over all cycles.
    pub fn total_promoted(&self) -> usize {
        self.cycles.iter().map(|c| c.promoted).sum()
    }

    /// Bytes reclaimed over all cycles.
    pub fn total_reclaimed(&self) -> i64 {
        self.cycles.iter().map(|c| c.reclaimed).sum()
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> CliResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>5} {:>5} {:>5} {:>4} {:>12} {:>12} {:>12} {:>5} {:>5} {:>10}",
            "cycle", "kind", "gen", "seq", "reclaimed", "relocated", "promoted", "fwd", "inpl", "us"
        )?;
        for c in &self.cycles {
            writeln!(
                f,
                "{:>5} {:>5} {:>5} {:>4} {:>12} {:>12} {:>12} {:>5} {:>5} {:>10}",
                c.cycle,
                c.kind,
                c.generation,
                c.seqnum,
                c.reclaimed,
                c.relocated,
                c.promoted,
                c.nforwardings,
                c.in_place,
                c.duration_us
            )?;
        }
        writeln!(
            f,
            "{} minor / {} major collections, {} objects allocated, {} stalls",
            self.minor_collections, self.major_collections, self.allocated_objects, self.allocation_stalls
        )?;
        writeln!(
            f,
            "relocated {}B, promoted {}B, reclaimed {}B",
            self.total_relocated(),
            self.total_promoted(),
            self.total_reclaimed()
        )?;
        write!(
            f,
            "heap {}/{}B used, {} roots on {} frames",
            self.heap_used, self.heap_capacity, self.roots, self.frames
        )
    }
}

/// xorshift64* generator, enough for a reproducible workload.
struct Workload(u64);

impl Workload {
    fn new(seed: u64) -> Self {
        Workload(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// A collector context with one simulated mutator thread.
pub struct Simulation {
    options: SimulationOptions,
    heap: Arc<RegionHeap>,
    marker: Arc<RootSetMarker>,
    gc: Arc<GcContext>,
    mutator: MutatorThread,
    workload: Workload,
    summaries: Vec<CycleSummary>,
    cycle: usize,
    allocated: usize,
    stalls: usize,
}

impl Simulation {
    /// Builds the heap, the marker and the collector context.
    pub fn new(config: GcConfig, options: SimulationOptions) -> CliResult<Self> {
        let heap = Arc::new(RegionHeap::new(&config)?);
        let marker = Arc::new(RootSetMarker::new(Arc::clone(&heap) as Arc<dyn RegionAllocator>));
        let gc = Arc::new(GcContext::new(
            config,
            Arc::clone(&heap) as Arc<dyn RegionAllocator>,
            Arc::clone(&marker) as Arc<dyn gc_core::MarkEngine>,
            Arc::new(LogTelemetry),
        )?);

        let mut mutator = MutatorThread::new(0);
        gc.attach(&mut mutator);
        let workload = Workload::new(options.seed);

        Ok(Simulation {
            options,
            heap,
            marker,
            gc,
            mutator,
            workload,
            summaries: Vec::new(),
            cycle: 0,
            allocated: 0,
            stalls: 0,
        })
    }

    /// The collector context.
    pub fn context(&self) -> &Arc<GcContext> {
        &self.gc
    }

    /// The simulated mutator thread.
    pub fn mutator(&self) -> &MutatorThread {
        &self.mutator
    }

    /// Runs every cycle and reports the outcome.
    pub fn run(&mut self) -> CliResult<SimulationReport> {
        info!(
            "Simulating {} cycles of {} objects ({}B, {:.0}% kept)",
            self.options.cycles,
            self.options.objects,
            self.options.object_size,
            self.options.live_ratio * 100.0
        );

        for cycle in 1..=self.options.cycles {
            self.cycle = cycle;
            self.mutate()?;
            let major = self.options.major_every > 0 && cycle % self.options.major_every == 0;
            self.collect(if major { CollectionKind::Major } else { CollectionKind::Minor })?;
        }

        if self.options.background {
            self.gc.stop_background();
        }
        Ok(self.report())
    }

    fn report(&self) -> SimulationReport {
        let driver = self.gc.driver();
        SimulationReport {
            cycles: self.summaries.clone(),
            minor_collections: driver.minor_collections(),
            major_collections: driver.major_collections(),
            allocated_objects: self.allocated,
            allocation_stalls: self.stalls,
            roots: self.marker.roots().len(),
            frames: self.mutator.depth(),
            heap_used: self.heap.used(),
            heap_capacity: self.heap.capacity(),
        }
    }

    fn mutate(&mut self) -> CliResult<()> {
        for _ in 0..self.options.objects {
            let obj = self.allocate()?;
            let roll = self.workload.next_f64();
            if roll < self.options.live_ratio / 2.0 || (roll < self.options.live_ratio && self.mutator.depth() == 0) {
                self.mutator.push_frame(vec![obj]);
                self.marker.add_root(obj);
            } else if roll < self.options.live_ratio {
                let frame = self.workload.below(self.mutator.depth());
                let parent = self.mutator.frames()[frame].slots()[0];
                self.marker.add_edge(parent, obj);
            }
        }

        while self.mutator.depth() > self.options.max_frames {
            if let Some(frame) = self.mutator.return_from_frame() {
                for &slot in frame.slots() {
                    self.marker.remove_root(slot);
                }
            }
        }
        debug!(
            "cycle {}: {} roots on {} frames",
            self.cycle,
            self.marker.roots().len(),
            self.mutator.depth()
        );
        Ok(())
    }

    fn allocate(&mut self) -> CliResult<Address> {
        self.allocated += 1;
        match self.heap.alloc_object(RegionAge::Eden, self.options.object_size) {
            Ok(addr) => Ok(addr),
            Err(GcError::HeapExhausted { requested }) => {
                warn!("Allocation of {}B stalled, running a minor collection", requested);
                self.stalls += 1;
                self.collect(CollectionKind::Minor)?;
                self.heap.flush_deferred(STALL_FLUSH_ROUNDS);
                Ok(self.heap.alloc_object(RegionAge::Eden, self.options.object_size)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn collect(&mut self, kind: CollectionKind) -> CliResult<()> {
        let collection = if self.options.background {
            self.gc.request(kind)?.recv().map_err(|_| CliError::DriverGone)??
        } else {
            self.gc.driver().collect(kind)?
        };

        match collection {
            Collection::Minor(stats) => {
                self.summaries.push(CycleSummary::new(self.cycle, "minor", &stats));
            }
            Collection::Major(stats) => {
                self.summaries.push(CycleSummary::new(self.cycle, "major", &stats.young));
                self.summaries.push(CycleSummary::new(self.cycle, "major", &stats.old));
            }
        }
        self.process_stack()
    }

    /// Heals the mutator stack and checks it against the marker's roots.
    fn process_stack(&mut self) -> CliResult<()> {
        self.gc.process_stack(&mut self.mutator);

        let mut stack: Vec<Address> = self
            .mutator
            .frames()
            .iter()
            .flat_map(|frame| frame.slots().iter().copied())
            .collect();
        let mut roots = self.marker.roots();
        stack.sort();
        roots.sort();
        if stack != roots {
            let stale = stack.iter().filter(|addr| !roots.contains(addr)).count();
            return Err(CliError::StackMismatch {
                cycle: self.cycle,
                detail: format!(
                    "{} stack slots, {} roots, {} slots not in the root set",
                    stack.len(),
                    roots.len(),
                    stale
                ),
            });
        }
        Ok(())
    }
}
