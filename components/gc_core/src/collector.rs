//! Per-generation collector phase state machine.
//!
//! A [`Collector`] owns everything one generation needs for a cycle: its
//! worker pool, relocation set, forwarding table and relocation queue. The
//! phases advance strictly in order:
//!
//! ```text
//! Relocate --mark_start--> Mark --mark_end--> MarkComplete --relocate_start--> Relocate
//! ```
//!
//! The phase only returns to `Mark` at the next cycle's `mark_start`, so the
//! previous cycle's forwarding records stay visible to barriers while the
//! next cycle marks. They are torn down by the following `relocate_start`.
//!
//! Calling an operation in the wrong phase returns
//! [`GcError::PhaseViolation`]. Starting a cycle while one is still in
//! flight returns [`GcError::CycleInProgress`].

use crate::allocator::RegionAllocator;
use crate::config::GcConfig;
use crate::forwarding::ForwardingRef;
use crate::forwarding_table::ForwardingTable;
use crate::mark::MarkEngine;
use crate::relocate::{forward_object, relocate_object, wanted_workers, Relocate, RelocateOps};
use crate::relocation_set::RelocationSet;
use crate::selector::RelocationSetSelector;
use crate::telemetry::Telemetry;
use crate::workers::{WorkerPool, WorkerResizeStats};
use crossbeam::atomic::AtomicCell;
use crossbeam_epoch as epoch;
use gc_types::{Address, GcError, GcResult, GenerationId, Region, RegionId};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Marking is in progress
    Mark,
    /// Marking finished, relocation not started
    MarkComplete,
    /// Relocating, or idle after relocation
    Relocate,
}

impl Phase {
    /// Returns the phase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Mark => "Mark",
            Phase::MarkComplete => "MarkComplete",
            Phase::Relocate => "Relocate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Young generation specifics.
#[derive(Debug, Default)]
pub struct YoungState {
    skip_mark_start: AtomicBool,
}

/// Old generation specifics.
#[derive(Debug, Default)]
pub struct OldState {
    total_collections_at_end: AtomicU64,
}

/// Generation-specific behavior of a [`Collector`].
#[derive(Debug)]
pub enum Generation {
    /// Young generation
    Young(YoungState),
    /// Old generation
    Old(OldState),
}

impl Generation {
    fn new(id: GenerationId) -> Self {
        match id {
            GenerationId::Young => Generation::Young(YoungState::default()),
            GenerationId::Old => Generation::Old(OldState::default()),
        }
    }
}

/// Summary of one finished cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleStats {
    /// Generation collected
    pub generation: GenerationId,
    /// Cycle sequence number
    pub seqnum: u64,
    /// Bytes of regions handed back to the allocator
    pub reclaimed: i64,
    /// Bytes copied to new locations
    pub relocated: usize,
    /// Bytes that moved from young to old
    pub promoted: usize,
    /// Regions in the relocation set
    pub nforwardings: usize,
    /// Regions relocated in place
    pub in_place: usize,
    /// Time from mark start to relocation end
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct CycleCounters {
    reclaimed: AtomicI64,
    relocated: AtomicUsize,
    promoted: AtomicUsize,
}

impl CycleCounters {
    fn reset(&self) {
        self.reclaimed.store(0, Ordering::Relaxed);
        self.relocated.store(0, Ordering::Relaxed);
        self.promoted.store(0, Ordering::Relaxed);
    }
}

/// Collector of one generation.
pub struct Collector {
    id: GenerationId,
    kind: Generation,
    config: GcConfig,
    allocator: Arc<dyn RegionAllocator>,
    mark: Arc<dyn MarkEngine>,
    telemetry: Arc<dyn Telemetry>,
    workers: WorkerPool,
    selector: RelocationSetSelector,
    forwarding_table: ForwardingTable,
    relocation_set: RelocationSet,
    relocate: Relocate,
    phase: AtomicCell<Phase>,
    seqnum: AtomicU64,
    in_flight: AtomicBool,
    counters: CycleCounters,
    /// Regions that existed at mark start
    marked_regions: Mutex<HashSet<RegionId>>,
    cycle_start: Mutex<Option<Instant>>,
    last_stats: Mutex<Option<CycleStats>>,
}

impl Collector {
    /// Creates the collector of the generation `workers` belongs to.
    pub fn new(
        config: &GcConfig,
        allocator: Arc<dyn RegionAllocator>,
        mark: Arc<dyn MarkEngine>,
        telemetry: Arc<dyn Telemetry>,
        workers: WorkerPool,
    ) -> Self {
        let id = workers.generation();
        Collector {
            id,
            kind: Generation::new(id),
            config: config.clone(),
            allocator,
            mark,
            telemetry,
            workers,
            selector: RelocationSetSelector::new(config),
            forwarding_table: ForwardingTable::new(),
            relocation_set: RelocationSet::new(id),
            relocate: Relocate::new(id),
            phase: AtomicCell::new(Phase::Relocate),
            seqnum: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            counters: CycleCounters::default(),
            marked_regions: Mutex::new(HashSet::new()),
            cycle_start: Mutex::new(None),
            last_stats: Mutex::new(None),
        }
    }

    /// Generation collected.
    pub fn generation(&self) -> GenerationId {
        self.id
    }

    /// Generation-specific state.
    pub fn kind(&self) -> &Generation {
        &self.kind
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase.load()
    }

    /// Sequence number of the current or last cycle, 0 before the first.
    pub fn seqnum(&self) -> u64 {
        self.seqnum.load(Ordering::Acquire)
    }

    /// True between `mark_start` and the end of `relocate`.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The generation's worker pool.
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// The generation's relocation set.
    pub fn relocation_set(&self) -> &RelocationSet {
        &self.relocation_set
    }

    /// The generation's forwarding table.
    pub fn forwarding_table(&self) -> &ForwardingTable {
        &self.forwarding_table
    }

    /// The generation's relocation driver.
    pub fn relocate_driver(&self) -> &Relocate {
        &self.relocate
    }

    /// Summary of the last finished cycle.
    pub fn last_stats(&self) -> Option<CycleStats> {
        self.last_stats.lock().clone()
    }

    /// Worker statistics of the current cycle.
    pub fn resize_stats(&self) -> WorkerResizeStats {
        let start = self.cycle_start.lock().unwrap_or_else(Instant::now);
        self.workers.resize_stats(start)
    }

    fn set_phase(&self, to: Phase) {
        let from = self.phase.swap(to);
        debug!("{} phase {} -> {}", self.id, from, to);
        self.telemetry.phase_switch(self.id, from, to);
    }

    fn expect_phase(&self, operation: &'static str, expected: Phase) -> GcResult<()> {
        let phase = self.phase();
        if phase != expected || !self.is_in_flight() {
            return Err(GcError::PhaseViolation {
                generation: self.id,
                operation,
                phase: if self.is_in_flight() { phase.as_str() } else { "idle" },
            });
        }
        Ok(())
    }

    fn set_active_workers(&self, nworkers: usize) {
        let from = self.workers.active_workers();
        if from != nworkers {
            self.workers.set_active_workers(nworkers);
            self.telemetry.workers_resized(self.id, from, nworkers);
        }
    }

    /// Starts a cycle: resets the per-cycle counters and begins marking.
    pub fn mark_start(&self) -> GcResult<()> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(GcError::CycleInProgress(self.id));
        }

        *self.cycle_start.lock() = Some(Instant::now());
        self.counters.reset();
        self.workers.set_active();
        if self.workers.is_dynamic() {
            self.set_active_workers(self.workers.max_workers());
        }

        self.allocator.retire_allocation_regions();
        if self.id == GenerationId::Young {
            if let Some(remembered) = self.mark.remembered() {
                let pending = remembered.flip();
                debug!("Young mark start: {} remembered objects to scan", pending);
            }
        }
        let regions = self.allocator.regions_of(self.id);
        *self.marked_regions.lock() = regions.iter().map(|r| r.id()).collect();
        self.mark.mark_start(self.id, &regions);

        let seqnum = self.seqnum.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("{} cycle {} mark start", self.id, seqnum);
        self.set_phase(Phase::Mark);
        Ok(())
    }

    /// Pushes the generation's roots.
    pub fn mark_roots(&self) -> GcResult<()> {
        self.expect_phase("mark_roots", Phase::Mark)?;
        let start = Instant::now();
        self.mark.mark_roots(self.id, &self.workers);
        self.telemetry.task_completed(self.id, "mark_roots", start.elapsed());
        Ok(())
    }

    /// Traces from the roots. Returns true once the mark work list is
    /// exhausted.
    pub fn mark_follow(&self) -> GcResult<bool> {
        self.expect_phase("mark_follow", Phase::Mark)?;
        let start = Instant::now();
        let done = self.mark.mark_follow(self.id, &self.workers);
        self.telemetry.task_completed(self.id, "mark_follow", start.elapsed());
        Ok(done)
    }

    /// Attempts to end marking. Returns `Ok(false)` if more work turned up,
    /// in which case marking continues.
    pub fn mark_end(&self) -> GcResult<bool> {
        self.expect_phase("mark_end", Phase::Mark)?;
        if !self.mark.try_end(self.id) {
            debug!("{} mark end: more work pending", self.id);
            return Ok(false);
        }

        if let Generation::Old(old) = &self.kind {
            old.total_collections_at_end.store(self.seqnum(), Ordering::Release);
        }
        self.set_phase(Phase::MarkComplete);
        Ok(true)
    }

    /// Processes non-strong references after old marking.
    ///
    /// # Panics
    ///
    /// Panics when called on the young generation.
    pub fn process_non_strong_references(&self) -> GcResult<()> {
        assert!(
            matches!(self.kind, Generation::Old(_)),
            "only the old generation processes non-strong references"
        );
        self.expect_phase("process_non_strong_references", Phase::MarkComplete)?;
        let start = Instant::now();
        self.mark.process_non_strong_references();
        self.telemetry
            .task_completed(self.id, "process_non_strong_references", start.elapsed());
        Ok(())
    }

    /// Completed old cycles at the end of the last old mark.
    pub fn total_collections_at_end(&self) -> Option<u64> {
        match &self.kind {
            Generation::Old(old) => Some(old.total_collections_at_end.load(Ordering::Acquire)),
            Generation::Young(_) => None,
        }
    }

    /// Asks the next young collection to skip its mark start, which a major
    /// collection already performed.
    ///
    /// # Panics
    ///
    /// Panics when called on the old generation.
    pub fn skip_mark_start(&self) {
        match &self.kind {
            Generation::Young(young) => young.skip_mark_start.store(true, Ordering::Release),
            Generation::Old(_) => panic!("only the young generation skips mark start"),
        }
    }

    /// Consumes a pending skip request.
    pub fn should_skip_mark_start(&self) -> bool {
        match &self.kind {
            Generation::Young(young) => young.skip_mark_start.swap(false, Ordering::AcqRel),
            Generation::Old(_) => false,
        }
    }

    fn reset_relocation_set(&self) {
        self.forwarding_table.clear();
        self.relocation_set.reset(&*self.allocator);
    }

    /// Selects and installs the relocation set.
    ///
    /// Tears down the previous cycle's set, frees regions without live
    /// objects and ages wholly live young regions in place. With
    /// `promote_all` every young survivor goes to old. Regions that joined
    /// the generation after mark start were not marked and are left alone.
    pub fn relocate_start(&self, promote_all: bool) -> GcResult<()> {
        self.expect_phase("relocate_start", Phase::MarkComplete)?;

        self.reset_relocation_set();
        self.allocator.retire_relocation_targets();

        let mut regions = self.allocator.regions_of(self.id);
        {
            let marked = self.marked_regions.lock();
            regions.retain(|r| marked.contains(&r.id()));
        }
        let selection = self.selector.select(&regions, self.id, promote_all);

        let empty_bytes: usize = selection.empty.iter().map(|r| r.size()).sum();
        for batch in selection.empty.chunks(self.config.free_bulk) {
            self.allocator.free_regions(batch.to_vec());
        }
        self.counters
            .reclaimed
            .fetch_add(empty_bytes as i64, Ordering::Relaxed);

        if self.workers.is_dynamic() {
            let wanted = wanted_workers(selection.nforwardings(), 0, self.workers.max_workers());
            self.set_active_workers(wanted);
        }

        self.relocation_set.install(&self.workers, &selection);
        for forwarding in self.relocation_set.forwardings() {
            self.forwarding_table.insert(&forwarding);
        }
        self.telemetry.relocation_set_installed(
            self.id,
            self.relocation_set.nforwardings(),
            self.relocation_set.arena_bytes(),
        );

        if self.id == GenerationId::Young {
            self.relocate.flip_age_regions(
                self,
                &selection.flip,
                promote_all,
                selection.tenuring_threshold,
            );
        }

        self.set_phase(Phase::Relocate);
        Ok(())
    }

    /// Relocates the installed set and ends the cycle.
    pub fn relocate(&self) -> GcResult<CycleStats> {
        self.expect_phase("relocate", Phase::Relocate)?;

        let start = Instant::now();
        self.relocate.relocate(&self.workers, self);
        self.telemetry.task_completed(self.id, "relocate", start.elapsed());

        let mut in_place = 0;
        let mut evacuated = 0;
        for forwarding in self.relocation_set.forwardings() {
            if forwarding.in_place() {
                in_place += 1;
            } else {
                evacuated += forwarding.region().size();
            }
        }
        self.counters
            .reclaimed
            .fetch_add(evacuated as i64, Ordering::Relaxed);

        let duration = self
            .cycle_start
            .lock()
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed());
        let stats = CycleStats {
            generation: self.id,
            seqnum: self.seqnum(),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
            relocated: self.counters.relocated.load(Ordering::Relaxed),
            promoted: self.counters.promoted.load(Ordering::Relaxed),
            nforwardings: self.relocation_set.nforwardings(),
            in_place,
            duration,
        };

        self.workers.set_inactive();
        self.in_flight.store(false, Ordering::Release);
        info!(
            "{} cycle {} end: {} forwardings, {} in place",
            self.id, stats.seqnum, stats.nforwardings, stats.in_place
        );
        self.telemetry.cycle_end(&stats);
        *self.last_stats.lock() = Some(stats.clone());
        Ok(stats)
    }

    /// Stops this generation's relocation workers at their next poll.
    pub fn synchronize_relocation(&self) {
        self.relocate.synchronize();
    }

    /// Lets this generation's relocation workers continue.
    pub fn desynchronize_relocation(&self) {
        self.relocate.desynchronize();
    }

    /// Forwarding record covering `addr`, if its region is being relocated.
    ///
    /// A record only counts while the region it was built for is still the
    /// one mapped at `addr`.
    pub fn forwarding(&self, addr: Address) -> Option<ForwardingRef> {
        let forwarding = self.forwarding_table.get(addr)?;
        match self.allocator.region_for(addr) {
            Some(region) if region.id() == forwarding.region().id() => Some(forwarding),
            _ => None,
        }
    }

    /// Load barrier slow path: returns the current address of `addr`,
    /// relocating the object first if no one did yet.
    ///
    /// If the object sits in a region being relocated in place, the caller
    /// hands the region to the relocation workers and waits for it, unless
    /// the workers are synchronized and would never get to it. Objects the
    /// last mark found dead are returned unchanged.
    pub fn relocate_or_remap_object(&self, addr: Address) -> Address {
        let _guard = epoch::pin();
        let Some(forwarding) = self.forwarding(addr) else {
            return addr;
        };
        if let Some(to) = forwarding.find(addr) {
            return to;
        }
        if !forwarding.region().is_live(addr) {
            return addr;
        }

        let queue = self.relocate.queue();
        if forwarding.in_place()
            && !forwarding.is_done()
            && !queue.is_synchronized()
            && queue.add_and_wait(forwarding.clone())
        {
            return forward_object(&forwarding, addr);
        }
        relocate_object(self, &forwarding, addr)
    }

    /// Returns the current address of `addr` without relocating anything.
    pub fn remap_object(&self, addr: Address) -> Address {
        let _guard = epoch::pin();
        self.forwarding(addr)
            .and_then(|forwarding| forwarding.find(addr))
            .unwrap_or(addr)
    }
}

impl RelocateOps for Collector {
    fn allocator(&self) -> &dyn RegionAllocator {
        &*self.allocator
    }

    fn relocation_set(&self) -> &RelocationSet {
        &self.relocation_set
    }

    fn promote_flip(&self, from: &Arc<Region>, to: Arc<Region>) {
        self.counters
            .promoted
            .fetch_add(from.live_bytes(), Ordering::Relaxed);
        self.allocator.replace_region(from, to);
        for object in from.live_map() {
            self.mark.remember_promoted(object.addr);
        }
    }

    fn promote_reloc(&self, from: &Arc<Region>, to: Arc<Region>) {
        self.allocator.replace_region(from, to);
        self.relocation_set.register_promote_relocated(Arc::clone(from));
        for object in from.live_map() {
            self.mark.remember_promoted(object.addr);
        }
    }

    fn increase_relocated(&self, bytes: usize) {
        self.counters.relocated.fetch_add(bytes, Ordering::Relaxed);
    }

    fn increase_promoted(&self, bytes: usize) {
        self.counters.promoted.fetch_add(bytes, Ordering::Relaxed);
    }

    fn remember_promoted(&self, from: Address) {
        self.mark.remember_promoted(from);
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("generation", &self.id)
            .field("phase", &self.phase())
            .field("seqnum", &self.seqnum())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}
