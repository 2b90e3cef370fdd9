//! Explicitly owned collector context.
//!
//! [`GcContext`] wires the allocator, the mark engine and the two
//! generations' collectors together. There is no global collector state:
//! everything that needs the collector is handed the context.
//!
//! # Examples
//!
//! ```
//! use gc_core::{GcConfig, GcContext, NoopTelemetry, RegionHeap, RootSetMarker};
//! use gc_types::RegionAge;
//! use std::sync::Arc;
//!
//! let config = GcConfig { young_workers: 1, old_workers: 1, ..GcConfig::default() };
//! let heap = Arc::new(RegionHeap::new(&config).unwrap());
//! let marker = Arc::new(RootSetMarker::new(heap.clone()));
//! let gc = GcContext::try_new(config, heap.clone(), marker.clone(), Arc::new(NoopTelemetry)).unwrap();
//!
//! let obj = heap.alloc_object(RegionAge::Eden, 64).unwrap();
//! marker.add_root(obj);
//! gc.collect_minor().unwrap();
//! let moved = marker.roots()[0];
//! assert_eq!(gc.load_barrier(obj), moved);
//! ```

use crate::allocator::RegionAllocator;
use crate::collector::{Collector, CycleStats, Phase};
use crate::config::GcConfig;
use crate::driver::{Collection, CollectionKind, Driver, DriverThread, MajorCycleStats};
use crate::mark::MarkEngine;
use crate::mutator::{MutatorThread, RelocationWatermark, Remapper};
use crate::stack_watermark::WatermarkKind;
use crate::telemetry::Telemetry;
use crate::workers::WorkerPool;
use crossbeam::channel::Receiver;
use gc_types::{Address, GcError, GcResult, GenerationId};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

/// The collector and its collaborators.
pub struct GcContext {
    config: GcConfig,
    allocator: Arc<dyn RegionAllocator>,
    mark: Arc<dyn MarkEngine>,
    driver: Arc<Driver>,
    threads: Mutex<Vec<DriverThread>>,
}

impl GcContext {
    /// Creates the context. If a worker pool cannot start all its threads
    /// the process terminates.
    pub fn new(
        config: GcConfig,
        allocator: Arc<dyn RegionAllocator>,
        mark: Arc<dyn MarkEngine>,
        telemetry: Arc<dyn Telemetry>,
    ) -> GcResult<Self> {
        Self::build(config, allocator, mark, telemetry, |generation, n, dynamic| {
            Ok(WorkerPool::new(generation, n, dynamic))
        })
    }

    /// Creates the context, reporting a worker start shortfall as an error.
    pub fn try_new(
        config: GcConfig,
        allocator: Arc<dyn RegionAllocator>,
        mark: Arc<dyn MarkEngine>,
        telemetry: Arc<dyn Telemetry>,
    ) -> GcResult<Self> {
        Self::build(config, allocator, mark, telemetry, WorkerPool::try_new)
    }

    fn build(
        config: GcConfig,
        allocator: Arc<dyn RegionAllocator>,
        mark: Arc<dyn MarkEngine>,
        telemetry: Arc<dyn Telemetry>,
        spawn: impl Fn(GenerationId, usize, bool) -> GcResult<WorkerPool>,
    ) -> GcResult<Self> {
        config.validate()?;
        let collector = |generation| -> GcResult<Collector> {
            let workers = spawn(
                generation,
                config.workers_for(generation),
                config.dynamic_workers,
            )?;
            Ok(Collector::new(
                &config,
                Arc::clone(&allocator),
                Arc::clone(&mark),
                Arc::clone(&telemetry),
                workers,
            ))
        };
        let young = collector(GenerationId::Young)?;
        let old = collector(GenerationId::Old)?;
        let driver = Arc::new(Driver::new(young, old, Arc::clone(&mark)));

        info!(
            "GC context: {} bytes heap, {} young / {} old workers",
            allocator.capacity(),
            config.young_workers,
            config.old_workers
        );
        Ok(GcContext {
            config,
            allocator,
            mark,
            driver,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The region allocator.
    pub fn allocator(&self) -> &Arc<dyn RegionAllocator> {
        &self.allocator
    }

    /// The mark engine.
    pub fn mark_engine(&self) -> &Arc<dyn MarkEngine> {
        &self.mark
    }

    /// The collection driver.
    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// The collector of `generation`.
    pub fn collector(&self, generation: GenerationId) -> &Collector {
        match generation {
            GenerationId::Young => self.driver.young(),
            GenerationId::Old => self.driver.old(),
        }
    }

    /// Runs a minor collection on the calling thread.
    pub fn collect_minor(&self) -> GcResult<CycleStats> {
        self.driver.collect_minor()
    }

    /// Runs a major collection on the calling thread.
    pub fn collect_major(&self) -> GcResult<MajorCycleStats> {
        self.driver.collect_major()
    }

    /// Starts one background driver thread per collection kind. Does
    /// nothing if they are running.
    pub fn start_background(&self) -> GcResult<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        for kind in [CollectionKind::Minor, CollectionKind::Major] {
            threads.push(DriverThread::spawn(Arc::clone(&self.driver), kind)?);
        }
        Ok(())
    }

    /// Asks the background thread of `kind` for a collection, starting the
    /// threads if needed. The result arrives on the returned channel.
    pub fn request(&self, kind: CollectionKind) -> GcResult<Receiver<GcResult<Collection>>> {
        self.start_background()?;
        let threads = self.threads.lock();
        match threads.iter().find(|t| t.kind() == kind) {
            Some(thread) => thread.request(),
            None => Err(GcError::Io(std::io::Error::other(format!(
                "no {:?} driver thread",
                kind
            )))),
        }
    }

    /// Stops the background driver threads after their pending collections.
    pub fn stop_background(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in &threads {
            thread.stop();
        }
    }

    /// Load barrier slow path: the current address of `addr`, relocating
    /// the object first when its region is being evacuated.
    ///
    /// Young records are consulted before old ones, since a young region
    /// promoted in place may be relocated again by the old generation.
    pub fn load_barrier(&self, addr: Address) -> Address {
        if addr.is_null() {
            return addr;
        }
        let addr = self.driver.young().relocate_or_remap_object(addr);
        self.driver.old().relocate_or_remap_object(addr)
    }

    /// The current address of `addr` if it was already relocated.
    pub fn remap(&self, addr: Address) -> Address {
        if addr.is_null() {
            return addr;
        }
        let addr = self.driver.young().remap_object(addr);
        self.driver.old().remap_object(addr)
    }

    /// Registers the relocation watermark barrier on a mutator thread.
    pub fn attach(self: &Arc<Self>, thread: &mut MutatorThread) {
        let remapper: Arc<dyn Remapper> = Arc::clone(self) as Arc<dyn Remapper>;
        thread.add_watermark(WatermarkKind::Gc, RelocationWatermark::new(remapper));
    }

    /// Heals every frame of an attached thread through its relocation
    /// watermark.
    ///
    /// Relocation workers of the generations relocating right now are held
    /// at their next poll meanwhile. No record is then half relocated by a
    /// worker, and the thread relocates what its frames reference itself
    /// instead of waiting for in-place records.
    pub fn process_stack(&self, thread: &mut MutatorThread) {
        let sync = RelocationSync::new(
            [self.driver.young(), self.driver.old()]
                .into_iter()
                .filter(|collector| collector.is_in_flight() && collector.phase() == Phase::Relocate)
                .collect(),
        );
        thread.start_processing(WatermarkKind::Gc);
        thread.finish_processing(WatermarkKind::Gc);
        debug!(
            "thread {}: {} frames healed, {} generations synchronized",
            thread.id(),
            thread.depth(),
            sync.len()
        );
    }
}

/// Relocation synchronization held over stack processing, released on drop.
struct RelocationSync<'a> {
    collectors: Vec<&'a Collector>,
}

impl<'a> RelocationSync<'a> {
    fn new(collectors: Vec<&'a Collector>) -> Self {
        for collector in &collectors {
            collector.synchronize_relocation();
        }
        RelocationSync { collectors }
    }

    fn len(&self) -> usize {
        self.collectors.len()
    }
}

impl Drop for RelocationSync<'_> {
    fn drop(&mut self) {
        for collector in self.collectors.iter().rev() {
            collector.desynchronize_relocation();
        }
    }
}

impl Remapper for GcContext {
    fn remap(&self, addr: Address) -> Address {
        self.load_barrier(addr)
    }
}

impl Drop for GcContext {
    fn drop(&mut self) {
        self.stop_background();
    }
}
