//! The per-cycle relocation set.
//!
//! Installation sizes one [`ForwardingArena`] for the whole selection and
//! then lets the worker pool fill it in parallel. Each worker steals regions
//! from two independent work-stealing queues (small and medium), builds the
//! region's forwarding record and commits it to a slot taken with
//! `fetch_add` on a per-partition counter. Medium records occupy slots
//! `[0, nmedium)` and small records `[nmedium, n)`. Order within a partition
//! is whatever the workers produce.
//!
//! The set also keeps the two promotion lists of the cycle: stale descriptors
//! of regions promoted by flipping and of regions promoted after in-place
//! relocation. A region may appear in at most one list, once.

use crate::allocator::RegionAllocator;
use crate::arena::ForwardingArena;
use crate::forwarding::{Forwarding, ForwardingRef};
use crate::relocate::compute_to_age;
use crate::selector::Selection;
use crate::workers::{WorkerContext, WorkerPool, WorkerTask};
use crossbeam_deque::{Injector, Steal};
use crossbeam_epoch as epoch;
use gc_types::{GenerationId, Region, RegionId};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct InstallTask {
    arena: Arc<ForwardingArena>,
    nforwardings: usize,
    promote_all: bool,
    tenuring_threshold: u8,
    small: Injector<Arc<Region>>,
    medium: Injector<Arc<Region>>,
    small_next: AtomicUsize,
    medium_next: AtomicUsize,
}

impl InstallTask {
    fn new(arena: Arc<ForwardingArena>, selection: &Selection) -> Self {
        let small = Injector::new();
        selection.small.iter().cloned().for_each(|r| small.push(r));
        let medium = Injector::new();
        selection.medium.iter().cloned().for_each(|r| medium.push(r));

        InstallTask {
            arena,
            nforwardings: selection.nforwardings(),
            promote_all: selection.promote_all,
            tenuring_threshold: selection.tenuring_threshold,
            small,
            medium,
            small_next: AtomicUsize::new(selection.medium.len()),
            medium_next: AtomicUsize::new(0),
        }
    }

    fn install_all(&self, regions: &Injector<Arc<Region>>, next: &AtomicUsize) {
        loop {
            let region = match regions.steal() {
                Steal::Success(region) => region,
                Steal::Empty => return,
                Steal::Retry => continue,
            };

            let to_age = compute_to_age(region.age(), self.promote_all, self.tenuring_threshold);
            let entries = self
                .arena
                .alloc_entries(Forwarding::nentries_for(region.live_objects()));
            trace!("{} (relocation selected, to {})", region.id(), to_age);
            let forwarding = Forwarding::new(region, to_age, entries);

            let index = next.fetch_add(1, Ordering::Relaxed);
            assert!(index < self.nforwardings, "Invalid index");
            self.arena.install(index, forwarding);
        }
    }
}

impl WorkerTask for InstallTask {
    fn name(&self) -> &str {
        "relocation-set-install"
    }

    fn work(&self, _ctx: &WorkerContext<'_>) {
        self.install_all(&self.small, &self.small_next);
        self.install_all(&self.medium, &self.medium_next);
    }
}

struct Installed {
    arena: Arc<ForwardingArena>,
    nmedium: usize,
}

#[derive(Default)]
struct PromotionLists {
    flipped: Vec<Arc<Region>>,
    relocated: Vec<Arc<Region>>,
    members: HashSet<RegionId>,
}

impl PromotionLists {
    fn register(&mut self, region: Arc<Region>, flipped: bool) {
        assert!(
            self.members.insert(region.id()),
            "no duplicates allowed: {} already registered for promotion",
            region.id()
        );
        if flipped {
            self.flipped.push(region);
        } else {
            self.relocated.push(region);
        }
    }
}

/// Forwarding records and promotion lists of one cycle.
pub struct RelocationSet {
    generation: GenerationId,
    installed: RwLock<Option<Installed>>,
    promotion: Mutex<PromotionLists>,
}

impl RelocationSet {
    /// Creates an empty set.
    pub fn new(generation: GenerationId) -> Self {
        RelocationSet {
            generation,
            installed: RwLock::new(None),
            promotion: Mutex::new(PromotionLists::default()),
        }
    }

    /// Builds a forwarding record for every selected region.
    ///
    /// # Panics
    ///
    /// Panics if a previous set is still installed.
    pub fn install(&self, workers: &WorkerPool, selection: &Selection) {
        assert!(
            self.installed.read().is_none(),
            "{} relocation set installed twice",
            self.generation
        );

        let arena = Arc::new(ForwardingArena::new(
            selection.nforwardings(),
            selection.forwarding_entries,
        ));
        let task = InstallTask::new(Arc::clone(&arena), selection);
        workers.run(&task);

        if !arena.is_full() {
            debug!(
                "{} relocation set used {} of {} forwarding entries",
                self.generation,
                arena.entries_used(),
                arena.entries_capacity()
            );
        }
        debug!(
            "{} relocation set installed: {} forwardings ({} medium), {} bytes",
            self.generation,
            arena.nforwardings(),
            selection.medium.len(),
            arena.size_bytes()
        );

        *self.installed.write() = Some(Installed {
            arena,
            nmedium: selection.medium.len(),
        });
    }

    /// Number of installed forwarding records.
    pub fn nforwardings(&self) -> usize {
        self.installed
            .read()
            .as_ref()
            .map_or(0, |installed| installed.arena.nforwardings())
    }

    /// Number of records in the medium partition.
    pub fn nmedium(&self) -> usize {
        self.installed.read().as_ref().map_or(0, |installed| installed.nmedium)
    }

    /// Bytes reserved by the arena.
    pub fn arena_bytes(&self) -> usize {
        self.installed
            .read()
            .as_ref()
            .map_or(0, |installed| installed.arena.size_bytes())
    }

    /// Record in `slot`.
    pub fn forwarding(&self, slot: usize) -> Option<ForwardingRef> {
        let installed = self.installed.read();
        let arena = &installed.as_ref()?.arena;
        arena.slot(slot)?;
        Some(ForwardingRef::new(Arc::clone(arena), slot))
    }

    /// Every record, in slot order.
    pub fn forwardings(&self) -> Vec<ForwardingRef> {
        match self.installed.read().as_ref() {
            Some(installed) => (0..installed.arena.nforwardings())
                .map(|slot| ForwardingRef::new(Arc::clone(&installed.arena), slot))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Iterator handing each record to exactly one of several threads.
    pub fn par_iter(&self) -> RelocationSetParallelIterator {
        RelocationSetParallelIterator {
            forwardings: self.forwardings(),
            next: AtomicUsize::new(0),
        }
    }

    /// Tears down the set.
    ///
    /// Regions that were fully evacuated are freed, every forwarding record
    /// is destroyed before the record count drops to zero, and the stale
    /// descriptors in the promotion lists are destroyed. All reclamation is
    /// deferred through the allocator.
    pub fn reset(&self, allocator: &dyn RegionAllocator) {
        let mut installed = self.installed.write();
        if let Some(current) = installed.take() {
            let mut freed = 0;
            for slot in 0..current.arena.nforwardings() {
                if let Some(forwarding) = current.arena.slot(slot) {
                    if !forwarding.in_place() {
                        allocator.free_region(Arc::clone(forwarding.region()));
                        freed += 1;
                    }
                }
            }
            debug!(
                "{} relocation set reset: freed {} of {} regions",
                self.generation,
                freed,
                current.arena.nforwardings()
            );
            Self::destroy_forwardings(current.arena);
        }
        drop(installed);

        let mut promotion = self.promotion.lock();
        let relocated = std::mem::take(&mut promotion.relocated);
        let flipped = std::mem::take(&mut promotion.flipped);
        promotion.members.clear();
        drop(promotion);

        destroy_and_clear(allocator, relocated);
        destroy_and_clear(allocator, flipped);
    }

    fn destroy_forwardings(arena: Arc<ForwardingArena>) {
        match Arc::try_unwrap(arena) {
            Ok(arena) => drop(arena),
            Err(shared) => {
                // Barriers still hold records
                let guard = epoch::pin();
                guard.defer(move || drop(shared));
            }
        }
    }

    /// Registers the stale descriptors of regions promoted by flipping.
    ///
    /// # Panics
    ///
    /// Panics if a region is already registered in either list.
    pub fn register_promote_flipped(&self, regions: &[Arc<Region>]) {
        let mut promotion = self.promotion.lock();
        for region in regions {
            promotion.register(Arc::clone(region), true);
        }
    }

    /// Registers the stale descriptor of a region promoted after in-place
    /// relocation.
    ///
    /// # Panics
    ///
    /// Panics if the region is already registered in either list.
    pub fn register_promote_relocated(&self, region: Arc<Region>) {
        self.promotion.lock().register(region, false);
    }

    /// Regions registered as flipped this cycle.
    pub fn promote_flipped(&self) -> Vec<Arc<Region>> {
        self.promotion.lock().flipped.clone()
    }

    /// Regions registered as promoted after in-place relocation this cycle.
    pub fn promote_relocated(&self) -> Vec<Arc<Region>> {
        self.promotion.lock().relocated.clone()
    }
}

fn destroy_and_clear(allocator: &dyn RegionAllocator, regions: Vec<Arc<Region>>) {
    for region in regions {
        allocator.safe_destroy_region(region);
    }
}

/// Shared cursor over a snapshot of the relocation set.
pub struct RelocationSetParallelIterator {
    forwardings: Vec<ForwardingRef>,
    next: AtomicUsize,
}

impl RelocationSetParallelIterator {
    /// Returns the next record not yet handed out.
    pub fn next(&self) -> Option<ForwardingRef> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.forwardings.get(index).cloned()
    }

    /// Number of records in the snapshot.
    pub fn len(&self) -> usize {
        self.forwardings.len()
    }

    /// Number of records not yet handed out.
    pub fn remaining(&self) -> usize {
        self.forwardings
            .len()
            .saturating_sub(self.next.load(Ordering::Relaxed))
    }

    /// True if the snapshot has no records.
    pub fn is_empty(&self) -> bool {
        self.forwardings.is_empty()
    }
}
