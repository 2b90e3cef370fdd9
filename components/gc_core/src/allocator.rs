//! Region allocation.
//!
//! [`RegionAllocator`] is the seam between the relocation engine and the
//! heap's region source. [`RegionHeap`] is the in-process implementation: it
//! hands out granule-aligned extents from a fixed address range, keeps a
//! granule map for address lookups, and owns per-age allocation and
//! relocation target regions.
//!
//! Regions are never released synchronously. Freed extents and stale region
//! descriptors are handed to `crossbeam-epoch` and only reclaimed once every
//! thread that was pinned at the time of the release has unpinned. Barrier
//! lookups pin the epoch, so an extent cannot be recycled under a reader.

use crate::config::GcConfig;
use crossbeam_epoch as epoch;
use gc_types::{
    Address, GcError, GcResult, GenerationId, Region, RegionAge, RegionId, SizeClass, GRANULE_SIZE,
};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Region source used by the collector.
pub trait RegionAllocator: Send + Sync {
    /// Allocates an empty small or medium region.
    fn alloc_region(&self, size_class: SizeClass, age: RegionAge) -> GcResult<Arc<Region>>;

    /// Returns every live region, ordered by address.
    fn regions(&self) -> Vec<Arc<Region>>;

    /// Returns the live regions of one generation, ordered by address.
    fn regions_of(&self, generation: GenerationId) -> Vec<Arc<Region>> {
        self.regions()
            .into_iter()
            .filter(|region| region.generation() == generation)
            .collect()
    }

    /// Returns the region containing `addr`.
    fn region_for(&self, addr: Address) -> Option<Arc<Region>>;

    /// Allocates space for a relocated object in a target region of `age`.
    ///
    /// Returns `None` when no target space is left.
    fn alloc_object_for_relocation(&self, age: RegionAge, size: usize) -> Option<Address>;

    /// Gives back a relocation allocation that lost a forwarding race.
    fn undo_alloc_object_for_relocation(&self, addr: Address, size: usize);

    /// Stops allocating into the current relocation targets.
    fn retire_relocation_targets(&self);

    /// Stops allocating into the current mutator allocation regions.
    fn retire_allocation_regions(&self);

    /// Installs `new` as the descriptor for the extent of `old`.
    fn replace_region(&self, old: &Arc<Region>, new: Arc<Region>);

    /// Unmaps a region and reclaims its extent once no reader can observe it.
    fn free_region(&self, region: Arc<Region>);

    /// Frees a batch of regions.
    fn free_regions(&self, regions: Vec<Arc<Region>>) {
        for region in regions {
            self.free_region(region);
        }
    }

    /// Destroys a stale descriptor whose extent lives on under a replacement.
    fn safe_destroy_region(&self, region: Arc<Region>);

    /// Bytes covered by live regions.
    fn used(&self) -> usize;

    /// Total bytes the allocator can hand out.
    fn capacity(&self) -> usize;
}

#[derive(Default)]
struct DeferredCounters {
    pending_frees: AtomicUsize,
    pending_destroys: AtomicUsize,
    freed: AtomicUsize,
    destroyed: AtomicUsize,
}

/// Granule occupancy of the address range.
struct GranuleMap {
    used: Vec<bool>,
}

impl GranuleMap {
    /// Finds and reserves `n` consecutive free granules, first fit.
    fn reserve(&mut self, n: usize) -> Option<usize> {
        let mut run = 0;
        for index in 0..self.used.len() {
            if self.used[index] {
                run = 0;
                continue;
            }
            run += 1;
            if run == n {
                let start = index + 1 - n;
                self.used[start..=index].iter_mut().for_each(|g| *g = true);
                return Some(start);
            }
        }
        None
    }

    fn release(&mut self, start: usize, n: usize) {
        for granule in &mut self.used[start..start + n] {
            debug_assert!(*granule, "granule released twice");
            *granule = false;
        }
    }

    fn free_granules(&self) -> usize {
        self.used.iter().filter(|g| !**g).count()
    }
}

#[derive(Default)]
struct RegionMap {
    /// Live regions by start address
    by_start: BTreeMap<usize, Arc<Region>>,
    /// Live regions by granule index
    by_granule: HashMap<usize, Arc<Region>>,
}

impl RegionMap {
    fn insert(&mut self, region: Arc<Region>) {
        for granule in region.start().granule()..region.end().granule() {
            self.by_granule.insert(granule, Arc::clone(&region));
        }
        self.by_start.insert(region.start().0, region);
    }

    /// Removes `region` if it is still the descriptor mapped at its start.
    fn remove(&mut self, region: &Arc<Region>) -> bool {
        match self.by_start.get(&region.start().0) {
            Some(current) if Arc::ptr_eq(current, region) => {}
            _ => return false,
        }
        self.by_start.remove(&region.start().0);
        for granule in region.start().granule()..region.end().granule() {
            self.by_granule.remove(&granule);
        }
        true
    }
}

type TargetKey = (bool, RegionAge);

/// True if `seen` is still the region installed for `key`.
fn is_installed(map: &HashMap<TargetKey, Arc<Region>>, key: TargetKey, seen: &Option<Arc<Region>>) -> bool {
    match (map.get(&key), seen) {
        (Some(installed), Some(seen)) => Arc::ptr_eq(installed, seen),
        (None, None) => true,
        _ => false,
    }
}

/// In-process region allocator over a simulated address range.
pub struct RegionHeap {
    medium_region_size: usize,
    small_object_limit: usize,
    medium_object_limit: usize,
    capacity: usize,
    /// Granule index of the first allocatable address
    base_granule: usize,
    next_id: AtomicU32,
    granules: Arc<Mutex<GranuleMap>>,
    regions: Mutex<RegionMap>,
    /// Mutator allocation regions keyed by (medium, age)
    allocating: Mutex<HashMap<TargetKey, Arc<Region>>>,
    /// Relocation target regions keyed by (medium, age)
    targets: Mutex<HashMap<TargetKey, Arc<Region>>>,
    deferred: Arc<DeferredCounters>,
}

impl RegionHeap {
    /// Creates a heap covering `config.heap_capacity` bytes.
    ///
    /// Granule zero is never handed out, so the null address is never inside
    /// a region.
    pub fn new(config: &GcConfig) -> GcResult<Self> {
        config.validate()?;
        let ngranules = config.heap_capacity / GRANULE_SIZE;
        Ok(RegionHeap {
            medium_region_size: config.medium_region_size,
            small_object_limit: config.small_object_limit(),
            medium_object_limit: config.medium_object_limit(),
            capacity: config.heap_capacity,
            base_granule: 1,
            next_id: AtomicU32::new(1),
            granules: Arc::new(Mutex::new(GranuleMap {
                used: vec![false; ngranules],
            })),
            regions: Mutex::new(RegionMap::default()),
            allocating: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            deferred: Arc::new(DeferredCounters::default()),
        })
    }

    /// Size class used for an object of `size` bytes.
    pub fn size_class_for(&self, size: usize) -> SizeClass {
        if size <= self.small_object_limit {
            SizeClass::Small
        } else if size <= self.medium_object_limit {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    fn map_extent(&self, size_class: SizeClass, size: usize, age: RegionAge) -> GcResult<Arc<Region>> {
        let ngranules = size.div_ceil(GRANULE_SIZE);
        let start = self
            .granules
            .lock()
            .reserve(ngranules)
            .ok_or(GcError::HeapExhausted { requested: size })?;

        let id = RegionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let region = Arc::new(Region::new(
            id,
            size_class,
            Address((self.base_granule + start) * GRANULE_SIZE),
            ngranules * GRANULE_SIZE,
            age,
        ));
        trace!("allocated {:?} region {} at {}", size_class, id, region.start());
        self.regions.lock().insert(Arc::clone(&region));
        Ok(region)
    }

    /// Allocates a large region holding exactly one object of `size` bytes.
    pub fn alloc_large_region(&self, size: usize, age: RegionAge) -> GcResult<Arc<Region>> {
        self.map_extent(SizeClass::Large, size, age)
    }

    /// Allocates a mutator object in a region of `age`.
    pub fn alloc_object(&self, age: RegionAge, size: usize) -> GcResult<Address> {
        match self.size_class_for(size) {
            SizeClass::Large => {
                let region = self.alloc_large_region(size, age)?;
                region
                    .alloc_object(size)
                    .ok_or(GcError::HeapExhausted { requested: size })
            }
            size_class => self
                .alloc_shared(&self.allocating, size_class, age, size)
                .ok_or(GcError::HeapExhausted { requested: size }),
        }
    }

    /// Bump-allocates in the shared region for (size class, age), replacing
    /// it with a fresh region when it is full.
    ///
    /// The fresh region is allocated without holding the shared lock and
    /// only installed if no other thread replaced the full one meanwhile.
    fn alloc_shared(
        &self,
        shared: &Mutex<HashMap<TargetKey, Arc<Region>>>,
        size_class: SizeClass,
        age: RegionAge,
        size: usize,
    ) -> Option<Address> {
        let key = (size_class == SizeClass::Medium, age);
        // Region allocated by a lost install race, reused on the next miss
        let mut spare: Option<Arc<Region>> = None;

        let addr = loop {
            let current = shared.lock().get(&key).cloned();
            if let Some(region) = &current {
                if let Some(addr) = region.alloc_object(size) {
                    break Some(addr);
                }
            }

            let fresh = match spare.take() {
                Some(region) => region,
                None => match self.alloc_region(size_class, age) {
                    Ok(region) => region,
                    // Another thread may have installed a region meanwhile
                    Err(_) if !is_installed(&shared.lock(), key, &current) => continue,
                    Err(_) => break None,
                },
            };

            let mut installed = shared.lock();
            if is_installed(&installed, key, &current) {
                installed.insert(key, fresh);
            } else {
                trace!("lost install race for {:?} {}", size_class, age);
                spare = Some(fresh);
            }
        };

        if let Some(region) = spare {
            self.free_region(region);
        }
        addr
    }

    /// Number of free granules.
    pub fn free_granules(&self) -> usize {
        self.granules.lock().free_granules()
    }

    /// Freed regions whose extents are not yet reclaimed.
    pub fn pending_frees(&self) -> usize {
        self.deferred.pending_frees.load(Ordering::Acquire)
    }

    /// Stale descriptors not yet destroyed.
    pub fn pending_destroys(&self) -> usize {
        self.deferred.pending_destroys.load(Ordering::Acquire)
    }

    /// Extents reclaimed so far.
    pub fn freed_regions(&self) -> usize {
        self.deferred.freed.load(Ordering::Acquire)
    }

    /// Stale descriptors destroyed so far.
    pub fn destroyed_regions(&self) -> usize {
        self.deferred.destroyed.load(Ordering::Acquire)
    }

    /// Pushes deferred work forward until nothing is pending or `rounds`
    /// attempts were made. Returns true if nothing is pending.
    pub fn flush_deferred(&self, rounds: usize) -> bool {
        for _ in 0..rounds {
            if self.pending_frees() == 0 && self.pending_destroys() == 0 {
                return true;
            }
            epoch::pin().flush();
            std::thread::yield_now();
        }
        self.pending_frees() == 0 && self.pending_destroys() == 0
    }
}

impl RegionAllocator for RegionHeap {
    fn alloc_region(&self, size_class: SizeClass, age: RegionAge) -> GcResult<Arc<Region>> {
        let size = match size_class {
            SizeClass::Small => GRANULE_SIZE,
            SizeClass::Medium => self.medium_region_size,
            SizeClass::Large => panic!("large regions are sized by their object"),
        };
        self.map_extent(size_class, size, age)
    }

    fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.lock().by_start.values().cloned().collect()
    }

    fn region_for(&self, addr: Address) -> Option<Arc<Region>> {
        self.regions.lock().by_granule.get(&addr.granule()).cloned()
    }

    fn alloc_object_for_relocation(&self, age: RegionAge, size: usize) -> Option<Address> {
        let size_class = match self.size_class_for(size) {
            SizeClass::Large => return None,
            size_class => size_class,
        };
        self.alloc_shared(&self.targets, size_class, age, size)
    }

    fn undo_alloc_object_for_relocation(&self, addr: Address, size: usize) {
        if let Some(region) = self.region_for(addr) {
            region.undo_alloc_object(addr, size);
        }
    }

    fn retire_relocation_targets(&self) {
        self.targets.lock().clear();
    }

    fn retire_allocation_regions(&self) {
        self.allocating.lock().clear();
    }

    fn replace_region(&self, old: &Arc<Region>, new: Arc<Region>) {
        assert_eq!(old.id(), new.id(), "replacement must keep the region id");
        assert_eq!(old.start(), new.start(), "replacement must keep the extent");
        let mut regions = self.regions.lock();
        assert!(regions.remove(old), "region {} is not mapped", old.id());
        regions.insert(new);
    }

    fn free_region(&self, region: Arc<Region>) {
        if !self.regions.lock().remove(&region) {
            return;
        }
        self.allocating
            .lock()
            .retain(|_, current| !Arc::ptr_eq(current, &region));
        self.targets
            .lock()
            .retain(|_, current| !Arc::ptr_eq(current, &region));

        debug!("freeing region {} ({} bytes)", region.id(), region.size());
        let start = region.start().granule() - self.base_granule;
        let ngranules = region.size() / GRANULE_SIZE;
        let granules = Arc::clone(&self.granules);
        let deferred = Arc::clone(&self.deferred);
        deferred.pending_frees.fetch_add(1, Ordering::AcqRel);

        let guard = epoch::pin();
        guard.defer(move || {
            drop(region);
            granules.lock().release(start, ngranules);
            deferred.freed.fetch_add(1, Ordering::AcqRel);
            deferred.pending_frees.fetch_sub(1, Ordering::AcqRel);
        });
        guard.flush();
    }

    fn safe_destroy_region(&self, region: Arc<Region>) {
        trace!("destroying stale descriptor of {}", region.id());
        let deferred = Arc::clone(&self.deferred);
        deferred.pending_destroys.fetch_add(1, Ordering::AcqRel);

        let guard = epoch::pin();
        guard.defer(move || {
            drop(region);
            deferred.destroyed.fetch_add(1, Ordering::AcqRel);
            deferred.pending_destroys.fetch_sub(1, Ordering::AcqRel);
        });
        guard.flush();
    }

    fn used(&self) -> usize {
        self.regions.lock().by_start.values().map(|r| r.size()).sum()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
