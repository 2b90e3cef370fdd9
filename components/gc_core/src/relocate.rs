//! Relocation of live objects out of the relocation set.
//!
//! Relocation workers take forwarding records from two sources:
//! - the [`RelocateQueue`], where mutators hand over records they need
//!   finished before they can proceed
//! - the relocation set's parallel iterator
//!
//! The queue is polled first. Every record is claimed by exactly one worker,
//! which relocates all live objects of the region. Mutator barriers relocate
//! individual objects concurrently; the forwarding entry CAS picks one copy.
//!
//! When no target space is left, the record switches to in-place mode: the
//! remaining objects forward to themselves and the region survives the cycle
//! retagged to its to-age.

use crate::allocator::RegionAllocator;
use crate::forwarding::ForwardingRef;
use crate::relocation_set::{RelocationSet, RelocationSetParallelIterator};
use crate::workers::{RestartableTask, WorkerContext, WorkerPool, WorkerTask};
use gc_types::{Address, GenerationId, Region, RegionAge};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Forwarding records one relocation worker is sized for.
pub const RECORDS_PER_WORKER: usize = 4;

/// Age of a region's objects after relocation.
///
/// Eden counts as survivor age zero. Survivors at or above the tenuring
/// threshold, and every young region when `promote_all` is set, go to old.
pub fn compute_to_age(from: RegionAge, promote_all: bool, tenuring_threshold: u8) -> RegionAge {
    let age = match from {
        RegionAge::Old => return RegionAge::Old,
        _ if promote_all => return RegionAge::Old,
        RegionAge::Eden => 0,
        RegionAge::Survivor(age) => age,
    };
    if age >= tenuring_threshold {
        RegionAge::Old
    } else {
        RegionAge::Survivor(age + 1)
    }
}

/// Number of relocation workers wanted for the work that is left.
///
/// Records handed over by mutators count one worker each, since a mutator
/// is waiting for every one of them.
pub fn wanted_workers(remaining: usize, queued: usize, max_workers: usize) -> usize {
    (remaining.div_ceil(RECORDS_PER_WORKER) + queued).clamp(1, max_workers)
}

/// Outcome of polling the relocation queue.
#[derive(Debug)]
pub enum Polled {
    /// A record the caller claimed and must relocate
    Forwarding(ForwardingRef),
    /// The queue is synchronized; stay away from forwarding state
    Synchronized,
    /// Nothing to do
    Empty,
}

struct QueueState {
    queue: VecDeque<ForwardingRef>,
    /// Joined workers that have not left
    nworkers: usize,
    /// Workers that observed the current synchronization
    nsynchronized: usize,
    /// Nesting depth of synchronize calls
    synchronize: usize,
    /// Bumped whenever a new synchronization starts
    epoch: u64,
}

/// Rendezvous between relocation workers and mutators.
///
/// `needs_attention` counts the reasons a poll must take the lock: a
/// non-empty queue and an active synchronization, so it ranges over `0..=2`.
/// A zero read means the queue is empty and unsynchronized.
pub struct RelocateQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    needs_attention: AtomicUsize,
}

impl Default for RelocateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RelocateQueue {
    /// Creates an empty queue with no joined workers.
    pub fn new() -> Self {
        RelocateQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                nworkers: 0,
                nsynchronized: 0,
                synchronize: 0,
                epoch: 0,
            }),
            cond: Condvar::new(),
            needs_attention: AtomicUsize::new(0),
        }
    }

    fn inc_needs_attention(&self) {
        let previous = self.needs_attention.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous < 2, "needs attention overflow");
    }

    fn dec_needs_attention(&self) {
        let previous = self.needs_attention.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "needs attention underflow");
    }

    /// Current needs-attention count.
    pub fn needs_attention(&self) -> usize {
        self.needs_attention.load(Ordering::Acquire)
    }

    /// Announces `nworkers` relocation workers.
    ///
    /// # Panics
    ///
    /// Panics if workers from a previous join have not all left.
    pub fn join(&self, nworkers: usize) {
        let mut state = self.state.lock();
        assert_eq!(state.nworkers, 0, "relocation workers already joined");
        debug!("relocate queue: {} workers joined", nworkers);
        state.nworkers = nworkers;
    }

    /// Returns the participation token of one joined worker.
    ///
    /// Dropping the token leaves the queue.
    ///
    /// # Panics
    ///
    /// Panics if no worker joined.
    pub fn participant(&self) -> QueueParticipant<'_> {
        assert!(self.state.lock().nworkers > 0, "polling relocate queue without joining");
        QueueParticipant {
            queue: self,
            counted_epoch: Cell::new(0),
        }
    }

    fn leave(&self, counted_epoch: u64) {
        let mut state = self.state.lock();
        assert!(state.nworkers > 0, "relocate queue left more often than joined");
        state.nworkers -= 1;
        if state.synchronize > 0 && counted_epoch == state.epoch {
            state.nsynchronized -= 1;
        }
        // A synchronizer may be waiting for this worker
        self.cond.notify_all();
    }

    /// Number of joined workers that have not left.
    pub fn nworkers(&self) -> usize {
        self.state.lock().nworkers
    }

    /// Number of records waiting in the queue.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True if no record is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while at least one synchronization is active.
    pub fn is_synchronized(&self) -> bool {
        self.state.lock().synchronize > 0
    }

    fn push(&self, state: &mut QueueState, forwarding: ForwardingRef) {
        state.queue.push_back(forwarding);
        if state.queue.len() == 1 {
            self.inc_needs_attention();
        }
        self.cond.notify_all();
    }

    /// Hands a record to the workers.
    ///
    /// Returns false if no worker is joined, in which case the caller has to
    /// do the work itself.
    pub fn add(&self, forwarding: ForwardingRef) -> bool {
        let mut state = self.state.lock();
        if state.nworkers == 0 {
            return false;
        }
        trace!("relocate queue: added {}", forwarding.region().id());
        self.push(&mut state, forwarding);
        true
    }

    /// Hands a record to the workers and waits until it is fully relocated.
    ///
    /// Returns false without waiting if no worker is joined. Must not be
    /// called while the caller itself holds a synchronization.
    pub fn add_and_wait(&self, forwarding: ForwardingRef) -> bool {
        let mut state = self.state.lock();
        if forwarding.is_done() {
            return true;
        }
        if state.nworkers == 0 {
            return false;
        }
        self.push(&mut state, forwarding.clone());
        while !forwarding.is_done() {
            self.cond.wait(&mut state);
        }
        true
    }

    /// Wakes threads waiting for a record to be done.
    pub fn notify_done(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Drops every queued record.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            state.queue.clear();
            self.dec_needs_attention();
        }
        self.cond.notify_all();
    }

    /// Removes finished records and claims the first unclaimed one.
    fn prune_and_claim(&self, state: &mut QueueState) -> Option<ForwardingRef> {
        let before = state.queue.len();
        state.queue.retain(|f| !f.is_done());
        if state.queue.len() != before {
            if state.queue.is_empty() {
                self.dec_needs_attention();
            }
            self.cond.notify_all();
        }
        state.queue.iter().find(|f| f.claim()).cloned()
    }

    /// Stops every joined worker at its next poll and waits until all of
    /// them acknowledged.
    ///
    /// Calls nest; workers stay synchronized until the outermost
    /// [`desynchronize`](Self::desynchronize).
    pub fn synchronize(&self) {
        let mut state = self.state.lock();
        state.synchronize += 1;
        if state.synchronize == 1 {
            state.epoch += 1;
            state.nsynchronized = 0;
            self.inc_needs_attention();
        }
        debug!(
            "relocate queue: synchronize (depth {}, epoch {})",
            state.synchronize, state.epoch
        );
        while state.nsynchronized < state.nworkers {
            self.cond.wait(&mut state);
        }
    }

    /// Releases one synchronization.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not synchronized.
    pub fn desynchronize(&self) {
        let mut state = self.state.lock();
        assert!(state.synchronize > 0, "desynchronize without synchronize");
        state.synchronize -= 1;
        debug!("relocate queue: desynchronize (depth {})", state.synchronize);
        if state.synchronize == 0 {
            state.nsynchronized = 0;
            self.dec_needs_attention();
            self.cond.notify_all();
        }
    }
}

/// Token of a worker that joined a [`RelocateQueue`].
///
/// Polling is only possible through a token, so a worker cannot poll
/// without having joined.
pub struct QueueParticipant<'a> {
    queue: &'a RelocateQueue,
    /// Synchronization epoch this worker was counted in
    counted_epoch: Cell<u64>,
}

impl QueueParticipant<'_> {
    /// Polls the queue.
    pub fn poll(&self) -> Polled {
        let queue = self.queue;
        if queue.needs_attention.load(Ordering::Acquire) == 0 {
            return Polled::Empty;
        }

        let mut state = queue.state.lock();
        if state.synchronize > 0 {
            if self.counted_epoch.get() != state.epoch {
                self.counted_epoch.set(state.epoch);
                state.nsynchronized += 1;
                if state.nsynchronized >= state.nworkers {
                    queue.cond.notify_all();
                }
            }
            return Polled::Synchronized;
        }

        match queue.prune_and_claim(&mut state) {
            Some(forwarding) => Polled::Forwarding(forwarding),
            None => Polled::Empty,
        }
    }

    /// Blocks until the queue is desynchronized.
    pub fn wait_while_synchronized(&self) {
        let mut state = self.queue.state.lock();
        while state.synchronize > 0 {
            self.queue.cond.wait(&mut state);
        }
    }
}

impl Drop for QueueParticipant<'_> {
    fn drop(&mut self) {
        self.queue.leave(self.counted_epoch.get());
    }
}

/// Services relocation needs from the owning collector.
pub trait RelocateOps: Sync {
    /// Region source for relocation targets.
    fn allocator(&self) -> &dyn RegionAllocator;

    /// The installed relocation set.
    fn relocation_set(&self) -> &RelocationSet;

    /// Replaces a wholly live young region with its old-generation
    /// descriptor.
    fn promote_flip(&self, from: &Arc<Region>, to: Arc<Region>);

    /// Replaces a region relocated in place with its old-generation
    /// descriptor.
    fn promote_reloc(&self, from: &Arc<Region>, to: Arc<Region>);

    /// Counts bytes copied by relocation.
    fn increase_relocated(&self, bytes: usize);

    /// Counts bytes moved from young to old.
    fn increase_promoted(&self, bytes: usize);

    /// Records a promoted object, still known by its young address `from`,
    /// if it references young objects.
    fn remember_promoted(&self, from: Address);
}

/// Relocates the object at `from` unless it already has a forwarding entry.
///
/// Returns the object's address after relocation. Safe to race with workers
/// and other mutators on the same object.
///
/// # Panics
///
/// Panics if `from` is not a live object of the record's region.
pub fn relocate_object(ops: &dyn RelocateOps, forwarding: &ForwardingRef, from: Address) -> Address {
    if let Some(to) = forwarding.find(from) {
        return to;
    }
    if forwarding.in_place() {
        return forwarding.insert(from, from);
    }

    let region = forwarding.region();
    let size = match region.live_size(from) {
        Some(size) => size,
        None => panic!("{} is not a live object in {}", from, region.id()),
    };

    let allocator = ops.allocator();
    match allocator.alloc_object_for_relocation(forwarding.to_age(), size) {
        Some(to) => {
            let winner = forwarding.insert(from, to);
            if winner == to {
                forwarding.add_relocated(size);
                ops.increase_relocated(size);
                if forwarding.is_promotion() {
                    ops.increase_promoted(size);
                    ops.remember_promoted(from);
                }
            } else {
                allocator.undo_alloc_object_for_relocation(to, size);
            }
            winner
        }
        None => {
            debug!("{}: no relocation target for {} bytes, relocating in place", region.id(), size);
            forwarding.set_in_place();
            forwarding.insert(from, from)
        }
    }
}

/// Returns the new address of an object that must already be forwarded.
///
/// # Panics
///
/// Panics if `from` has no forwarding entry.
pub fn forward_object(forwarding: &ForwardingRef, from: Address) -> Address {
    match forwarding.find(from) {
        Some(to) => to,
        None => panic!("{} was not relocated", from),
    }
}

/// Relocation driver of one generation.
pub struct Relocate {
    generation: GenerationId,
    queue: RelocateQueue,
}

impl Relocate {
    /// Creates the relocation driver of `generation`.
    pub fn new(generation: GenerationId) -> Self {
        Relocate {
            generation,
            queue: RelocateQueue::new(),
        }
    }

    /// The generation's relocation queue.
    pub fn queue(&self) -> &RelocateQueue {
        &self.queue
    }

    /// Relocates every record of the installed relocation set.
    ///
    /// With a dynamic pool in an active cycle, the worker count follows the
    /// remaining work: worker 0 requests a resize whenever the wanted count
    /// differs from the running one, and the task restarts with it.
    pub fn relocate(&self, workers: &WorkerPool, ops: &dyn RelocateOps) {
        let task = RelocateTask {
            relocate: self,
            ops,
            workers,
            started: Instant::now(),
            iter: ops.relocation_set().par_iter(),
        };
        debug!(
            "{} relocation of {} regions",
            self.generation,
            task.iter.len()
        );

        self.queue.join(workers.active_workers());
        workers.run_restartable(&task);
        self.queue.clear();
    }

    /// Relocates all live objects of a claimed record.
    pub fn relocate_forwarding(&self, ops: &dyn RelocateOps, forwarding: &ForwardingRef) {
        for object in forwarding.region().live_map() {
            relocate_object(ops, forwarding, object.addr);
        }
        if forwarding.in_place() {
            self.finish_in_place(ops, forwarding);
        }
        forwarding.mark_done();
        self.queue.notify_done();
        trace!(
            "{}: relocated {} bytes{}",
            forwarding.region().id(),
            forwarding.relocated_bytes(),
            if forwarding.in_place() { " (in place)" } else { "" }
        );
    }

    fn finish_in_place(&self, ops: &dyn RelocateOps, forwarding: &ForwardingRef) {
        let region = forwarding.region();
        if forwarding.is_promotion() {
            let promoted = Arc::new(region.clone_with_age(RegionAge::Old));
            ops.promote_reloc(region, promoted);
        } else {
            region.set_age(forwarding.to_age());
        }
    }

    /// Ages wholly live young regions without copying.
    ///
    /// Regions staying young are retagged in place. Regions reaching old are
    /// replaced by an old descriptor and their stale descriptors registered
    /// as flip-promoted.
    pub fn flip_age_regions(
        &self,
        ops: &dyn RelocateOps,
        regions: &[Arc<Region>],
        promote_all: bool,
        tenuring_threshold: u8,
    ) {
        let mut flipped = Vec::new();
        for region in regions {
            debug_assert!(region.age().is_young(), "{} is not young", region.id());
            let to_age = compute_to_age(region.age(), promote_all, tenuring_threshold);
            if to_age.is_young() {
                region.set_age(to_age);
            } else {
                let promoted = Arc::new(region.clone_with_age(RegionAge::Old));
                ops.promote_flip(region, promoted);
                flipped.push(Arc::clone(region));
            }
        }

        if !flipped.is_empty() {
            debug!("{} regions flip-promoted", flipped.len());
            ops.relocation_set().register_promote_flipped(&flipped);
        }
    }

    /// Stops relocation workers at their next poll.
    pub fn synchronize(&self) {
        self.queue.synchronize();
    }

    /// Lets relocation workers continue.
    pub fn desynchronize(&self) {
        self.queue.desynchronize();
    }
}

struct RelocateTask<'a> {
    relocate: &'a Relocate,
    ops: &'a dyn RelocateOps,
    workers: &'a WorkerPool,
    started: Instant,
    iter: RelocationSetParallelIterator,
}

impl RelocateTask<'_> {
    fn adjust_workers(&self, ctx: &WorkerContext<'_>) {
        if ctx.worker_id() != 0 || !self.workers.is_dynamic() || self.iter.remaining() == 0 {
            return;
        }
        let stats = self.workers.resize_stats(self.started);
        if !stats.is_active {
            return;
        }
        let wanted = wanted_workers(
            self.iter.remaining(),
            self.relocate.queue.len(),
            self.workers.max_workers(),
        );
        if wanted != stats.nworkers_current {
            debug!(
                "{} relocation: {} records left, {} workers wanted ({:?} serial, {:?} parallel)",
                self.relocate.generation,
                self.iter.remaining(),
                wanted,
                stats.serial_gc_time_passed,
                stats.parallel_gc_time_passed
            );
            self.workers.request_resize(wanted);
        }
    }
}

impl WorkerTask for RelocateTask<'_> {
    fn name(&self) -> &str {
        "relocate"
    }

    fn work(&self, ctx: &WorkerContext<'_>) {
        let participant = self.relocate.queue.participant();
        loop {
            if ctx.should_resize() {
                return;
            }

            match participant.poll() {
                Polled::Forwarding(forwarding) => {
                    self.relocate.relocate_forwarding(self.ops, &forwarding);
                    continue;
                }
                Polled::Synchronized => {
                    participant.wait_while_synchronized();
                    continue;
                }
                Polled::Empty => {}
            }

            match self.iter.next() {
                Some(forwarding) => {
                    if forwarding.claim() {
                        self.relocate.relocate_forwarding(self.ops, &forwarding);
                    }
                    self.adjust_workers(ctx);
                }
                None => return,
            }
        }
    }
}

impl RestartableTask for RelocateTask<'_> {
    fn resize_workers(&self, nworkers: usize) {
        self.relocate.queue.join(nworkers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RegionHeap;
    use crate::config::GcConfig;
    use crate::selector::Selection;
    use gc_types::{SizeClass, GRANULE_SIZE};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    struct TestOps {
        heap: RegionHeap,
        set: RelocationSet,
        relocated: AtomicUsize,
        promoted: AtomicUsize,
        remembered: Mutex<Vec<Address>>,
    }

    impl TestOps {
        fn new(granules: usize) -> Self {
            TestOps {
                heap: RegionHeap::new(&GcConfig {
                    medium_region_size: 2 * GRANULE_SIZE,
                    heap_capacity: granules * GRANULE_SIZE,
                    ..GcConfig::default()
                })
                .unwrap(),
                set: RelocationSet::new(GenerationId::Young),
                relocated: AtomicUsize::new(0),
                promoted: AtomicUsize::new(0),
                remembered: Mutex::new(Vec::new()),
            }
        }

        fn region(&self, age: RegionAge, objects: usize, live_every: usize) -> Arc<Region> {
            let region = self.heap.alloc_region(SizeClass::Small, age).unwrap();
            for i in 0..objects {
                let addr = region.alloc_object(64).unwrap();
                if i % live_every == 0 {
                    region.mark_live(addr, 64);
                }
            }
            region
        }

        fn install(&self, pool: &WorkerPool, small: Vec<Arc<Region>>, threshold: u8) {
            let entries = small.iter().map(|r| crate::forwarding::Forwarding::nentries_for(r.live_objects())).sum();
            let mut selection = Selection::new(small, Vec::new(), entries);
            selection.tenuring_threshold = threshold;
            self.set.install(pool, &selection);
        }
    }

    impl RelocateOps for TestOps {
        fn allocator(&self) -> &dyn RegionAllocator {
            &self.heap
        }

        fn relocation_set(&self) -> &RelocationSet {
            &self.set
        }

        fn promote_flip(&self, from: &Arc<Region>, to: Arc<Region>) {
            self.heap.replace_region(from, to);
        }

        fn promote_reloc(&self, from: &Arc<Region>, to: Arc<Region>) {
            self.heap.replace_region(from, to);
            self.set.register_promote_relocated(Arc::clone(from));
        }

        fn increase_relocated(&self, bytes: usize) {
            self.relocated.fetch_add(bytes, Ordering::Relaxed);
        }

        fn increase_promoted(&self, bytes: usize) {
            self.promoted.fetch_add(bytes, Ordering::Relaxed);
        }

        fn remember_promoted(&self, from: Address) {
            self.remembered.lock().push(from);
        }
    }

    #[test]
    fn test_compute_to_age() {
        assert_eq!(compute_to_age(RegionAge::Eden, false, 2), RegionAge::Survivor(1));
        assert_eq!(compute_to_age(RegionAge::Survivor(1), false, 2), RegionAge::Survivor(2));
        assert_eq!(compute_to_age(RegionAge::Survivor(2), false, 2), RegionAge::Old);
        assert_eq!(compute_to_age(RegionAge::Eden, true, 2), RegionAge::Old);
        assert_eq!(compute_to_age(RegionAge::Eden, false, 0), RegionAge::Old);
        assert_eq!(compute_to_age(RegionAge::Old, false, 4), RegionAge::Old);
    }

    #[test]
    fn test_relocate_object_copies_once() {
        let ops = TestOps::new(16);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let region = ops.region(RegionAge::Eden, 4, 1);
        ops.install(&pool, vec![Arc::clone(&region)], 4);
        let forwarding = ops.set.forwarding(0).unwrap();
        let from = region.live_map()[0].addr;

        let to = relocate_object(&ops, &forwarding, from);
        assert_ne!(to, from);
        assert_eq!(relocate_object(&ops, &forwarding, from), to);
        assert_eq!(forward_object(&forwarding, from), to);
        assert_eq!(ops.heap.region_for(to).unwrap().age(), RegionAge::Survivor(1));
        assert_eq!(ops.relocated.load(Ordering::Relaxed), 64);
        assert_eq!(ops.promoted.load(Ordering::Relaxed), 0);
        assert!(ops.remembered.lock().is_empty());
    }

    #[test]
    fn test_promoting_copy_is_remembered_once() {
        let ops = TestOps::new(16);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let region = ops.region(RegionAge::Survivor(2), 4, 1);
        ops.install(&pool, vec![Arc::clone(&region)], 2);
        let forwarding = ops.set.forwarding(0).unwrap();
        let from = region.live_map()[0].addr;

        let to = relocate_object(&ops, &forwarding, from);
        relocate_object(&ops, &forwarding, from);
        assert_eq!(ops.heap.region_for(to).unwrap().age(), RegionAge::Old);
        assert_eq!(*ops.remembered.lock(), vec![from]);
    }

    #[test]
    fn test_racing_relocations_agree() {
        let ops = TestOps::new(16);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let region = ops.region(RegionAge::Eden, 32, 1);
        ops.install(&pool, vec![Arc::clone(&region)], 4);
        let forwarding = ops.set.forwarding(0).unwrap();
        let objects = region.live_map();

        let results: Vec<Vec<Address>> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let ops = &ops;
                    let forwarding = forwarding.clone();
                    let objects = &objects;
                    s.spawn(move || {
                        objects
                            .iter()
                            .map(|o| relocate_object(ops, &forwarding, o.addr))
                            .collect::<Vec<Address>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for window in results.windows(2) {
            assert_eq!(window[0], window[1]);
        }
        assert_eq!(ops.relocated.load(Ordering::Relaxed), 32 * 64);
    }

    #[test]
    #[should_panic(expected = "was not relocated")]
    fn test_forward_unrelocated_object_panics() {
        let ops = TestOps::new(16);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let region = ops.region(RegionAge::Eden, 1, 1);
        ops.install(&pool, vec![Arc::clone(&region)], 4);
        forward_object(&ops.set.forwarding(0).unwrap(), region.live_map()[0].addr);
    }

    #[test]
    fn test_relocation_falls_back_to_in_place() {
        // Four granules; medium regions take two, so nothing is left for targets
        let ops = TestOps::new(4);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let region = ops.region(RegionAge::Eden, 8, 2);
        for _ in 0..3 {
            ops.heap.alloc_region(SizeClass::Small, RegionAge::Old).unwrap();
        }
        ops.install(&pool, vec![Arc::clone(&region)], 4);

        let relocate = Relocate::new(GenerationId::Young);
        relocate.relocate(&pool, &ops);

        let forwarding = ops.set.forwarding(0).unwrap();
        assert!(forwarding.in_place());
        assert!(forwarding.is_done());
        for object in region.live_map() {
            assert_eq!(forward_object(&forwarding, object.addr), object.addr);
        }
        assert_eq!(region.age(), RegionAge::Survivor(1));
    }

    #[test]
    fn test_in_place_promotion_registers_region() {
        let ops = TestOps::new(4);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let region = ops.region(RegionAge::Survivor(3), 4, 1);
        for _ in 0..3 {
            ops.heap.alloc_region(SizeClass::Small, RegionAge::Old).unwrap();
        }
        ops.install(&pool, vec![Arc::clone(&region)], 3);

        Relocate::new(GenerationId::Young).relocate(&pool, &ops);

        let promoted = ops.set.promote_relocated();
        assert_eq!(promoted.len(), 1);
        assert!(Arc::ptr_eq(&promoted[0], &region));
        assert_eq!(ops.heap.region_for(region.start()).unwrap().age(), RegionAge::Old);
    }

    #[test]
    fn test_relocate_whole_set_in_parallel() {
        let ops = TestOps::new(64);
        let pool = WorkerPool::try_new(GenerationId::Young, 4, true).unwrap();
        let regions: Vec<_> = (0..12).map(|_| ops.region(RegionAge::Eden, 16, 3)).collect();
        ops.install(&pool, regions.clone(), 4);

        Relocate::new(GenerationId::Young).relocate(&pool, &ops);

        let live: usize = regions.iter().map(|r| r.live_bytes()).sum();
        assert_eq!(ops.relocated.load(Ordering::Relaxed), live);
        for forwarding in ops.set.forwardings() {
            assert!(forwarding.is_claimed());
            assert!(forwarding.is_done());
            assert!(!forwarding.in_place());
            for object in forwarding.region().live_map() {
                let to = forward_object(&forwarding, object.addr);
                assert!(!forwarding.region().contains(to));
            }
        }
    }

    #[test]
    fn test_wanted_workers_follow_remaining_work() {
        assert_eq!(wanted_workers(0, 0, 4), 1);
        assert_eq!(wanted_workers(5, 0, 4), 2);
        assert_eq!(wanted_workers(5, 1, 4), 3);
        assert_eq!(wanted_workers(100, 0, 4), 4);
    }

    #[test]
    fn test_relocation_resizes_dynamic_pool() {
        let ops = TestOps::new(64);
        let pool = WorkerPool::try_new(GenerationId::Young, 4, true).unwrap();
        let regions: Vec<_> = (0..16).map(|_| ops.region(RegionAge::Eden, 16, 3)).collect();
        ops.install(&pool, regions.clone(), 4);
        pool.set_active();
        pool.set_active_workers(1);

        Relocate::new(GenerationId::Young).relocate(&pool, &ops);
        pool.set_inactive();

        // 15 records left after the first one want four workers: a restart
        assert!(pool.stats().tasks >= 2);
        let live: usize = regions.iter().map(|r| r.live_bytes()).sum();
        assert_eq!(ops.relocated.load(Ordering::Relaxed), live);
        assert!(ops.set.forwardings().iter().all(|f| f.is_done()));
    }

    #[test]
    fn test_static_pool_keeps_its_size() {
        let ops = TestOps::new(64);
        let pool = WorkerPool::try_new(GenerationId::Young, 4, false).unwrap();
        let regions: Vec<_> = (0..16).map(|_| ops.region(RegionAge::Eden, 16, 3)).collect();
        ops.install(&pool, regions, 4);
        pool.set_active();

        Relocate::new(GenerationId::Young).relocate(&pool, &ops);
        assert_eq!(pool.active_workers(), 4);
        assert_eq!(pool.stats().tasks, 1);
    }

    #[test]
    fn test_flip_age_regions() {
        let ops = TestOps::new(16);
        let relocate = Relocate::new(GenerationId::Young);
        let young = ops.region(RegionAge::Eden, 2, 1);
        let tenured = ops.region(RegionAge::Survivor(2), 2, 1);

        relocate.flip_age_regions(&ops, &[Arc::clone(&young), Arc::clone(&tenured)], false, 2);

        assert_eq!(young.age(), RegionAge::Survivor(1));
        assert_eq!(ops.heap.region_for(tenured.start()).unwrap().age(), RegionAge::Old);
        let flipped = ops.set.promote_flipped();
        assert_eq!(flipped.len(), 1);
        assert!(Arc::ptr_eq(&flipped[0], &tenured));
    }

    #[test]
    fn test_flip_promote_all() {
        let ops = TestOps::new(16);
        let relocate = Relocate::new(GenerationId::Young);
        let regions: Vec<_> = (0..3).map(|_| ops.region(RegionAge::Eden, 1, 1)).collect();
        relocate.flip_age_regions(&ops, &regions, true, 4);
        assert_eq!(ops.set.promote_flipped().len(), 3);
        assert_eq!(ops.heap.regions_of(GenerationId::Old).len(), 3);
    }

    fn queued_forwardings(n: usize) -> (TestOps, Vec<ForwardingRef>) {
        let ops = TestOps::new(32);
        let pool = WorkerPool::try_new(GenerationId::Young, 1, true).unwrap();
        let regions: Vec<_> = (0..n).map(|_| ops.region(RegionAge::Eden, 1, 1)).collect();
        ops.install(&pool, regions, 4);
        let forwardings = ops.set.forwardings();
        (ops, forwardings)
    }

    #[test]
    fn test_poll_fast_path_when_idle() {
        let queue = RelocateQueue::new();
        queue.join(1);
        let participant = queue.participant();
        assert_eq!(queue.needs_attention(), 0);
        assert!(matches!(participant.poll(), Polled::Empty));
    }

    #[test]
    #[should_panic(expected = "without joining")]
    fn test_participant_requires_join() {
        let queue = RelocateQueue::new();
        let _participant = queue.participant();
    }

    #[test]
    fn test_add_without_workers_is_refused() {
        let (_ops, forwardings) = queued_forwardings(1);
        let queue = RelocateQueue::new();
        assert!(!queue.add(forwardings[0].clone()));
        assert!(!queue.add_and_wait(forwardings[0].clone()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queued_record_claimed_once() {
        let (_ops, forwardings) = queued_forwardings(2);
        let queue = RelocateQueue::new();
        queue.join(2);
        let a = queue.participant();
        let b = queue.participant();

        assert!(queue.add(forwardings[0].clone()));
        assert_eq!(queue.needs_attention(), 1);
        match a.poll() {
            Polled::Forwarding(f) => assert!(f.same(&forwardings[0])),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(b.poll(), Polled::Empty));

        forwardings[0].mark_done();
        assert!(matches!(b.poll(), Polled::Empty));
        assert_eq!(queue.needs_attention(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_synchronize_then_deliver_exactly_once() {
        let (_ops, forwardings) = queued_forwardings(3);
        let queue = RelocateQueue::new();
        queue.join(1);
        let participant = queue.participant();
        for f in &forwardings {
            assert!(queue.add(f.clone()));
        }

        thread::scope(|s| {
            let synchronizer = s.spawn(|| queue.synchronize());
            // The synchronizer cannot return before the worker acknowledged
            while !queue.is_synchronized() {
                thread::yield_now();
            }
            assert!(!synchronizer.is_finished());
            assert!(matches!(participant.poll(), Polled::Synchronized));
            synchronizer.join().unwrap();
        });

        for _ in 0..5 {
            assert!(matches!(participant.poll(), Polled::Synchronized));
        }
        assert_eq!(queue.needs_attention(), 2);
        queue.desynchronize();

        let mut delivered = Vec::new();
        loop {
            match participant.poll() {
                Polled::Forwarding(f) => {
                    delivered.push(f.slot());
                    f.mark_done();
                }
                Polled::Empty => break,
                Polled::Synchronized => panic!("still synchronized"),
            }
        }
        delivered.sort();
        assert_eq!(delivered, vec![0, 1, 2]);
        assert_eq!(queue.needs_attention(), 0);
    }

    #[test]
    fn test_nested_synchronize() {
        let queue = RelocateQueue::new();
        queue.synchronize();
        queue.synchronize();
        queue.desynchronize();
        assert!(queue.is_synchronized());
        queue.desynchronize();
        assert!(!queue.is_synchronized());
        assert_eq!(queue.needs_attention(), 0);
    }

    #[test]
    #[should_panic(expected = "desynchronize without synchronize")]
    fn test_unbalanced_desynchronize_panics() {
        RelocateQueue::new().desynchronize();
    }

    #[test]
    fn test_leaving_worker_releases_synchronizer() {
        let queue = RelocateQueue::new();
        queue.join(2);
        let stays = queue.participant();
        let leaves = queue.participant();

        thread::scope(|s| {
            let synchronizer = s.spawn(|| queue.synchronize());
            while !queue.is_synchronized() {
                thread::yield_now();
            }
            assert!(matches!(stays.poll(), Polled::Synchronized));
            drop(leaves);
            synchronizer.join().unwrap();
        });
        assert_eq!(queue.nworkers(), 1);
        queue.desynchronize();
        drop(stays);
        assert_eq!(queue.nworkers(), 0);
    }

    #[test]
    fn test_worker_waits_until_desynchronized() {
        let queue = RelocateQueue::new();
        queue.join(1);
        let released = AtomicBool::new(false);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                let participant = queue.participant();
                loop {
                    match participant.poll() {
                        Polled::Synchronized => {
                            participant.wait_while_synchronized();
                            return released.load(Ordering::Acquire);
                        }
                        _ => thread::yield_now(),
                    }
                }
            });
            queue.synchronize();
            thread::sleep(Duration::from_millis(10));
            released.store(true, Ordering::Release);
            queue.desynchronize();
            assert!(worker.join().unwrap());
        });
    }

    #[test]
    fn test_add_and_wait_returns_when_done() {
        let (_ops, forwardings) = queued_forwardings(1);
        let queue = RelocateQueue::new();
        queue.join(1);
        let forwarding = forwardings[0].clone();

        thread::scope(|s| {
            let worker = s.spawn(|| {
                let participant = queue.participant();
                loop {
                    if let Polled::Forwarding(f) = participant.poll() {
                        f.mark_done();
                        queue.notify_done();
                        return;
                    }
                    thread::yield_now();
                }
            });
            assert!(queue.add_and_wait(forwarding.clone()));
            assert!(forwarding.is_done());
            worker.join().unwrap();
        });
    }

    #[test]
    fn test_clear_resets_attention() {
        let (_ops, forwardings) = queued_forwardings(2);
        let queue = RelocateQueue::new();
        queue.join(1);
        queue.add(forwardings[0].clone());
        queue.add(forwardings[1].clone());
        assert_eq!(queue.needs_attention(), 1);
        queue.clear();
        assert_eq!(queue.needs_attention(), 0);
        assert!(queue.is_empty());
    }
}
