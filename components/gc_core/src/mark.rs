//! Mark engine seam and an in-process root-set marker.
//!
//! The collector drives marking through [`MarkEngine`] and only consumes its
//! result: the live maps of the generation's regions. [`RootSetMarker`]
//! traces an explicit object graph from a root set with the generation's
//! worker pool, using a shared `crossbeam-deque` injector as the mark stack.
//!
//! Young marking stops at old objects. Old-to-young references reach it
//! through the [`RememberedSet`], which [`RootSetMarker::add_edge`] and
//! promotion keep up to date.

use crate::allocator::RegionAllocator;
use crate::remembered::RememberedSet;
use crate::workers::{TaskFn, WorkerContext, WorkerPool};
use crossbeam_deque::{Injector, Steal};
use gc_types::{Address, GenerationId, Region};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Marking as seen by the collector.
pub trait MarkEngine: Send + Sync {
    /// Prepares marking of `generation` over `regions`.
    fn mark_start(&self, generation: GenerationId, regions: &[Arc<Region>]);

    /// Pushes the roots of `generation`.
    fn mark_roots(&self, generation: GenerationId, workers: &WorkerPool);

    /// Traces from the pushed roots. Returns true once the work list is
    /// exhausted.
    fn mark_follow(&self, generation: GenerationId, workers: &WorkerPool) -> bool;

    /// Attempts to end marking. Returns false if more work turned up.
    fn try_end(&self, generation: GenerationId) -> bool;

    /// Processes weak and other non-strong references after old marking.
    fn process_non_strong_references(&self) {}

    /// Old-to-young remembered set, if the engine keeps one.
    fn remembered(&self) -> Option<&RememberedSet> {
        None
    }

    /// Records `obj`, a young object moving to old, if it references young
    /// objects. `obj` is the address the engine knows the object by until
    /// the next [`roots_remap`](Self::roots_remap).
    fn remember_promoted(&self, obj: Address) {
        let _ = obj;
    }

    /// Heals root and graph references after relocation.
    fn roots_remap(&self, remap: &dyn Fn(Address) -> Address) {
        let _ = remap;
    }
}

#[derive(Default)]
struct MarkState {
    stack: Injector<Address>,
    /// Pushed but not yet traced
    pending: AtomicUsize,
    /// Objects visited in the current cycle, any generation
    visited: Mutex<HashSet<Address>>,
    marked: AtomicUsize,
}

impl MarkState {
    fn push(&self, addr: Address) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.stack.push(addr);
    }
}

/// Traces an explicit object graph from a root set.
pub struct RootSetMarker {
    allocator: Arc<dyn RegionAllocator>,
    roots: RwLock<Vec<Address>>,
    edges: RwLock<HashMap<Address, Vec<Address>>>,
    remembered: RememberedSet,
    young: MarkState,
    old: MarkState,
}

impl RootSetMarker {
    /// Creates a marker resolving addresses through `allocator`.
    pub fn new(allocator: Arc<dyn RegionAllocator>) -> Self {
        RootSetMarker {
            allocator,
            roots: RwLock::new(Vec::new()),
            edges: RwLock::new(HashMap::new()),
            remembered: RememberedSet::new(),
            young: MarkState::default(),
            old: MarkState::default(),
        }
    }

    fn state(&self, generation: GenerationId) -> &MarkState {
        match generation {
            GenerationId::Young => &self.young,
            GenerationId::Old => &self.old,
        }
    }

    /// Adds a root.
    pub fn add_root(&self, addr: Address) {
        self.roots.write().push(addr);
    }

    /// Removes a root. Returns false if it was not a root.
    pub fn remove_root(&self, addr: Address) -> bool {
        let mut roots = self.roots.write();
        match roots.iter().position(|&root| root == addr) {
            Some(index) => {
                roots.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Current roots.
    pub fn roots(&self) -> Vec<Address> {
        self.roots.read().clone()
    }

    fn generation_of(&self, addr: Address) -> Option<GenerationId> {
        self.allocator.region_for(addr).map(|region| region.generation())
    }

    /// Records a reference from `from` to `to`.
    ///
    /// This is the store barrier: an old object storing a young reference
    /// joins the remembered set.
    pub fn add_edge(&self, from: Address, to: Address) {
        self.edges.write().entry(from).or_default().push(to);
        if self.generation_of(from) == Some(GenerationId::Old)
            && self.generation_of(to) == Some(GenerationId::Young)
        {
            self.remembered.remember(from);
        }
    }

    /// References held by `from`.
    pub fn edges_of(&self, from: Address) -> Vec<Address> {
        self.edges.read().get(&from).cloned().unwrap_or_default()
    }

    /// Objects marked live in the last cycle of `generation`.
    pub fn marked(&self, generation: GenerationId) -> usize {
        self.state(generation).marked.load(Ordering::Relaxed)
    }

    fn trace(&self, generation: GenerationId, state: &MarkState, addr: Address) {
        if !state.visited.lock().insert(addr) {
            return;
        }

        match self.allocator.region_for(addr) {
            Some(region) if region.generation() == generation => {
                if let Some(size) = region.object_size(addr) {
                    if region.mark_live(addr, size) {
                        state.marked.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            // Young references held by old objects come from the remembered set
            Some(_) if generation == GenerationId::Young => return,
            _ => {}
        }

        if let Some(children) = self.edges.read().get(&addr) {
            for &child in children {
                state.push(child);
            }
        }
    }

    /// Drops the references held by objects of `generation` that the last
    /// mark found dead, and by objects whose region is gone.
    fn prune_dead(&self, generation: GenerationId) {
        let mut edges = self.edges.write();
        let before = edges.len();
        edges.retain(|&from, _| match self.allocator.region_for(from) {
            Some(region) if region.generation() == generation => region.is_live(from),
            Some(_) => true,
            None => false,
        });
        let forgotten = self.remembered.retain(|addr| edges.contains_key(&addr));
        debug!(
            "{} mark end: pruned {} dead objects, {} remembered",
            generation,
            before - edges.len(),
            forgotten
        );
    }

    /// Pushes the young references of the old objects remembered before
    /// this young mark started.
    ///
    /// Objects that still hold a young reference are remembered again for
    /// the next young cycle.
    fn mark_remembered(&self, state: &MarkState) {
        let entries = self.remembered.take_previous();
        let mut pushed = 0;
        for &obj in &entries {
            if self.generation_of(obj) != Some(GenerationId::Old) {
                continue;
            }
            let mut holds_young = false;
            for child in self.edges_of(obj) {
                if self.generation_of(child) == Some(GenerationId::Young) {
                    state.push(child);
                    holds_young = true;
                    pushed += 1;
                }
            }
            if holds_young {
                self.remembered.remember(obj);
            }
        }
        debug!(
            "Young mark roots: {} remembered objects, {} young references",
            entries.len(),
            pushed
        );
    }
}

impl MarkEngine for RootSetMarker {
    fn mark_start(&self, generation: GenerationId, regions: &[Arc<Region>]) {
        let state = self.state(generation);
        for region in regions {
            region.clear_live();
        }
        state.visited.lock().clear();
        state.marked.store(0, Ordering::Relaxed);
        debug!("{} mark start over {} regions", generation, regions.len());
    }

    fn mark_roots(&self, generation: GenerationId, _workers: &WorkerPool) {
        let state = self.state(generation);
        {
            let roots = self.roots.read();
            for &root in roots.iter().filter(|root| !root.is_null()) {
                state.push(root);
            }
            debug!("{} mark roots: {} roots", generation, roots.len());
        }
        if generation == GenerationId::Young {
            self.mark_remembered(state);
        }
    }

    fn mark_follow(&self, generation: GenerationId, workers: &WorkerPool) -> bool {
        let state = self.state(generation);
        workers.run(&TaskFn::new("mark-follow", |_: &WorkerContext<'_>| loop {
            match state.stack.steal() {
                Steal::Success(addr) => {
                    self.trace(generation, state, addr);
                    state.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Steal::Retry => continue,
                Steal::Empty => {
                    if state.pending.load(Ordering::Acquire) == 0 {
                        return;
                    }
                    std::thread::yield_now();
                }
            }
        }));
        state.stack.is_empty()
    }

    fn try_end(&self, generation: GenerationId) -> bool {
        let state = self.state(generation);
        if !state.stack.is_empty() || state.pending.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.prune_dead(generation);
        true
    }

    fn remembered(&self) -> Option<&RememberedSet> {
        Some(&self.remembered)
    }

    fn remember_promoted(&self, obj: Address) {
        let holds_young = self
            .edges_of(obj)
            .into_iter()
            .any(|child| self.generation_of(child) == Some(GenerationId::Young));
        if holds_young {
            self.remembered.remember(obj);
        }
    }

    fn roots_remap(&self, remap: &dyn Fn(Address) -> Address) {
        for root in self.roots.write().iter_mut() {
            *root = remap(*root);
        }
        let mut edges = self.edges.write();
        let healed: HashMap<Address, Vec<Address>> = edges
            .drain()
            .map(|(from, children)| (remap(from), children.into_iter().map(remap).collect()))
            .collect();
        *edges = healed;
        drop(edges);
        self.remembered.remap(remap);
    }
}
