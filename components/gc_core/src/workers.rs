//! Per-generation GC worker pools.
//!
//! A [`WorkerPool`] owns a fixed number of named threads and dispatches
//! [`WorkerTask`]s to the first `active_workers()` of them:
//!
//! - [`WorkerPool::run`] blocks until every active worker executed the task
//!   body exactly once, with worker ids `0..active`.
//! - [`WorkerPool::run_all`] uses every thread for one task and then restores
//!   the previous active count.
//! - [`WorkerPool::run_restartable`] re-enters a [`RestartableTask`] with a new
//!   worker count after [`WorkerPool::request_resize`]. Workers observe the
//!   request through [`WorkerContext::should_resize`] at the top of their next
//!   work iteration.
//!
//! Every pooled thread registers its worker identity from its own startup
//! routine and then waits on a [`GatherBarrier`] until all its peers did the
//! same. The pool constructor returns only after the barrier completed.

use gc_types::{GcError, GcResult, GenerationId};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of parallel work.
pub trait WorkerTask: Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Body executed once by each active worker.
    fn work(&self, ctx: &WorkerContext<'_>);
}

/// A task that can be restarted with a different number of workers.
pub trait RestartableTask: WorkerTask {
    /// Called between runs when the pool was resized.
    fn resize_workers(&self, nworkers: usize);
}

/// Adapter turning a closure into a [`WorkerTask`].
pub struct TaskFn<F> {
    name: &'static str,
    f: F,
}

impl<F> TaskFn<F>
where
    F: Fn(&WorkerContext<'_>) + Sync,
{
    /// Wraps `f` as a task called `name`.
    pub fn new(name: &'static str, f: F) -> Self {
        TaskFn { name, f }
    }
}

impl<F> WorkerTask for TaskFn<F>
where
    F: Fn(&WorkerContext<'_>) + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn work(&self, ctx: &WorkerContext<'_>) {
        (self.f)(ctx)
    }
}

/// Per-invocation view a worker gets of the pool.
pub struct WorkerContext<'a> {
    worker_id: usize,
    nworkers: usize,
    requested: &'a AtomicUsize,
}

impl WorkerContext<'_> {
    /// Id of this worker within the current task, in `0..active_workers()`.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Number of workers executing the current task.
    pub fn active_workers(&self) -> usize {
        self.nworkers
    }

    /// True when a resize was requested and the worker should return so the
    /// task can be restarted.
    pub fn should_resize(&self) -> bool {
        self.requested.load(Ordering::Acquire) != 0
    }
}

/// Identity a pooled thread registers at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Generation the pool belongs to
    pub generation: GenerationId,
    /// Index of the thread within its pool
    pub index: usize,
}

thread_local! {
    static WORKER_IDENTITY: Cell<Option<WorkerIdentity>> = const { Cell::new(None) };
}

fn register_worker(identity: WorkerIdentity) {
    WORKER_IDENTITY.with(|id| id.set(Some(identity)));
}

/// Returns the identity of the current thread if it is a GC worker.
pub fn current_worker() -> Option<WorkerIdentity> {
    WORKER_IDENTITY.with(|id| id.get())
}

/// Returns true on threads owned by a [`WorkerPool`].
pub fn is_gc_worker() -> bool {
    current_worker().is_some()
}

/// One-shot barrier gathering a fixed number of arrivals.
///
/// Each arrival counts itself under the lock. The arrival that completes the
/// count wakes everybody; no arrival returns before the count is complete.
pub struct GatherBarrier {
    expected: usize,
    state: Mutex<GatherState>,
    cond: Condvar,
}

struct GatherState {
    arrived: usize,
    released: bool,
}

impl GatherBarrier {
    /// Creates a barrier waiting for `expected` arrivals.
    pub fn new(expected: usize) -> Self {
        GatherBarrier {
            expected,
            state: Mutex::new(GatherState {
                arrived: 0,
                released: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Registers one arrival and waits for the rest.
    ///
    /// Returns true for the arrival that completed the count.
    pub fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        assert!(state.arrived <= self.expected, "too many arrivals at gather barrier");
        if state.arrived == self.expected {
            self.cond.notify_all();
            return true;
        }
        while state.arrived < self.expected && !state.released {
            self.cond.wait(&mut state);
        }
        false
    }

    /// Waits for the count to complete without arriving.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.arrived < self.expected && !state.released {
            self.cond.wait(&mut state);
        }
    }

    /// Wakes every waiter without completing the count.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.cond.notify_all();
    }

    /// Number of arrivals so far.
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    /// True once every expected arrival happened.
    pub fn is_complete(&self) -> bool {
        self.arrived() == self.expected
    }
}

/// Lifetime-erased pointer to the task being dispatched.
#[derive(Clone, Copy)]
struct TaskPtr(*const (dyn WorkerTask + 'static));

// SAFETY: The pointee is `Sync` (required by `WorkerTask`) and `dispatch`
// keeps it borrowed until every worker is done with it.
unsafe impl Send for TaskPtr {}

struct Dispatch {
    task: Option<TaskPtr>,
    /// Bumped for every dispatched task
    generation: u64,
    nworkers: usize,
    remaining: usize,
    panic: Option<Box<dyn Any + Send>>,
    shutdown: bool,
}

struct PoolShared {
    dispatch: Mutex<Dispatch>,
    work_available: Condvar,
    work_done: Condvar,
    /// Pending resize request, 0 when none
    requested: AtomicUsize,
}

/// Accumulated parallel time of a pool.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    /// Wall-clock time spent inside tasks
    pub accumulated_duration: Duration,
    /// Wall-clock time multiplied by the number of workers
    pub accumulated_time: Duration,
    /// Tasks executed
    pub tasks: usize,
    start: Option<(Instant, usize)>,
}

impl WorkerStats {
    fn at_start(&mut self, nworkers: usize) {
        self.start = Some((Instant::now(), nworkers));
    }

    fn at_end(&mut self) {
        if let Some((start, nworkers)) = self.start.take() {
            let elapsed = start.elapsed();
            self.accumulated_duration += elapsed;
            self.accumulated_time += elapsed * nworkers as u32;
            self.tasks += 1;
        }
    }
}

/// Snapshot used to decide whether to resize a running pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerResizeStats {
    /// False outside a cycle, in which case the other fields are zero
    pub is_active: bool,
    /// Cycle time not spent in parallel tasks
    pub serial_gc_time_passed: Duration,
    /// Summed per-worker time spent in parallel tasks
    pub parallel_gc_time_passed: Duration,
    /// Active workers right now
    pub nworkers_current: usize,
}

struct ResizeState {
    requested: usize,
    is_active: bool,
    stats: WorkerStats,
}

/// A pool of GC worker threads for one generation.
pub struct WorkerPool {
    generation: GenerationId,
    name: String,
    max_workers: usize,
    dynamic: bool,
    active: AtomicUsize,
    shared: Arc<PoolShared>,
    run_lock: Mutex<()>,
    resize: Mutex<ResizeState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    registered: usize,
}

impl WorkerPool {
    /// Creates a pool, terminating the process if any thread fails to start.
    pub fn new(generation: GenerationId, nworkers: usize, dynamic: bool) -> Self {
        match Self::try_new(generation, nworkers, dynamic) {
            Ok(pool) => pool,
            Err(err) => {
                error!("{}", err);
                std::process::exit(1);
            }
        }
    }

    /// Creates a pool, reporting a start shortfall as an error.
    pub fn try_new(generation: GenerationId, nworkers: usize, dynamic: bool) -> GcResult<Self> {
        Self::spawn(generation, nworkers, dynamic, nworkers)
    }

    /// Spawns at most `spawn_limit` of the `nworkers` threads.
    pub(crate) fn spawn(
        generation: GenerationId,
        nworkers: usize,
        dynamic: bool,
        spawn_limit: usize,
    ) -> GcResult<Self> {
        if nworkers == 0 {
            return Err(GcError::InvalidConfig(format!(
                "{} pool needs at least one worker",
                generation
            )));
        }

        info!(
            "GC workers for {} generation: {} ({})",
            generation,
            nworkers,
            if dynamic { "dynamic" } else { "static" }
        );

        let name = generation.worker_prefix().to_string();
        let shared = Arc::new(PoolShared {
            dispatch: Mutex::new(Dispatch {
                task: None,
                generation: 0,
                nworkers: 0,
                remaining: 0,
                panic: None,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
            requested: AtomicUsize::new(0),
        });
        let barrier = Arc::new(GatherBarrier::new(nworkers));

        let mut handles = Vec::with_capacity(nworkers);
        for index in 0..nworkers.min(spawn_limit) {
            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_main(shared, barrier, generation, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    error!("failed to spawn {}-{}: {}", name, index, err);
                    break;
                }
            }
        }

        if handles.len() != nworkers {
            let started = handles.len();
            barrier.release();
            shutdown(&shared, handles);
            return Err(GcError::WorkerStartup {
                pool: name,
                requested: nworkers,
                started,
            });
        }

        barrier.wait();

        Ok(WorkerPool {
            generation,
            name,
            max_workers: nworkers,
            dynamic,
            active: AtomicUsize::new(nworkers),
            shared,
            run_lock: Mutex::new(()),
            resize: Mutex::new(ResizeState {
                requested: 0,
                is_active: false,
                stats: WorkerStats::default(),
            }),
            handles: Mutex::new(handles),
            registered: barrier.arrived(),
        })
    }

    /// Generation this pool serves.
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Thread name prefix of this pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of threads owned by the pool.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of threads that registered as GC workers at startup.
    pub fn registered_workers(&self) -> usize {
        self.registered
    }

    /// Whether the active count may be adjusted dynamically.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Number of threads the next task is dispatched to.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Sets the number of threads used by the next dispatch.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= nworkers <= max_workers()`.
    pub fn set_active_workers(&self, nworkers: usize) {
        assert!(
            (1..=self.max_workers).contains(&nworkers),
            "invalid number of active workers {} (max {})",
            nworkers,
            self.max_workers
        );
        info!("Using {} workers for {} generation", nworkers, self.generation);
        let _resize = self.resize.lock();
        self.active.store(nworkers, Ordering::Release);
    }

    /// Marks the start of a cycle and resets the statistics.
    pub fn set_active(&self) {
        let mut resize = self.resize.lock();
        resize.is_active = true;
        resize.requested = 0;
        resize.stats = WorkerStats::default();
        self.shared.requested.store(0, Ordering::Release);
    }

    /// Marks the end of a cycle.
    pub fn set_inactive(&self) {
        self.resize.lock().is_active = false;
    }

    /// Copy of the accumulated statistics.
    pub fn stats(&self) -> WorkerStats {
        self.resize.lock().stats.clone()
    }

    /// Statistics for resize decisions, relative to `cycle_start`.
    pub fn resize_stats(&self, cycle_start: Instant) -> WorkerResizeStats {
        let resize = self.resize.lock();
        if !resize.is_active {
            return WorkerResizeStats {
                is_active: false,
                serial_gc_time_passed: Duration::ZERO,
                parallel_gc_time_passed: Duration::ZERO,
                nworkers_current: 0,
            };
        }

        let parallel_duration = resize.stats.accumulated_duration;
        WorkerResizeStats {
            is_active: true,
            serial_gc_time_passed: cycle_start.elapsed().saturating_sub(parallel_duration),
            parallel_gc_time_passed: resize.stats.accumulated_time,
            nworkers_current: self.active_workers(),
        }
    }

    /// Asks a running restartable task to continue with `nworkers` threads.
    pub fn request_resize(&self, nworkers: usize) {
        assert!(
            (1..=self.max_workers).contains(&nworkers),
            "invalid resize request {} (max {})",
            nworkers,
            self.max_workers
        );
        let mut resize = self.resize.lock();
        if resize.requested == nworkers {
            return;
        }
        info!(
            "Adjusting workers for {} generation: {} -> {}",
            self.generation,
            self.active_workers(),
            nworkers
        );
        resize.requested = nworkers;
        self.shared.requested.store(nworkers, Ordering::Release);
    }

    /// Runs `task` on the active workers and waits for it.
    pub fn run<T: WorkerTask>(&self, task: &T) {
        let _run = self.run_lock.lock();
        let nworkers = self.active_workers();
        self.run_locked(task, nworkers);
    }

    /// Runs `task` on every thread, restoring the active count afterwards.
    pub fn run_all<T: WorkerTask>(&self, task: &T) {
        let _run = self.run_lock.lock();
        self.run_locked(task, self.max_workers);
    }

    /// Runs `task`, restarting it for every resize requested while it ran.
    pub fn run_restartable<T: RestartableTask>(&self, task: &T) {
        let _run = self.run_lock.lock();
        loop {
            self.run_locked(task, self.active_workers());

            let mut resize = self.resize.lock();
            if resize.requested == 0 {
                return;
            }

            let nworkers = resize.requested;
            self.active.store(nworkers, Ordering::Release);
            resize.requested = 0;
            self.shared.requested.store(0, Ordering::Release);
            drop(resize);

            task.resize_workers(nworkers);
        }
    }

    fn run_locked<T: WorkerTask>(&self, task: &T, nworkers: usize) {
        assert!(!is_gc_worker(), "{} dispatched from a GC worker", task.name());
        debug!(
            "Executing {} using {} with {} workers",
            task.name(),
            self.name,
            nworkers
        );

        self.resize.lock().stats.at_start(nworkers);
        self.dispatch(task, nworkers);
        self.resize.lock().stats.at_end();
    }

    fn dispatch(&self, task: &dyn WorkerTask, nworkers: usize) {
        let ptr: *const (dyn WorkerTask + '_) = task;
        // SAFETY: Only the lifetime is erased. This function does not return
        // before `remaining` drops to zero, and workers stop touching the task
        // before they decrement it.
        let ptr: *const (dyn WorkerTask + 'static) = unsafe { std::mem::transmute(ptr) };

        let panic = {
            let mut dispatch = self.shared.dispatch.lock();
            dispatch.task = Some(TaskPtr(ptr));
            dispatch.generation += 1;
            dispatch.nworkers = nworkers;
            dispatch.remaining = nworkers;
            self.shared.work_available.notify_all();

            while dispatch.remaining > 0 {
                self.shared.work_done.wait(&mut dispatch);
            }
            dispatch.task = None;
            dispatch.panic.take()
        };

        if let Some(payload) = panic {
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        shutdown(&self.shared, handles);
    }
}

fn shutdown(shared: &PoolShared, handles: Vec<JoinHandle<()>>) {
    {
        let mut dispatch = shared.dispatch.lock();
        dispatch.shutdown = true;
        shared.work_available.notify_all();
    }
    for handle in handles {
        let _ = handle.join();
    }
}

fn worker_main(shared: Arc<PoolShared>, barrier: Arc<GatherBarrier>, generation: GenerationId, index: usize) {
    register_worker(WorkerIdentity { generation, index });
    barrier.arrive();

    let mut seen = 0;
    loop {
        let (task, nworkers) = {
            let mut dispatch = shared.dispatch.lock();
            while !dispatch.shutdown && dispatch.generation == seen {
                shared.work_available.wait(&mut dispatch);
            }
            if dispatch.shutdown {
                return;
            }
            seen = dispatch.generation;
            if index >= dispatch.nworkers {
                continue;
            }
            match dispatch.task {
                Some(task) => (task, dispatch.nworkers),
                None => continue,
            }
        };

        let ctx = WorkerContext {
            worker_id: index,
            nworkers,
            requested: &shared.requested,
        };
        // SAFETY: The dispatcher keeps the task alive until `remaining` is zero.
        let task = unsafe { &*task.0 };
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.work(&ctx)));

        let mut dispatch = shared.dispatch.lock();
        if let Err(payload) = result {
            if dispatch.panic.is_none() {
                dispatch.panic = Some(payload);
            }
        }
        dispatch.remaining -= 1;
        if dispatch.remaining == 0 {
            shared.work_done.notify_all();
        }
    }
}
