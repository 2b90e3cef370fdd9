//! Contract tests verifying the gc_core public API.
//! These tests exercise the exported types from outside the crate.

use gc_core::testing::{self, RecordingTelemetry, ScriptedMarkEngine};
use gc_core::{
    Collector, Frame, GcConfig, MarkEngine, Phase, Polled, RegionAllocator, RegionHeap,
    RelocateQueue, RelocationSet, Selection, StackWatermark, StackWatermarkSet, TaskFn, Telemetry,
    WatermarkKind, WorkerContext, WorkerPool,
};
use gc_types::{Address, GcError, GenerationId, Region, RegionAge, SizeClass, GRANULE_SIZE};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn worker_ids(pool: &WorkerPool) -> BTreeSet<usize> {
    let ids = Mutex::new(BTreeSet::new());
    pool.run(&TaskFn::new("ids", |ctx: &WorkerContext<'_>| {
        ids.lock().insert(ctx.worker_id());
    }));
    ids.into_inner()
}

fn live_region(heap: &RegionHeap, size_class: SizeClass) -> Arc<Region> {
    let region = heap.alloc_region(size_class, RegionAge::Eden).unwrap();
    for _ in 0..4 {
        let addr = region.alloc_object(128).unwrap();
        region.mark_live(addr, 128);
    }
    region
}

/// Test WorkerPool contract: set_active_workers(n) -> run sees ids [0, n)
#[test]
fn contract_worker_pool_active_ids() {
    let pool = WorkerPool::try_new(GenerationId::Young, 4, true).unwrap();
    pool.set_active_workers(2);
    assert_eq!(pool.active_workers(), 2);
    assert_eq!(worker_ids(&pool), (0..2).collect());

    pool.set_active_workers(4);
    assert_eq!(worker_ids(&pool), (0..4).collect());
}

/// Test WorkerPool contract: run_all(task) uses every thread, then restores
#[test]
fn contract_worker_pool_run_all() {
    let pool = WorkerPool::try_new(GenerationId::Old, 3, true).unwrap();
    pool.set_active_workers(1);
    let count = AtomicUsize::new(0);
    pool.run_all(&TaskFn::new("all", |_: &WorkerContext<'_>| {
        count.fetch_add(1, Ordering::Relaxed);
    }));
    assert_eq!(count.load(Ordering::Relaxed), 3);
    assert_eq!(pool.active_workers(), 1);
}

/// Test WorkerPool contract: every thread registered before construction returned
#[test]
fn contract_worker_pool_registration() {
    let pool = WorkerPool::try_new(GenerationId::Young, 3, false).unwrap();
    assert_eq!(pool.registered_workers(), 3);
    assert!(!gc_core::is_gc_worker());
}

/// Test WorkerPool contract: a start shortfall is reported by try_new
#[test]
fn contract_worker_pool_shortfall() {
    let result = testing::spawn_limited_pool(GenerationId::Old, 4, 2);
    assert!(matches!(
        result,
        Err(GcError::WorkerStartup { requested: 4, started: 2, .. })
    ));
}

/// Test RelocationSet contract: install(pool, selection) partitions slots
#[test]
fn contract_relocation_set_install() {
    let heap = RegionHeap::new(&testing::small_heap_config(16)).unwrap();
    let pool = WorkerPool::try_new(GenerationId::Young, 2, false).unwrap();
    let small: Vec<_> = (0..3).map(|_| live_region(&heap, SizeClass::Small)).collect();
    let medium: Vec<_> = (0..2).map(|_| live_region(&heap, SizeClass::Medium)).collect();

    let set = RelocationSet::new(GenerationId::Young);
    set.install(&pool, &Selection::new(small.clone(), medium.clone(), 500));

    assert_eq!(set.nforwardings(), 5);
    let forwardings = set.forwardings();
    for (slot, forwarding) in forwardings.iter().enumerate() {
        let expected = if slot < 2 { SizeClass::Medium } else { SizeClass::Small };
        assert_eq!(forwarding.region().size_class(), expected);
        assert_eq!(forwarding.slot(), slot);
    }
}

/// Test RelocationSet contract: register_promote_flipped rejects duplicates
#[test]
#[should_panic(expected = "no duplicates allowed")]
fn contract_relocation_set_duplicate_promotion() {
    let heap = RegionHeap::new(&testing::small_heap_config(16)).unwrap();
    let region = live_region(&heap, SizeClass::Small);
    let set = RelocationSet::new(GenerationId::Young);
    set.register_promote_flipped(&[Arc::clone(&region)]);
    set.register_promote_flipped(&[region]);
}

/// Test RelocateQueue contract: synchronize() -> polls report Synchronized
#[test]
fn contract_relocate_queue_synchronize() {
    let queue = RelocateQueue::new();
    queue.join(1);
    let participant = queue.participant();
    assert!(matches!(participant.poll(), Polled::Empty));

    std::thread::scope(|s| {
        s.spawn(|| queue.synchronize());
        while !queue.is_synchronized() {
            std::thread::yield_now();
        }
        assert!(matches!(participant.poll(), Polled::Synchronized));
    });
    assert!(matches!(participant.poll(), Polled::Synchronized));
    queue.desynchronize();
    assert!(matches!(participant.poll(), Polled::Empty));
    assert_eq!(queue.needs_attention(), 0);
}

/// Test StackWatermarkSet contract: only started kinds process frames
#[test]
fn contract_stack_watermark_kinds() {
    let gc_hits = Arc::new(AtomicUsize::new(0));
    let sampler_hits = Arc::new(AtomicUsize::new(0));
    let mut set = StackWatermarkSet::new();
    let hits = Arc::clone(&gc_hits);
    set.add_watermark(StackWatermark::new(WatermarkKind::Gc, move |_: &mut Frame| {
        hits.fetch_add(1, Ordering::Relaxed);
    }));
    let hits = Arc::clone(&sampler_hits);
    set.add_watermark(StackWatermark::new(WatermarkKind::Sampler, move |_: &mut Frame| {
        hits.fetch_add(1, Ordering::Relaxed);
    }));

    let mut frames: Vec<Frame> = (0..3).map(|i| Frame::new(0x1000 - i * 0x100, Vec::new())).collect();
    set.start_iteration(WatermarkKind::Gc);
    for _ in 0..2 {
        for index in 0..frames.len() {
            set.on_iteration(&mut frames, index);
        }
    }

    assert_eq!(gc_hits.load(Ordering::Relaxed), 3);
    assert_eq!(sampler_hits.load(Ordering::Relaxed), 0);
    assert_eq!(set.lowest_watermark(), 0x1001);
}

/// Test Collector contract: mark_start -> mark_end -> relocate_start -> relocate
#[test]
fn contract_collector_cycle() {
    let config = testing::small_heap_config(32);
    let heap = Arc::new(RegionHeap::new(&config).unwrap());
    testing::populate(&heap, SizeClass::Small, RegionAge::Eden, 2, 8, 1024);
    let telemetry = Arc::new(RecordingTelemetry::new());
    let collector = Collector::new(
        &config,
        Arc::clone(&heap) as Arc<dyn RegionAllocator>,
        Arc::new(ScriptedMarkEngine::new(0.5)) as Arc<dyn MarkEngine>,
        Arc::clone(&telemetry) as Arc<dyn Telemetry>,
        WorkerPool::try_new(GenerationId::Young, 2, false).unwrap(),
    );

    collector.mark_start().unwrap();
    collector.mark_roots().unwrap();
    assert!(collector.mark_follow().unwrap());
    assert!(collector.mark_end().unwrap());
    collector.relocate_start(false).unwrap();
    let stats = collector.relocate().unwrap();

    assert_eq!(collector.phase(), Phase::Relocate);
    assert_eq!(stats.nforwardings, 2);
    assert_eq!(stats.relocated, 2 * 4 * 1024);
    assert_eq!(telemetry.cycle_ends(), vec![stats]);
}

/// Test GcConfig contract: from_json_str validates values
#[test]
fn contract_config_validation() {
    let config = GcConfig::from_json_str(r#"{ "young_workers": 3 }"#).unwrap();
    assert_eq!(config.young_workers, 3);
    assert!(matches!(
        GcConfig::from_json_str(r#"{ "fragmentation_limit": 120.0 }"#),
        Err(GcError::InvalidConfig(_))
    ));
    assert!(GcConfig::from_json_str(&config.to_json_string().unwrap()).is_ok());
    assert_eq!(config.heap_capacity % GRANULE_SIZE, 0);
}

/// Test Address contract: NULL is never forwarded by the context
#[test]
fn contract_context_null_address() {
    let config = testing::small_heap_config(16);
    let heap = Arc::new(RegionHeap::new(&config).unwrap());
    let gc = gc_core::GcContext::try_new(
        config,
        Arc::clone(&heap) as Arc<dyn RegionAllocator>,
        Arc::new(ScriptedMarkEngine::new(1.0)),
        Arc::new(gc_core::NoopTelemetry),
    )
    .unwrap();
    assert_eq!(gc.load_barrier(Address::NULL), Address::NULL);
}
