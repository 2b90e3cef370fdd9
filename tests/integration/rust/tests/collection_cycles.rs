//! Collection Cycle Integration Tests
//!
//! Runs minor and major collections through the collector context with the
//! root-set marker, the region heap and the telemetry sink working together.

use gc_core::testing::{small_heap_config, RecordingTelemetry};
use gc_core::{
    GcConfig, GcContext, MarkEngine, NoopTelemetry, Phase, RegionAllocator, RegionHeap,
    RootSetMarker, Telemetry,
};
use gc_types::{GenerationId, RegionAge};
use std::sync::Arc;

struct Harness {
    heap: Arc<RegionHeap>,
    marker: Arc<RootSetMarker>,
    gc: Arc<GcContext>,
}

fn harness(config: GcConfig, telemetry: Arc<dyn Telemetry>) -> Harness {
    let heap = Arc::new(RegionHeap::new(&config).expect("heap"));
    let marker = Arc::new(RootSetMarker::new(heap.clone()));
    let gc = Arc::new(
        GcContext::try_new(config, heap.clone(), marker.clone(), telemetry).expect("context"),
    );
    Harness { heap, marker, gc }
}

fn config() -> GcConfig {
    GcConfig {
        young_workers: 2,
        old_workers: 2,
        ..small_heap_config(64)
    }
}

/// Test: Reachable objects move, garbage regions are reclaimed
#[test]
fn test_minor_collection_moves_graph() {
    let h = harness(config(), Arc::new(NoopTelemetry));
    let root = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    let child = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    for _ in 0..500 {
        h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    }
    h.marker.add_root(root);
    h.marker.add_edge(root, child);

    let stats = h.gc.collect_minor().unwrap();
    assert_eq!(stats.generation, GenerationId::Young);
    assert_eq!(stats.relocated, 128);
    assert_eq!(stats.promoted, 0);
    assert!(stats.reclaimed > 0);

    let new_root = h.marker.roots()[0];
    assert_ne!(new_root, root);
    let new_child = h.marker.edges_of(new_root);
    assert_eq!(new_child.len(), 1);
    assert_eq!(h.gc.load_barrier(child), new_child[0]);

    let region = h.heap.region_for(new_root).unwrap();
    assert_eq!(region.age(), RegionAge::Survivor(1));

    assert!(h.heap.flush_deferred(1000));
    assert!(h.heap.freed_regions() >= 1);
}

/// Test: A major collection leaves every reachable object in old
#[test]
fn test_major_collection_tenures_everything() {
    let h = harness(config(), Arc::new(NoopTelemetry));
    let mut objects = Vec::new();
    for _ in 0..10 {
        let obj = h.heap.alloc_object(RegionAge::Eden, 128).unwrap();
        h.marker.add_root(obj);
        objects.push(obj);
    }
    h.gc.collect_minor().unwrap();
    let major = h.gc.collect_major().unwrap();

    assert_eq!(major.young.generation, GenerationId::Young);
    assert_eq!(major.old.generation, GenerationId::Old);
    assert_eq!(major.young.promoted, 10 * 128);

    for root in h.marker.roots() {
        let region = h.heap.region_for(root).unwrap();
        assert_eq!(region.generation(), GenerationId::Old);
    }
    for obj in objects {
        let current = h.gc.load_barrier(obj);
        assert!(h.marker.roots().contains(&current));
    }
}

/// Test: Survivors age each minor cycle and promote at the threshold
#[test]
fn test_tenuring_threshold() {
    let h = harness(
        GcConfig {
            tenuring_threshold: 2,
            ..config()
        },
        Arc::new(NoopTelemetry),
    );
    let obj = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    h.marker.add_root(obj);

    let mut ages = Vec::new();
    let mut promoted = Vec::new();
    for _ in 0..3 {
        // Garbage keeps the survivor region sparse enough to evacuate.
        for _ in 0..100 {
            h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
        }
        let stats = h.gc.collect_minor().unwrap();
        promoted.push(stats.promoted);
        let region = h.heap.region_for(h.marker.roots()[0]).unwrap();
        ages.push(region.age());
    }

    assert_eq!(
        ages,
        vec![RegionAge::Survivor(1), RegionAge::Survivor(2), RegionAge::Old]
    );
    assert_eq!(promoted, vec![0, 0, 64]);
}

/// Test: Phase switches and cycle summaries reach telemetry in order
#[test]
fn test_telemetry_sees_every_phase() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let h = harness(config(), telemetry.clone());
    let obj = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    h.marker.add_root(obj);

    h.gc.collect_minor().unwrap();
    h.gc.collect_major().unwrap();

    let cycle = [
        (Phase::Relocate, Phase::Mark),
        (Phase::Mark, Phase::MarkComplete),
        (Phase::MarkComplete, Phase::Relocate),
    ];
    let young = telemetry.phase_switches(GenerationId::Young);
    assert_eq!(young.len(), 6);
    assert_eq!(&young[..3], &cycle);
    assert_eq!(&young[3..], &cycle);
    assert_eq!(telemetry.phase_switches(GenerationId::Old), cycle.to_vec());

    let ends: Vec<_> = telemetry
        .cycle_ends()
        .iter()
        .map(|s| (s.generation, s.seqnum))
        .collect();
    assert_eq!(
        ends,
        vec![
            (GenerationId::Young, 1),
            (GenerationId::Young, 2),
            (GenerationId::Old, 1)
        ]
    );
    assert_eq!(h.gc.driver().minor_collections(), 1);
    assert_eq!(h.gc.driver().major_collections(), 1);
}

/// Test: Collections with nothing reachable free all young regions
#[test]
fn test_everything_dead() {
    let h = harness(config(), Arc::new(NoopTelemetry));
    for _ in 0..1000 {
        h.heap.alloc_object(RegionAge::Eden, 512).unwrap();
    }
    let used_before = h.heap.used();

    let stats = h.gc.collect_minor().unwrap();
    assert_eq!(stats.relocated, 0);
    assert_eq!(stats.nforwardings, 0);
    assert!(stats.reclaimed > 0);
    assert!(h.heap.flush_deferred(1000));
    assert!(h.heap.used() < used_before);
    assert!(h.heap.regions_of(GenerationId::Young).is_empty());
}

/// Test: Interleaved minor and major collections from driver threads
#[test]
fn test_background_drivers() {
    let h = harness(config(), Arc::new(NoopTelemetry));
    for _ in 0..4 {
        let obj = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
        h.marker.add_root(obj);
    }

    let minor = h.gc.request(gc_core::CollectionKind::Minor).unwrap();
    let major = h.gc.request(gc_core::CollectionKind::Major).unwrap();
    assert!(minor.recv().unwrap().is_ok());
    assert!(major.recv().unwrap().is_ok());
    h.gc.stop_background();

    assert_eq!(h.marker.roots().len(), 4);
    for root in h.marker.roots() {
        assert_eq!(
            h.heap.region_for(root).unwrap().generation(),
            GenerationId::Old
        );
    }
}

/// Test: A young object referenced only from a promoted object survives
#[test]
fn test_promoted_parent_keeps_young_child_alive() {
    let h = harness(
        GcConfig {
            tenuring_threshold: 2,
            ..config()
        },
        Arc::new(NoopTelemetry),
    );
    let parent = h.heap.alloc_object(RegionAge::Survivor(2), 64).unwrap();
    let child = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    h.marker.add_root(parent);
    h.marker.add_edge(parent, child);

    let first = h.gc.collect_minor().unwrap();
    assert_eq!(first.promoted, 64);
    let parent = h.marker.roots()[0];
    assert_eq!(h.heap.region_for(parent).unwrap().age(), RegionAge::Old);
    let remembered = h.marker.remembered().unwrap();
    assert!(remembered.contains(parent));

    let child = h.marker.edges_of(parent)[0];
    assert_eq!(h.heap.region_for(child).unwrap().age(), RegionAge::Survivor(1));

    // Young marking reaches the child only through the remembered parent
    let second = h.gc.collect_minor().unwrap();
    assert_eq!(second.relocated, 64);
    let moved = h.marker.edges_of(parent)[0];
    assert_ne!(moved, child);
    assert_eq!(h.heap.region_for(moved).unwrap().age(), RegionAge::Survivor(2));
    assert!(remembered.contains(parent));
}

/// Test: Storing a young reference into an old object remembers it
#[test]
fn test_old_store_keeps_young_object_alive() {
    let h = harness(config(), Arc::new(NoopTelemetry));
    let old = h.heap.alloc_object(RegionAge::Old, 64).unwrap();
    let young = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    let unreferenced = h.heap.alloc_object(RegionAge::Eden, 64).unwrap();
    h.marker.add_root(old);
    h.marker.add_edge(old, young);

    let stats = h.gc.collect_minor().unwrap();
    assert_eq!(stats.relocated, 64);
    let moved = h.marker.edges_of(old)[0];
    assert_eq!(h.gc.load_barrier(young), moved);
    assert_eq!(h.gc.remap(unreferenced), unreferenced);

    // Once the child is old, the next young mark forgets the parent
    h.gc.collect_major().unwrap();
    let remembered = h.marker.remembered().unwrap();
    assert!(remembered.contains(h.marker.roots()[0]));
    h.gc.collect_minor().unwrap();
    assert!(remembered.is_empty());
}
