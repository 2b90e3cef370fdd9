//! Load Barrier and Mutator Integration Tests
//!
//! Tests the interplay between mutator threads, their stack watermarks and
//! the collector's load barrier while objects move.

use gc_core::testing::small_heap_config;
use gc_core::{GcConfig, GcContext, MutatorThread, NoopTelemetry, RegionAllocator, RegionHeap, RootSetMarker, WatermarkKind};
use gc_types::{Address, GenerationId, RegionAge};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn setup(config: GcConfig) -> (Arc<RegionHeap>, Arc<RootSetMarker>, Arc<GcContext>) {
    let heap = Arc::new(RegionHeap::new(&config).expect("heap"));
    let marker = Arc::new(RootSetMarker::new(heap.clone()));
    let gc = GcContext::try_new(config, heap.clone(), marker.clone(), Arc::new(NoopTelemetry))
        .expect("context");
    (heap, marker, Arc::new(gc))
}

fn config() -> GcConfig {
    GcConfig {
        young_workers: 4,
        old_workers: 2,
        dynamic_workers: true,
        ..small_heap_config(64)
    }
}

/// Allocates `n` rooted objects separated by garbage.
fn rooted_objects(heap: &RegionHeap, marker: &RootSetMarker, n: usize) -> Vec<Address> {
    (0..n)
        .map(|_| {
            let obj = heap.alloc_object(RegionAge::Eden, 64).unwrap();
            heap.alloc_object(RegionAge::Eden, 256).unwrap();
            marker.add_root(obj);
            obj
        })
        .collect()
}

/// Test: Mutators racing relocation workers agree on every new address
#[test]
fn test_concurrent_load_barriers() {
    let (heap, marker, gc) = setup(config());
    let objects = rooted_objects(&heap, &marker, 2000);
    let stop = AtomicBool::new(false);

    let seen: Vec<Vec<HashSet<Address>>> = thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let gc = &gc;
                let objects = &objects;
                let stop = &stop;
                s.spawn(move || {
                    let mut seen = vec![HashSet::new(); objects.len()];
                    while !stop.load(Ordering::Acquire) {
                        for (i, &obj) in objects.iter().enumerate() {
                            seen[i].insert(gc.load_barrier(obj));
                        }
                    }
                    seen
                })
            })
            .collect();

        gc.collect_minor().unwrap();
        stop.store(true, Ordering::Release);
        readers.into_iter().map(|r| r.join().unwrap()).collect()
    });

    for (i, &obj) in objects.iter().enumerate() {
        let current = gc.load_barrier(obj);
        assert_ne!(current, obj);
        for reader in &seen {
            for &addr in &reader[i] {
                assert!(
                    addr == obj || addr == current,
                    "object {} seen at {} but lives at {}",
                    obj,
                    addr,
                    current
                );
            }
        }
    }

    let roots: HashSet<Address> = marker.roots().into_iter().collect();
    let healed: HashSet<Address> = objects.iter().map(|&obj| gc.load_barrier(obj)).collect();
    assert_eq!(roots, healed);
}

/// Test: Frames are healed lazily as the mutator returns into them
#[test]
fn test_frames_healed_on_return() {
    let (heap, marker, gc) = setup(config());
    let objects = rooted_objects(&heap, &marker, 3);
    let mut mutator = MutatorThread::new(1);
    gc.attach(&mut mutator);
    for &obj in &objects {
        mutator.push_frame(vec![obj]);
    }

    gc.collect_minor().unwrap();
    let moved: Vec<Address> = objects.iter().map(|&obj| gc.remap(obj)).collect();

    mutator.start_processing(WatermarkKind::Gc);
    assert!(mutator.is_poll_armed());
    assert_eq!(mutator.frames()[2].slots(), &[moved[2]]);
    assert_eq!(mutator.frames()[1].slots(), &[objects[1]]);
    assert_eq!(mutator.frames()[0].slots(), &[objects[0]]);

    mutator.return_from_frame();
    assert_eq!(mutator.frames()[1].slots(), &[moved[1]]);
    assert_eq!(mutator.frames()[0].slots(), &[objects[0]]);

    mutator.finish_processing(WatermarkKind::Gc);
    assert!(!mutator.is_poll_armed());
    assert_eq!(mutator.frames()[0].slots(), &[moved[0]]);
}

/// Test: Walking the stack processes frames before they are visited
#[test]
fn test_stack_walk_sees_healed_frames() {
    let (heap, marker, gc) = setup(config());
    let objects = rooted_objects(&heap, &marker, 5);
    let mut mutator = MutatorThread::new(2);
    gc.attach(&mut mutator);
    for &obj in &objects {
        mutator.push_frame(vec![obj, Address::NULL]);
    }

    gc.collect_minor().unwrap();
    mutator.start_processing(WatermarkKind::Gc);

    let mut visited = Vec::new();
    mutator.walk(|frame| visited.push(frame.slots().to_vec()));
    mutator.finish_processing(WatermarkKind::Gc);

    let roots: HashSet<Address> = marker.roots().into_iter().collect();
    assert_eq!(visited.len(), 5);
    for slots in visited {
        assert!(roots.contains(&slots[0]));
        assert!(slots[1].is_null());
    }
}

/// Test: A stack processed after a major collection follows both moves
#[test]
fn test_frames_follow_promotion() {
    let (heap, marker, gc) = setup(config());
    let objects = rooted_objects(&heap, &marker, 8);
    let mut mutator = MutatorThread::new(3);
    gc.attach(&mut mutator);
    mutator.push_frame(objects.clone());

    gc.collect_major().unwrap();
    mutator.start_processing(WatermarkKind::Gc);
    mutator.finish_processing(WatermarkKind::Gc);

    let mut slots = mutator.frames()[0].slots().to_vec();
    let mut roots = marker.roots();
    slots.sort();
    roots.sort();
    assert_eq!(slots, roots);
    for slot in slots {
        let region = gc.allocator().region_for(slot).unwrap();
        assert_eq!(region.generation(), GenerationId::Old);
    }
}

/// Test: Frames pushed after processing started need no healing
#[test]
fn test_new_frames_are_processed() {
    let (heap, marker, gc) = setup(config());
    let objects = rooted_objects(&heap, &marker, 2);
    let mut mutator = MutatorThread::new(4);
    gc.attach(&mut mutator);
    mutator.push_frame(vec![objects[0]]);

    gc.collect_minor().unwrap();
    mutator.start_processing(WatermarkKind::Gc);
    let healed = gc.remap(objects[1]);
    mutator.push_frame(vec![healed]);
    mutator.finish_processing(WatermarkKind::Gc);

    assert_eq!(mutator.frames()[1].slots(), &[healed]);
    assert_eq!(mutator.frames()[0].slots(), &[gc.remap(objects[0])]);
}

/// Test: A mutator heals its stack while relocation workers are running
#[test]
fn test_stack_healed_while_workers_relocate() {
    let (heap, marker, gc) = setup(config());
    let objects = rooted_objects(&heap, &marker, 32);
    let mut thread = MutatorThread::new(5);
    gc.attach(&mut thread);
    for pair in objects.chunks(2) {
        thread.push_frame(pair.to_vec());
    }

    let young = gc.collector(GenerationId::Young);
    young.mark_start().unwrap();
    young.mark_roots().unwrap();
    while !young.mark_follow().unwrap() {}
    while !young.mark_end().unwrap() {
        young.mark_follow().unwrap();
    }
    young.relocate_start(false).unwrap();
    assert_eq!(young.relocation_set().nforwardings(), 1);

    // Workers join and stop at their first poll
    young.synchronize_relocation();
    thread::scope(|s| {
        let relocation = s.spawn(|| young.relocate().unwrap());
        while young.relocate_driver().queue().nworkers() == 0 {
            thread::yield_now();
        }

        gc.process_stack(&mut thread);
        let healed: Vec<Address> = thread
            .frames()
            .iter()
            .flat_map(|frame| frame.slots().iter().copied())
            .collect();
        for (&from, &to) in objects.iter().zip(&healed) {
            assert_ne!(from, to);
            assert_eq!(heap.region_for(to).unwrap().age(), RegionAge::Survivor(1));
        }
        // The mutator relocated everything itself
        let forwarding = young.relocation_set().forwardings()[0].clone();
        assert!(!forwarding.is_claimed());
        assert!(young.relocate_driver().queue().is_synchronized());

        young.desynchronize_relocation();
        let stats = relocation.join().unwrap();
        assert_eq!(stats.relocated, 32 * 64);
        assert!(forwarding.is_done());
    });

    assert!(!young.relocate_driver().queue().is_synchronized());
    let healed: Vec<Address> = thread
        .frames()
        .iter()
        .flat_map(|frame| frame.slots().iter().copied())
        .collect();
    for (&from, &to) in objects.iter().zip(&healed) {
        assert_eq!(gc.remap(from), to);
    }
}
