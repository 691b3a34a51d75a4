use std::sync::atomic::Ordering;

use super::host::*;
use crate::allocator::{AllocError, AllocationSemantics, AllocatorSelector};
use crate::options::PlanSelector;
use crate::space::Space;
use crate::util::constants::{BYTES_IN_PAGE, MAX_NON_LOS_ALLOC_BYTES};
use crate::util::{Address, ObjectReference};

const THREADS: usize = 4;
const OBJECTS_PER_THREAD: usize = 2000;

#[test]
pub fn test_concurrent_allocations_never_overlap() {
    let (heap, _state) = engine_without_collection("");
    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let heap = heap.clone();
            std::thread::spawn(move || {
                let mut mutator = heap.bind_mutator(tls(id + 1));
                let pattern = id as u8 + 1;
                let mut seed = 0x9e37_79b9usize.wrapping_mul(id + 1);
                let mut allocations = Vec::with_capacity(OBJECTS_PER_THREAD);
                for i in 0..OBJECTS_PER_THREAD {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let (size, semantics) = match i % 100 {
                        0 => (20_000, AllocationSemantics::Default),
                        1 => (64, AllocationSemantics::Immortal),
                        2 => (48, AllocationSemantics::NonMoving),
                        _ => (8 + (seed >> 33) % 1024, AllocationSemantics::Default),
                    };
                    let addr = mutator.alloc(size, 8, 0, semantics).unwrap();
                    let bytes =
                        unsafe { std::slice::from_raw_parts_mut(addr.to_mut_ptr::<u8>(), size) };
                    assert!(bytes.iter().all(|&b| b == 0), "memory is not zeroed");
                    bytes.fill(pattern);
                    allocations.push((addr.as_usize(), size, pattern));
                }
                heap.destroy_mutator(mutator);
                allocations
            })
        })
        .collect();

    let mut all: Vec<(usize, usize, u8)> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(all.len(), THREADS * OBJECTS_PER_THREAD);
    for &(start, size, pattern) in all.iter() {
        let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, size) };
        assert!(bytes.iter().all(|&b| b == pattern), "object at {:#x} was overwritten", start);
    }
    all.sort_unstable();
    for pair in all.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{:x?} overlaps {:x?}", pair[0], pair[1]);
    }
}

#[test]
pub fn test_alignment_and_offset() {
    let (heap, _state) = engine_without_collection("");
    assert!(!heap.is_collection_initialized());
    let mut mutator = heap.bind_mutator(tls(1));
    for &(align, offset) in &[(16, 0isize), (64, 8), (256, 16), (4096, 0), (16, -8), (64, -24)] {
        for semantics in [
            AllocationSemantics::Default,
            AllocationSemantics::NonMoving,
            AllocationSemantics::Immortal,
            AllocationSemantics::Los,
        ] {
            let addr = mutator.alloc(40, align, offset, semantics).unwrap();
            let biased = Address::from_usize((addr.as_usize() as isize + offset) as usize);
            assert!(
                biased.is_aligned_to(align),
                "{} + {} not aligned to {} ({:?})",
                addr,
                offset,
                align,
                semantics
            );
            assert!(heap.is_mmtk_object(addr));
            assert_eq!(heap.los.contains(addr), semantics == AllocationSemantics::Los);
        }
    }
}

#[test]
pub fn test_negative_offset_biases_below_the_object() {
    let (heap, _state) = engine_without_collection("");
    let mut mutator = heap.bind_mutator(tls(1));
    for _ in 0..8 {
        let addr = mutator.alloc(24, 16, -8, AllocationSemantics::Default).unwrap();
        assert!(addr.sub(8).is_aligned_to(16), "{} - 8 not aligned to 16", addr);
        assert!(!heap.los.contains(addr));
    }
}

#[test]
pub fn test_biased_requests_stay_in_size_classes() {
    let (heap, state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let first = mutator.alloc(16, 16, 8, AllocationSemantics::Default).unwrap();
    let used = heap.used_bytes();
    let mut objects = vec![first];
    for _ in 0..10 {
        let addr = mutator.alloc(16, 16, 8, AllocationSemantics::Default).unwrap();
        assert!(addr.add(8).is_aligned_to(16));
        assert!(heap.mark_sweep_space(0).contains(addr));
        assert!(heap.is_mmtk_object(addr));
        objects.push(addr);
    }
    assert_eq!(heap.los.live_objects(), 0);
    assert!(heap.used_bytes() - used < BYTES_IN_PAGE);
    objects.sort_unstable();
    for pair in objects.windows(2) {
        assert!(pair[0].add(16) <= pair[1]);
    }

    // The sweep finds biased objects through their allocation bits.
    let keep = objects[5];
    state.set_root(0, ObjectReference::from_raw_address(keep));
    collect(&heap);
    assert!(heap.is_mmtk_object(keep));
    for &addr in objects.iter().filter(|&&addr| addr != keep) {
        assert!(!heap.is_mmtk_object(addr));
    }
    assert!(heap.statistics().freed_bytes >= 10 * 16);
}

#[test]
pub fn test_oversized_request_is_out_of_memory() {
    let (heap, state) = engine_without_collection("");
    let mut mutator = heap.bind_mutator(tls(1));
    let used = heap.used_bytes();
    for size in [usize::MAX - 2, usize::MAX - 7] {
        assert_eq!(
            mutator.alloc(size, 8, 0, AllocationSemantics::Default),
            Err(AllocError::OutOfMemory {
                size,
                semantics: AllocationSemantics::Default
            })
        );
    }
    assert_eq!(state.out_of_memory.load(Ordering::Relaxed), 2);
    assert_eq!(heap.used_bytes(), used);
}

#[test]
pub fn test_large_requests_go_to_the_large_object_space() {
    let (heap, _state) = engine_without_collection("");
    let mut mutator = heap.bind_mutator(tls(1));
    let small = mutator
        .alloc(MAX_NON_LOS_ALLOC_BYTES, 8, 0, AllocationSemantics::Default)
        .unwrap();
    let large = mutator
        .alloc(MAX_NON_LOS_ALLOC_BYTES + 8, 8, 0, AllocationSemantics::Default)
        .unwrap();
    let explicit = mutator.alloc(64, 8, 0, AllocationSemantics::Los).unwrap();
    assert!(!heap.los.contains(small));
    assert!(heap.los.contains(large));
    assert!(heap.los.contains(explicit));
    assert_eq!(heap.los.live_objects(), 2);

    for addr in [small, large, explicit] {
        assert!(heap.is_in_spaces(addr));
        assert!(heap.is_mapped_address(addr));
        assert!(heap.is_mmtk_object(addr));
    }
    assert!(!heap.is_mmtk_object(small.add(8)));
    assert!(!heap.is_in_spaces(Address::from_usize(8)));
}

#[test]
pub fn test_immortal_and_non_moving_semantics() {
    let (heap, _state) = engine_without_collection("");
    let mut mutator = heap.bind_mutator(tls(1));
    let immortal = mutator.alloc(32, 8, 0, AllocationSemantics::Immortal).unwrap();
    let non_moving = mutator.alloc(32, 8, 0, AllocationSemantics::NonMoving).unwrap();
    let default = mutator.alloc(32, 8, 0, AllocationSemantics::Default).unwrap();
    assert!(heap.immortal.contains(immortal));
    assert!(heap.mark_sweep_space(1).contains(non_moving));
    assert!(heap.mark_sweep_space(0).contains(default));
    assert!(heap.starting_heap_address() <= immortal);
    assert!(heap.last_heap_address() > default);
}

#[test]
pub fn test_allocator_mapping() {
    let (heap, _state) = engine_without_collection("");
    assert_eq!(
        heap.get_allocator_mapping(AllocationSemantics::Default),
        AllocatorSelector::FreeList(0)
    );
    assert_eq!(
        heap.get_allocator_mapping(AllocationSemantics::NonMoving),
        AllocatorSelector::FreeList(1)
    );
    assert_eq!(
        heap.get_allocator_mapping(AllocationSemantics::Immortal),
        AllocatorSelector::BumpPointer(0)
    );
    assert_eq!(
        heap.get_allocator_mapping(AllocationSemantics::Los),
        AllocatorSelector::LargeObject(0)
    );
    assert_eq!(heap.get_max_non_los_default_alloc_bytes(), MAX_NON_LOS_ALLOC_BYTES);

    let mutator = heap.bind_mutator(tls(1));
    for semantics in AllocationSemantics::ALL {
        assert_eq!(
            mutator.allocator_mapping().get(semantics),
            heap.get_allocator_mapping(semantics)
        );
    }

    let (no_gc, _state) = engine_without_collection("plan=NoGC");
    assert_eq!(no_gc.options().plan, PlanSelector::NoGC);
    assert_eq!(
        no_gc.get_allocator_mapping(AllocationSemantics::Default),
        AllocatorSelector::BumpPointer(0)
    );
    assert_eq!(
        no_gc.get_allocator_mapping(AllocationSemantics::Los),
        AllocatorSelector::LargeObject(0)
    );
}

#[test]
pub fn test_no_gc_plan_bump_allocates() {
    let (heap, _state) = engine("plan=NoGC");
    assert!(heap.is_collection_initialized());
    let mut mutator = heap.bind_mutator(tls(1));
    let first = mutator.alloc(24, 8, 0, AllocationSemantics::Default).unwrap();
    let second = mutator.alloc(24, 8, 0, AllocationSemantics::Default).unwrap();
    assert!(heap.immortal.contains(first));
    assert_eq!(second, first.add(24));
    collect(&heap);
    assert_eq!(heap.completed_collections(), 0);
}

#[test]
pub fn test_out_of_memory_is_reported() {
    let (heap, state) = engine_without_collection("gc_trigger=FixedHeapSize:4M");
    let mut mutator = heap.bind_mutator(tls(1));
    let size = (1 << 20) + 8;
    let mut allocated = 0;
    let error = loop {
        match mutator.alloc(size, 8, 0, AllocationSemantics::Default) {
            Ok(_) => allocated += 1,
            Err(error) => break error,
        }
        assert!(allocated < 8, "allocation never failed");
    };
    assert_eq!(allocated, 3);
    assert_eq!(
        error,
        AllocError::OutOfMemory {
            size,
            semantics: AllocationSemantics::Default
        }
    );
    assert_eq!(state.out_of_memory.load(Ordering::Relaxed), 1);
    assert!(heap.used_bytes() <= heap.total_bytes());

    // Small requests still fit.
    assert!(mutator.alloc(64, 8, 0, AllocationSemantics::Default).is_ok());
}
