use super::host::*;
use crate::internal::collection_barrier::GcRequest;

const EMERGENCY: GcRequest = GcRequest {
    full: true,
    emergency: true,
};

#[test]
pub fn test_weak_reference_is_cleared() {
    let (heap, state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let referent = new_object(&mut mutator, 1);
    let reference = new_reference(&mut mutator, referent);
    state.set_root(0, Some(reference));
    heap.add_weak_candidate(reference);

    collect(&heap);
    assert_eq!(read_field(reference, 0), None);
    assert_eq!(state.enqueued(), vec![reference]);
    assert!(!heap.is_mmtk_object(referent.to_raw_address()));
    assert!(heap.is_live_object(reference));

    // Cleared references are not processed again.
    collect(&heap);
    assert_eq!(state.enqueued().len(), 1);

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_weak_reference_follows_reachability() {
    let (heap, state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let referent = new_object(&mut mutator, 1);
    let reference = new_reference(&mut mutator, referent);
    state.set_root(0, Some(reference));
    state.set_root(1, Some(referent));
    mutator.add_weak_candidate(reference);

    collect(&heap);
    assert_eq!(read_field(reference, 0), Some(referent));
    assert!(state.enqueued().is_empty());

    state.set_root(1, None);
    collect(&heap);
    assert_eq!(read_field(reference, 0), None);
    assert_eq!(state.enqueued(), vec![reference]);

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_soft_reference_survives_until_emergency() {
    let (heap, state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let referent = new_object(&mut mutator, 2);
    let reference = new_reference(&mut mutator, referent);
    state.set_root(0, Some(reference));
    heap.add_soft_candidate(reference);

    collect(&heap);
    assert_eq!(read_field(reference, 0), Some(referent));
    assert!(heap.is_mmtk_object(referent.to_raw_address()));
    assert!(state.enqueued().is_empty());

    heap.collect_and_wait(EMERGENCY);
    assert_eq!(read_field(reference, 0), None);
    assert_eq!(state.enqueued(), vec![reference]);
    assert!(!heap.is_mmtk_object(referent.to_raw_address()));
    assert_eq!(heap.statistics().emergency_collections, 1);

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_finalizer_runs_once() {
    let (heap, _state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let object = new_object(&mut mutator, 1);
    let child = new_object(&mut mutator, 1);
    write_field(&mut mutator, object, 0, Some(child));
    mutator.add_finalizer(object);

    collect(&heap);
    assert_eq!(heap.get_finalized_object(), Some(object));
    assert_eq!(heap.get_finalized_object(), None);
    // Resurrected together with everything it reaches.
    assert!(heap.is_mmtk_object(object.to_raw_address()));
    assert_eq!(read_field(object, 0), Some(child));
    assert!(heap.is_mmtk_object(child.to_raw_address()));

    collect(&heap);
    assert_eq!(heap.get_finalized_object(), None);
    assert!(!heap.is_mmtk_object(object.to_raw_address()));
    assert!(!heap.is_mmtk_object(child.to_raw_address()));

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_finalizable_objects_stay_alive_until_taken() {
    let (heap, _state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let object = new_object(&mut mutator, 1);
    heap.add_finalizer(object);

    collect(&heap);
    collect(&heap);
    assert!(heap.is_mmtk_object(object.to_raw_address()));
    assert_eq!(heap.get_finalized_object(), Some(object));

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_no_finalizer_option() {
    let (heap, _state) = engine("no_finalizer=true");
    let mut mutator = heap.bind_mutator(tls(1));
    let object = new_object(&mut mutator, 1);
    heap.add_finalizer(object);
    collect(&heap);
    assert_eq!(heap.get_finalized_object(), None);
    assert!(!heap.is_mmtk_object(object.to_raw_address()));

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_phantom_reference_outlives_finalization() {
    let (heap, state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let referent = new_object(&mut mutator, 1);
    let weak = new_reference(&mut mutator, referent);
    let phantom = new_reference(&mut mutator, referent);
    state.set_root(0, Some(weak));
    state.set_root(1, Some(phantom));
    heap.add_weak_candidate(weak);
    heap.add_phantom_candidate(phantom);
    heap.add_finalizer(referent);

    collect(&heap);
    // Weak references are cleared before finalization resurrects the referent.
    assert_eq!(read_field(weak, 0), None);
    assert_eq!(read_field(phantom, 0), Some(referent));
    assert_eq!(state.enqueued(), vec![weak]);
    assert_eq!(heap.get_finalized_object(), Some(referent));

    collect(&heap);
    assert_eq!(read_field(phantom, 0), None);
    assert_eq!(state.enqueued(), vec![weak, phantom]);
    assert!(!heap.is_mmtk_object(referent.to_raw_address()));

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_no_reference_types_keeps_referents() {
    let (heap, state) = engine("no_reference_types=true");
    let mut mutator = heap.bind_mutator(tls(1));
    let weak_referent = new_object(&mut mutator, 1);
    let soft_referent = new_object(&mut mutator, 1);
    let weak = new_reference(&mut mutator, weak_referent);
    let soft = new_reference(&mut mutator, soft_referent);
    state.set_root(0, Some(weak));
    state.set_root(1, Some(soft));
    heap.add_weak_candidate(weak);
    heap.add_soft_candidate(soft);

    collect(&heap);
    heap.collect_and_wait(EMERGENCY);
    assert_eq!(read_field(weak, 0), Some(weak_referent));
    assert_eq!(read_field(soft, 0), Some(soft_referent));
    assert!(heap.is_mmtk_object(weak_referent.to_raw_address()));
    assert!(heap.is_mmtk_object(soft_referent.to_raw_address()));
    assert!(state.enqueued().is_empty());

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_dead_references_are_dropped() {
    let (heap, state) = engine("");
    let mut mutator = heap.bind_mutator(tls(1));
    let referent = new_object(&mut mutator, 1);
    let reference = new_reference(&mut mutator, referent);
    heap.add_weak_candidate(reference);
    assert_eq!(heap.weak_refs.len(), 1);

    collect(&heap);
    assert!(state.enqueued().is_empty());
    assert!(heap.weak_refs.is_empty());
    assert!(!heap.is_mmtk_object(reference.to_raw_address()));
    assert!(!heap.is_mmtk_object(referent.to_raw_address()));

    drop(mutator);
    heap.shutdown();
}
