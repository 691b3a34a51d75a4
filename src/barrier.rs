//! Reference write barriers.
//!
//! The host calls the pre hook before a reference store, the post hook after it and the slow
//! hook when its own inlined fast path decided the store has to be recorded. Which of them do
//! anything depends on the barrier the engine was built with.
use parking_lot::Mutex;

use crate::mutator::Mutator;
use crate::options::BarrierSelector;
use crate::util::constants::{BYTES_IN_WORD, LOCAL_BUFFER_CAPACITY};
use crate::util::{Address, ObjectReference};

/// Thread local barrier records, spilled into the [`RememberedSet`] when full and on flush.
#[derive(Default)]
pub struct BarrierBuffers {
    /// Objects whose unlog bit this thread cleared.
    modbuf: Vec<ObjectReference>,
    /// Slot ranges written by bulk copies, as (first slot, count).
    region_modbuf: Vec<(Address, usize)>,
    /// Values overwritten by reference stores.
    satb: Vec<ObjectReference>,
}

impl BarrierBuffers {
    pub fn is_empty(&self) -> bool {
        self.modbuf.is_empty() && self.region_modbuf.is_empty() && self.satb.is_empty()
    }

    pub fn flush_into(&mut self, remembered: &Mutex<RememberedSet>) {
        if self.is_empty() {
            return;
        }
        let mut remembered = remembered.lock();
        remembered.objects.append(&mut self.modbuf);
        remembered.regions.append(&mut self.region_modbuf);
        remembered.satb.append(&mut self.satb);
    }
}

/// Barrier records of every thread, consumed by the next collection.
#[derive(Default, Debug)]
pub struct RememberedSet {
    pub objects: Vec<ObjectReference>,
    pub regions: Vec<(Address, usize)>,
    pub satb: Vec<ObjectReference>,
}

impl RememberedSet {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.regions.is_empty() && self.satb.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len() + self.regions.len() + self.satb.len()
    }

    pub fn take(&mut self) -> RememberedSet {
        std::mem::take(self)
    }
}

impl Mutator {
    #[inline(always)]
    fn barrier_selector(&self) -> BarrierSelector {
        self.heap.barrier_selector()
    }

    fn check_store(&self, src: ObjectReference, slot: Address) {
        if !self.heap.in_reservation(src.to_raw_address()) || !self.heap.in_reservation(slot) {
            fatal!(
                "reference store into {:?} outside the heap (slot {})",
                src,
                slot
            );
        }
    }

    fn check_copy(&self, src: Address, dst: Address, count: usize) {
        let end = dst.add(count * BYTES_IN_WORD);
        if !self.heap.in_reservation(dst) || (count > 0 && !self.heap.in_reservation(end.sub(1))) {
            fatal!(
                "array copy of {} slots from {} to {} outside the heap",
                count,
                src,
                dst
            );
        }
    }

    /// Called before `target` is stored into `slot` of `src`.
    #[inline]
    pub fn object_reference_write_pre(
        &mut self,
        src: ObjectReference,
        slot: Address,
        target: Option<ObjectReference>,
    ) {
        let _ = target;
        self.check_store(src, slot);
        if self.barrier_selector() == BarrierSelector::SATBBarrier {
            if let Some(old) = unsafe { slot.load_slot() } {
                self.record_satb(old);
            }
        }
    }

    /// Called after `target` was stored into `slot` of `src`.
    #[inline]
    pub fn object_reference_write_post(
        &mut self,
        src: ObjectReference,
        slot: Address,
        target: Option<ObjectReference>,
    ) {
        self.check_store(src, slot);
        if self.barrier_selector() == BarrierSelector::ObjectBarrier
            && self.heap.metadata.unlog.test(src.to_raw_address())
        {
            self.object_reference_write_slow(src, slot, target);
        }
    }

    /// Remember `src` if this thread is the first to clear its unlog bit.
    #[inline(never)]
    pub fn object_reference_write_slow(
        &mut self,
        src: ObjectReference,
        slot: Address,
        target: Option<ObjectReference>,
    ) {
        let _ = target;
        self.check_store(src, slot);
        if self.barrier_selector() != BarrierSelector::ObjectBarrier {
            return;
        }
        if self
            .heap
            .metadata
            .unlog
            .atomic_test_and_clear(src.to_raw_address())
        {
            let (heap, local) = self.parts();
            local.barrier.modbuf.push(src);
            if local.barrier.modbuf.len() >= LOCAL_BUFFER_CAPACITY {
                local.barrier.flush_into(&heap.remembered);
            }
        }
    }

    /// Called before `count` slots starting at `src` are copied over the slots at `dst`.
    pub fn array_copy_pre(&mut self, src: Address, dst: Address, count: usize) {
        self.check_copy(src, dst, count);
        if self.barrier_selector() != BarrierSelector::SATBBarrier {
            return;
        }
        let (heap, local) = self.parts();
        for i in 0..count {
            if let Some(old) = unsafe { dst.add(i * BYTES_IN_WORD).load_slot() } {
                local.barrier.satb.push(old);
            }
        }
        if local.barrier.satb.len() >= LOCAL_BUFFER_CAPACITY {
            local.barrier.flush_into(&heap.remembered);
        }
    }

    /// Called after a bulk copy into `dst`. The whole destination range is one record.
    pub fn array_copy_post(&mut self, src: Address, dst: Address, count: usize) {
        self.check_copy(src, dst, count);
        if self.barrier_selector() != BarrierSelector::ObjectBarrier || count == 0 {
            return;
        }
        let (heap, local) = self.parts();
        local.barrier.region_modbuf.push((dst, count));
        if local.barrier.region_modbuf.len() >= LOCAL_BUFFER_CAPACITY {
            local.barrier.flush_into(&heap.remembered);
        }
    }

    fn record_satb(&mut self, old: ObjectReference) {
        let (heap, local) = self.parts();
        local.barrier.satb.push(old);
        if local.barrier.satb.len() >= LOCAL_BUFFER_CAPACITY {
            local.barrier.flush_into(&heap.remembered);
        }
    }

    /// Values recorded by the pre-write barrier on this thread and not yet flushed.
    pub fn satb_snapshot(&mut self) -> &[ObjectReference] {
        &self.local().barrier.satb
    }

    /// Objects remembered by the object barrier on this thread and not yet flushed.
    pub fn modified_objects(&mut self) -> &[ObjectReference] {
        &self.local().barrier.modbuf
    }
}
