use std::ops::Range;

use crate::collector::GcWorker;
use crate::segregated_space::SweepResult;
use crate::space::Space;
use crate::task_scheduler::{GcWork, WorkScheduler, WorkStage};

/// Blocks swept by one packet.
const SWEEP_CHUNK_BLOCKS: usize = 64;

/// Sweep a range of blocks of one mark-sweep space.
pub struct SweepBlocks {
    space: u8,
    range: Range<usize>,
}

impl GcWork for SweepBlocks {
    fn do_work(&mut self, worker: &mut GcWorker) {
        let heap = worker.heap();
        let result = heap.mark_sweep_space(self.space).sweep_blocks(
            self.range.clone(),
            &heap.metadata,
            &heap.controller,
        );
        heap.record_sweep(result);
    }
}

pub struct SweepLargeObjects;

impl GcWork for SweepLargeObjects {
    fn do_work(&mut self, worker: &mut GcWorker) {
        let heap = worker.heap();
        let result = heap.los.sweep(&heap.metadata, &heap.controller);
        heap.record_sweep(result);
    }
}

/// Queue sweep packets for every block ever built in `space`, in chunks.
pub fn schedule_space(scheduler: &WorkScheduler, space: u8, built_blocks: usize) -> usize {
    let mut packets = 0;
    let mut start = 0;
    while start < built_blocks {
        let end = (start + SWEEP_CHUNK_BLOCKS).min(built_blocks);
        scheduler.add(
            WorkStage::Sweep,
            SweepBlocks {
                space,
                range: start..end,
            },
        );
        packets += 1;
        start = end;
    }
    packets
}

/// Bytes still in use in spaces nobody sweeps.
pub fn unswept_live_bytes(space: &dyn Space) -> SweepResult {
    SweepResult {
        live_bytes: crate::util::pages_to_bytes(space.reserved_pages()),
        ..SweepResult::default()
    }
}
