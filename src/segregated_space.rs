//! Non-moving mark-sweep space built from size-segregated blocks.
//!
//! Every block holds cells of a single size class. Free cells are threaded into an intrusive
//! list through their first word; a mutator takes a whole block's list at a time and pops cells
//! without synchronisation. Sweeping rebuilds the lists from the alloc and mark bits and returns
//! blocks without survivors to the block allocator.
pub mod size_class;

use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block_allocator::BlockAllocator;
use crate::heap_controller::{HeapController, ReserveCap};
use crate::mmap::Mmap;
use crate::space::{Region, SideMetadata, Space};
use crate::util::constants::{BLOCK_SIZE, LOG_BLOCK_SIZE, PAGES_IN_BLOCK};
use crate::util::Address;

use self::size_class::{SizeClasses, SIZE_STEP};

/// Words of the per-block survivor bitset; the smallest cell size bounds the cell count.
const LIVE_CELL_WORDS: usize = BLOCK_SIZE / SIZE_STEP / 64;

/// Bytes reclaimed and retained by one sweep packet.
#[derive(Copy, Clone, Debug, Default)]
pub struct SweepResult {
    pub freed_bytes: usize,
    pub live_bytes: usize,
    pub released_blocks: usize,
}

impl SweepResult {
    pub fn merge(&mut self, other: SweepResult) {
        self.freed_bytes += other.freed_bytes;
        self.live_bytes += other.live_bytes;
        self.released_blocks += other.released_blocks;
    }
}

pub struct MarkSweepSpace {
    name: &'static str,
    region: Region,
    blocks: BlockAllocator,
    /// Size class of each block plus one; zero for blocks not in use.
    block_class: Box<[AtomicU8]>,
    /// Free list left behind by the last sweep for each block.
    free_heads: Box<[AtomicUsize]>,
    /// Blocks with free cells, per size class.
    available: Mutex<Vec<Vec<Address>>>,
    size_classes: SizeClasses,
    reserved_pages: AtomicUsize,
}

impl MarkSweepSpace {
    pub fn new(name: &'static str, region: Region, mmap: Arc<Mmap>) -> Self {
        let nblocks = region.size() / BLOCK_SIZE;
        let size_classes = SizeClasses::new();
        Self {
            name,
            region,
            blocks: BlockAllocator::new(region, mmap),
            block_class: (0..nblocks).map(|_| AtomicU8::new(0)).collect(),
            free_heads: (0..nblocks).map(|_| AtomicUsize::new(0)).collect(),
            available: Mutex::new(vec![Vec::new(); size_classes.len()]),
            size_classes,
            reserved_pages: AtomicUsize::new(0),
        }
    }

    pub fn size_classes(&self) -> &SizeClasses {
        &self.size_classes
    }

    #[inline]
    fn block_index(&self, block: Address) -> usize {
        block.diff(self.region.start) >> LOG_BLOCK_SIZE
    }

    fn block_at(&self, index: usize) -> Address {
        self.region.start.add(index << LOG_BLOCK_SIZE)
    }

    /// Number of block slots that were ever handed out; sweeping covers `0..built_blocks()`.
    pub fn built_blocks(&self) -> usize {
        self.block_index(self.blocks.high_water())
    }

    /// Take a block with free cells of `class` and return the head of its free list.
    pub fn acquire_block(
        &self,
        class: usize,
        controller: &HeapController,
        cap: ReserveCap,
    ) -> Option<Address> {
        if let Some(block) = self.available.lock()[class].pop() {
            let index = self.block_index(block);
            let head = self.free_heads[index].swap(0, Ordering::AcqRel);
            debug_assert!(head != 0);
            return Some(Address::from_usize(head));
        }
        if !controller.try_reserve_pages(PAGES_IN_BLOCK, cap) {
            return None;
        }
        let block = match self.blocks.get_block() {
            Some(block) => block,
            None => {
                controller.release_pages(PAGES_IN_BLOCK);
                log::debug!("{} space exhausted", self.name);
                return None;
            }
        };
        self.reserved_pages
            .fetch_add(PAGES_IN_BLOCK, Ordering::Relaxed);
        let cell_size = self.size_classes.cell_size(class);
        let cells = BLOCK_SIZE / cell_size;
        let mut head = Address::ZERO;
        for i in (0..cells).rev() {
            let cell = block.add(i * cell_size);
            unsafe {
                cell.store(head);
            }
            head = cell;
        }
        self.block_class[self.block_index(block)].store(class as u8 + 1, Ordering::Release);
        Some(head)
    }

    /// Forget the free lists of the previous cycle; sweeping rebuilds them.
    pub fn prepare(&self, metadata: &SideMetadata, full_heap: bool) {
        for list in self.available.lock().iter_mut() {
            list.clear();
        }
        for head in self.free_heads.iter() {
            head.store(0, Ordering::Relaxed);
        }
        if full_heap {
            metadata
                .mark
                .clear_range(self.region.start, self.blocks.high_water());
        }
    }

    /// Sweep blocks `range`: reclaim allocated but unmarked objects and thread every cell without
    /// a survivor into a fresh free list. Blocks left empty go back to the block allocator.
    ///
    /// Objects are found through their alloc bits. An object placed past the start of its cell
    /// to honour an alignment bias keeps the whole cell alive.
    pub fn sweep_blocks(
        &self,
        range: Range<usize>,
        metadata: &SideMetadata,
        controller: &HeapController,
    ) -> SweepResult {
        let mut result = SweepResult::default();
        let mut available = Vec::new();
        let mut empty = Vec::new();
        for index in range {
            let class = match self.block_class[index].load(Ordering::Acquire) {
                0 => continue,
                class => class as usize - 1,
            };
            let block = self.block_at(index);
            let cell_size = self.size_classes.cell_size(class);
            let cells = BLOCK_SIZE / cell_size;
            let mut live_cells = [0u64; LIVE_CELL_WORDS];
            let mut live = 0;
            metadata
                .alloc
                .visit_set_range(block, block.add(BLOCK_SIZE), |object| {
                    if metadata.mark.test(object) {
                        let cell = object.diff(block) / cell_size;
                        live_cells[cell / 64] |= 1 << (cell % 64);
                        live += 1;
                    } else {
                        metadata.clear_object(object);
                        result.freed_bytes += cell_size;
                    }
                });
            let mut head = Address::ZERO;
            for i in (0..cells).rev() {
                if live_cells[i / 64] & (1 << (i % 64)) != 0 {
                    continue;
                }
                let cell = block.add(i * cell_size);
                unsafe {
                    cell.store(head);
                }
                head = cell;
            }
            result.live_bytes += live * cell_size;
            if live == 0 {
                self.block_class[index].store(0, Ordering::Release);
                empty.push(block);
            } else if !head.is_zero() {
                self.free_heads[index].store(head.as_usize(), Ordering::Release);
                available.push((class, block));
            }
        }
        if !available.is_empty() {
            let mut lists = self.available.lock();
            for (class, block) in available {
                lists[class].push(block);
            }
        }
        if !empty.is_empty() {
            result.released_blocks = empty.len();
            let pages = empty.len() * PAGES_IN_BLOCK;
            self.blocks.return_blocks(empty);
            self.reserved_pages.fetch_sub(pages, Ordering::Relaxed);
            controller.release_pages(pages);
        }
        result
    }
}

impl Space for MarkSweepSpace {
    fn name(&self) -> &'static str {
        self.name
    }

    fn region(&self) -> Region {
        self.region
    }

    fn high_water(&self) -> Address {
        self.blocks.high_water()
    }

    fn reserved_pages(&self) -> usize {
        self.reserved_pages.load(Ordering::Relaxed)
    }
}
