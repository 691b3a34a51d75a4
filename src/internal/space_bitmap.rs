use atomic::Atomic;
use atomic::Ordering;
use core::fmt;
use memmap2::MmapMut;
use std::io;
use std::mem::size_of;

use crate::util::Address;

pub const fn round_down(x: u64, n: u64) -> u64 {
    x & !(n - 1)
}

pub const fn round_up(x: u64, n: u64) -> u64 {
    round_down(x + n - 1, n)
}

/// One bit per `ALIGN` bytes of heap, stored out of line in an anonymous mapping.
///
/// All updates are atomic word operations: mutators set alloc bits in neighbouring cells
/// concurrently and collector workers race on mark bits.
pub struct SpaceBitmap<const ALIGN: usize> {
    _mem_map: MmapMut,
    bitmap_begin: *const Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

impl<const ALIGN: usize> SpaceBitmap<ALIGN> {
    pub fn create(name: &'static str, heap_begin: Address, heap_capacity: usize) -> io::Result<Self> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity as _);
        let mem_map = MmapMut::map_anon(bitmap_size.max(size_of::<usize>()))?;
        let bitmap_begin = mem_map.as_ptr() as *const Atomic<usize>;
        Ok(Self {
            name,
            _mem_map: mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin: heap_begin.as_usize(),
            heap_limit: heap_begin.as_usize() + heap_capacity,
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn heap_begin(&self) -> Address {
        Address::from_usize(self.heap_begin)
    }

    #[inline]
    pub fn heap_limit(&self) -> Address {
        Address::from_usize(self.heap_limit)
    }

    #[inline]
    pub fn has_address(&self, addr: Address) -> bool {
        addr.as_usize() >= self.heap_begin && addr.as_usize() < self.heap_limit
    }

    #[inline]
    pub fn index_to_offset(index: u64) -> u64 {
        index * ALIGN as u64 * BITS_PER_INTPTR as u64
    }

    #[inline]
    pub fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_INTPTR
    }

    #[inline]
    pub fn offset_bit_index(offset: usize) -> usize {
        (offset / ALIGN) % BITS_PER_INTPTR
    }

    #[inline]
    pub fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    #[inline]
    fn locate(&self, addr: Address) -> (&Atomic<usize>, usize) {
        debug_assert!(
            self.has_address(addr),
            "{}: address {} outside of [{:#x}, {:#x})",
            self.name,
            addr,
            self.heap_begin,
            self.heap_limit
        );
        let offset = addr.as_usize() - self.heap_begin;
        let index = Self::offset_to_index(offset);
        unsafe { (&*self.bitmap_begin.add(index), Self::offset_to_mask(offset)) }
    }

    /// Sets the bit for `addr`. Returns true if it was already set.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: Address) -> bool {
        let (entry, mask) = self.locate(addr);
        let mut old_word;
        while {
            old_word = entry.load(Ordering::Relaxed);
            if (old_word & mask) != 0 {
                return true;
            }
            entry
                .compare_exchange_weak(
                    old_word,
                    old_word | mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
        } {}
        false
    }

    /// Clears the bit for `addr`. Returns true if this call cleared it.
    #[inline]
    pub fn atomic_test_and_clear(&self, addr: Address) -> bool {
        let (entry, mask) = self.locate(addr);
        if entry.load(Ordering::Relaxed) & mask == 0 {
            return false;
        }
        entry.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    #[inline]
    pub fn test(&self, addr: Address) -> bool {
        let (entry, mask) = self.locate(addr);
        entry.load(Ordering::Acquire) & mask != 0
    }

    #[inline(always)]
    pub fn set(&self, addr: Address) -> bool {
        let (entry, mask) = self.locate(addr);
        entry.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    #[inline(always)]
    pub fn clear(&self, addr: Address) -> bool {
        let (entry, mask) = self.locate(addr);
        entry.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    pub fn compute_bitmap_size(capacity: u64) -> usize {
        let bytes_covered_per_word = ALIGN * BITS_PER_INTPTR;
        ((round_up(capacity, bytes_covered_per_word as _) / bytes_covered_per_word as u64)
            * size_of::<usize>() as u64) as _
    }

    /// Clears every bit covering `[begin, end)`.
    pub fn clear_range(&self, begin: Address, end: Address) {
        let mut begin_offset = begin.as_usize() - self.heap_begin;
        let mut end_offset = end.as_usize() - self.heap_begin;
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear(Address::from_usize(self.heap_begin + begin_offset));
            begin_offset += ALIGN;
        }
        while begin_offset < end_offset && Self::offset_bit_index(end_offset) != 0 {
            end_offset -= ALIGN;
            self.clear(Address::from_usize(self.heap_begin + end_offset));
        }
        let index_start = Self::offset_to_index(begin_offset);
        let index_end = Self::offset_to_index(end_offset);
        for index in index_start..index_end {
            unsafe {
                (*self.bitmap_begin.add(index)).store(0, Ordering::Relaxed);
            }
        }
    }

    /// Visit set bits in `[visit_begin, visit_end)`.
    ///
    /// Each word is loaded once before its bits are visited, so the visitor may change bits it has
    /// already been handed.
    pub fn visit_set_range(
        &self,
        visit_begin: Address,
        visit_end: Address,
        mut visitor: impl FnMut(Address),
    ) {
        if visit_begin >= visit_end {
            return;
        }
        let offset_start = visit_begin.as_usize() - self.heap_begin;
        let offset_end = visit_end.as_usize() - self.heap_begin;

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = (offset_start / ALIGN) % BITS_PER_INTPTR;
        let bit_end = (offset_end / ALIGN) % BITS_PER_INTPTR;

        let mut visit_word = |index: usize, mut word: usize| {
            let base = Self::index_to_offset(index as _) as usize + self.heap_begin;
            while word != 0 {
                let shift = word.trailing_zeros() as usize;
                visitor(Address::from_usize(base + shift * ALIGN));
                word ^= 1 << shift;
            }
        };

        unsafe {
            let load = |index: usize| (*self.bitmap_begin.add(index)).load(Ordering::Acquire);
            let mut left_edge = load(index_start);
            left_edge &= !((1usize << bit_start) - 1);
            let mut right_edge;
            if index_start < index_end {
                visit_word(index_start, left_edge);
                for index in index_start + 1..index_end {
                    visit_word(index, load(index));
                }
                // visit_end may start a new word, in which case there is nothing left.
                right_edge = if bit_end == 0 { 0 } else { load(index_end) };
            } else {
                right_edge = left_edge;
            }
            right_edge &= (1usize << bit_end).wrapping_sub(1);
            visit_word(index_end, right_edge);
        }
    }
}

impl<const ALIGN: usize> fmt::Debug for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:#x},end={:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}

unsafe impl<const ALIGN: usize> Send for SpaceBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for SpaceBitmap<ALIGN> {}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x1000_0000;

    fn bitmap() -> SpaceBitmap<8> {
        SpaceBitmap::create("test", Address::from_usize(BASE), 1 << 20).unwrap()
    }

    #[test]
    fn test_and_set_reports_previous_state() {
        let bits = bitmap();
        let a = Address::from_usize(BASE + 64);
        assert!(!bits.test(a));
        assert!(!bits.atomic_test_and_set(a));
        assert!(bits.atomic_test_and_set(a));
        assert!(bits.test(a));
        assert!(bits.atomic_test_and_clear(a));
        assert!(!bits.atomic_test_and_clear(a));
    }

    #[test]
    fn clear_range_spans_words() {
        let bits = bitmap();
        for i in 0..2000 {
            bits.set(Address::from_usize(BASE + i * 8));
        }
        bits.clear_range(
            Address::from_usize(BASE + 8 * 3),
            Address::from_usize(BASE + 8 * 1500),
        );
        assert!(bits.test(Address::from_usize(BASE + 16)));
        assert!(!bits.test(Address::from_usize(BASE + 24)));
        assert!(!bits.test(Address::from_usize(BASE + 8 * 700)));
        assert!(!bits.test(Address::from_usize(BASE + 8 * 1499)));
        assert!(bits.test(Address::from_usize(BASE + 8 * 1500)));
    }

    #[test]
    fn visit_only_set_bits_in_range() {
        let bits = bitmap();
        let set = [5usize, 63, 64, 65, 300, 1023];
        for i in set {
            bits.set(Address::from_usize(BASE + i * 8));
        }
        let mut seen = vec![];
        bits.visit_set_range(
            Address::from_usize(BASE + 8 * 6),
            Address::from_usize(BASE + 8 * 1023),
            |a| seen.push((a.as_usize() - BASE) / 8),
        );
        assert_eq!(seen, vec![63, 64, 65, 300]);
    }
}
