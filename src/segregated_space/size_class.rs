use crate::util::constants::MAX_NON_LOS_ALLOC_BYTES;

pub const SIZE_STEP: usize = 16;
pub const LARGE_CUTOFF: usize = MAX_NON_LOS_ALLOC_BYTES;
pub const PRECISE_CUTOFF: usize = 80;
pub const SIZE_CLASS_PROGRESSION: f64 = 1.4;

pub const fn size_class_to_index(size: usize) -> usize {
    (size + SIZE_STEP - 1) / SIZE_STEP
}

pub const fn index_to_size_class(index: usize) -> usize {
    index * SIZE_STEP
}

const fn round_up_to_multiple_of(divisor: usize, x: usize) -> usize {
    (x + (divisor - 1)) & !(divisor - 1)
}

/// Cell sizes of the mark-sweep spaces: precise steps for small objects, then a geometric
/// progression up to [`LARGE_CUTOFF`]. Every power of two is included so that over-aligned
/// requests can be served from cells whose size is a multiple of their alignment.
pub fn size_classes(size_class_progression: f64) -> Vec<usize> {
    let mut result = Vec::new();

    let mut size = SIZE_STEP;
    while size < PRECISE_CUTOFF {
        result.push(size);
        size += SIZE_STEP;
    }

    for i in 0.. {
        let approximate_size = PRECISE_CUTOFF as f64 * size_class_progression.powi(i);
        let approximate_size_in_bytes = approximate_size as usize;
        if approximate_size_in_bytes > LARGE_CUTOFF {
            break;
        }
        let size_class = round_up_to_multiple_of(SIZE_STEP, approximate_size_in_bytes);
        if Some(&size_class) == result.last() {
            continue;
        }
        result.push(size_class);
    }

    let mut power = SIZE_STEP;
    while power <= LARGE_CUTOFF {
        result.push(power);
        power *= 2;
    }
    result.sort_unstable();
    result.dedup();
    log::trace!("size classes: {:?}", result);
    result
}

/// Size class table with a direct lookup from `size / SIZE_STEP` to the class index.
pub struct SizeClasses {
    sizes: Vec<usize>,
    class_for_step: Vec<u8>,
}

impl SizeClasses {
    pub fn new() -> Self {
        let sizes = size_classes(SIZE_CLASS_PROGRESSION);
        debug_assert!(sizes.len() < u8::MAX as usize);
        let mut class_for_step = vec![0u8; size_class_to_index(LARGE_CUTOFF) + 1];
        let mut class = 0;
        for (step, entry) in class_for_step.iter_mut().enumerate() {
            while sizes[class] < index_to_size_class(step) {
                class += 1;
            }
            *entry = class as u8;
        }
        Self {
            sizes,
            class_for_step,
        }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    #[inline]
    pub fn cell_size(&self, class: usize) -> usize {
        self.sizes[class]
    }

    /// Smallest class holding `size` bytes at `align`, or `None` when the request belongs in the
    /// large object space.
    #[inline]
    pub fn class_for(&self, size: usize, align: usize) -> Option<usize> {
        let size = if align > SIZE_STEP {
            size.max(align).next_power_of_two()
        } else {
            size.max(1)
        };
        if size > LARGE_CUTOFF {
            return None;
        }
        Some(self.class_for_step[size_class_to_index(size)] as usize)
    }
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_sorted_steps() {
        let classes = size_classes(SIZE_CLASS_PROGRESSION);
        assert_eq!(&classes[..4], &[16, 32, 48, 64]);
        assert_eq!(*classes.last().unwrap(), LARGE_CUTOFF);
        assert!(classes.windows(2).all(|w| w[0] < w[1]));
        assert!(classes.iter().all(|c| c % SIZE_STEP == 0));
    }

    #[test]
    fn lookup_picks_smallest_fitting_class() {
        let classes = SizeClasses::new();
        for size in (8..=LARGE_CUTOFF).step_by(8) {
            let class = classes.class_for(size, 8).unwrap();
            assert!(classes.cell_size(class) >= size);
            if class > 0 {
                assert!(classes.cell_size(class - 1) < size);
            }
        }
        assert_eq!(classes.class_for(LARGE_CUTOFF + 8, 8), None);
    }

    #[test]
    fn over_aligned_requests_use_power_of_two_cells() {
        let classes = SizeClasses::new();
        let class = classes.class_for(40, 64).unwrap();
        assert_eq!(classes.cell_size(class), 64);
        let class = classes.class_for(100, 32).unwrap();
        assert_eq!(classes.cell_size(class), 128);
    }
}
