#[macro_use]
pub mod fatal;
pub mod address;
pub mod constants;

pub use address::{Address, ObjectReference, VMThread};

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr.wrapping_add(align).wrapping_sub(1), align)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Number of pages needed to hold `bytes`.
#[inline(always)]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, constants::BYTES_IN_PAGE) >> constants::LOG_BYTES_IN_PAGE
}

#[inline(always)]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << constants::LOG_BYTES_IN_PAGE
}

/// Parses sizes such as `4096`, `64K`, `32M` or `1G`.
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 10),
        b'm' | b'M' => (&value[..value.len() - 1], 20),
        b'g' | b'G' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let base: usize = digits.parse().ok()?;
    base.checked_mul(1usize << shift)
}
