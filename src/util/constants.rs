pub const LOG_BYTES_IN_WORD: usize = 3;
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// Smallest alignment the engine hands out. Also the granularity of side metadata.
pub const MIN_ALIGNMENT: usize = BYTES_IN_WORD;

pub const LOG_BYTES_IN_PAGE: usize = 12;
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

pub const LOG_BLOCK_SIZE: usize = 16;
/// Mark-sweep blocks are 64KiB and aligned to their size.
pub const BLOCK_SIZE: usize = 1 << LOG_BLOCK_SIZE;
pub const PAGES_IN_BLOCK: usize = BLOCK_SIZE / BYTES_IN_PAGE;

/// Largest request served by the non-large-object allocators under default semantics.
pub const MAX_NON_LOS_ALLOC_BYTES: usize = 8 * 1024;

/// Size of the chunks a bump pointer allocator takes from its space.
pub const BUMP_CHUNK_SIZE: usize = 32 * 1024;

pub const DEFAULT_HEAP_RESERVATION: usize = 1 << 30;
pub const MIN_HEAP_RESERVATION: usize = 4 << 20;

/// Capacity of barrier and candidate staging buffers before they spill into global queues.
pub const LOCAL_BUFFER_CAPACITY: usize = 4096;

/// Number of objects or slots a tracing packet carries before it is split.
pub const TRACE_PACKET_CAPACITY: usize = 4096;
