pub mod collection_barrier;
pub mod space_bitmap;
