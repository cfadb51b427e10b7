/// Size of one storage block (page) in bytes.
pub const BLCKSZ: usize = 8192;

/// Blocks per on-disk segment file; a multi-block read never crosses this boundary.
pub const DEFAULT_SEGMENT_BLOCKS: u32 = 131_072;

/// Blocks per columnar cache granule. Always a power of two.
pub const DEFAULT_CACHE_GRANULE_BLOCKS: u32 = 16_384;

/// Byte budget of one ROW chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

// Number of blocks requested from the range allocator at once when direct transfer is off
pub const DEFAULT_BLOCKS_PER_REQUEST: u32 = 8;

pub const DEFAULT_PROJECTION_HEADROOM: f64 = 1.2;

pub const DEFAULT_CONCURRENT_WORKERS: usize = 4;

pub mod core;

pub mod accelerator;
pub mod cache;
pub mod configuration;
pub mod memory_pool;
pub mod renderers;
