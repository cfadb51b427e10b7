pub mod accelerated;
pub mod chunk_producer;
pub mod fallback;
pub mod parallel;
pub mod range_allocator;
pub mod scan;
pub mod scheduler;
pub mod shared_state;
pub mod task;
