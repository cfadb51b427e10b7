//! Columnar cache contract consumed by the block range allocator, plus an
//! in-memory implementation and the synchronized-scan position service.

pub mod column_cache;
pub mod scan_sync;

use std::sync::Arc;

use crate::core::{
    chunk::ChunkBuffer,
    error::Result,
    schema::{AttrSet, TupleDesc},
    support_types::{BlockNumber, RelationId},
};

/// Pins one cached granule until released.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    pub relation: RelationId,
    /// First block of the granule.
    pub base: BlockNumber,
    pub token: u64,
}

/// Source of pre-materialized COLUMN chunks for granule-aligned block ranges.
///
/// Every method may be called without holding the allocator lock. A handle
/// returned by `lookup` must be passed to `release` exactly once, including
/// when `load` fails.
pub trait CacheProvider: Send + Sync {
    fn lookup(&self, relation: RelationId, aligned_block: BlockNumber) -> Option<CacheHandle>;

    /// True if the granule holds no tuples at all.
    fn is_empty(&self, handle: &CacheHandle) -> bool;

    /// True if the granule materialized every attribute in `attrs`. A granule
    /// that does not is treated as a miss.
    fn covers(&self, handle: &CacheHandle, attrs: &AttrSet) -> bool;

    fn load(&self, handle: &CacheHandle, desc: &Arc<TupleDesc>, attrs: &AttrSet) -> Result<ChunkBuffer>;

    fn release(&self, handle: CacheHandle);
}
