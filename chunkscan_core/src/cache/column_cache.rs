use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use dashmap::DashMap;
use log::debug;

use crate::core::{
    chunk::ChunkBuffer,
    error::{Result, ScanError},
    schema::{AttrSet, TupleDesc},
    storage_providers::traits::BlockStorage,
    support_types::{BlockNumber, ItemPointer, RelationId},
    tuple::{Datum, decode_tuple},
};

use super::{CacheHandle, CacheProvider};

struct CachedGranule {
    ctids: Vec<ItemPointer>,
    columns: Vec<Option<Vec<Datum>>>,
    attrs: AttrSet,
}

/// Granule-sized columnar copies of a relation, kept in a concurrent map.
pub struct MemoryColumnCache {
    granule_blocks: u32,
    granules: DashMap<(RelationId, BlockNumber), Arc<CachedGranule>, ahash::RandomState>,
    pinned: AtomicI64,
    next_token: AtomicU64,
    fail_loads: AtomicBool,
}

impl MemoryColumnCache {
    pub fn new(granule_blocks: u32) -> Self {
        MemoryColumnCache {
            granule_blocks,
            granules: DashMap::with_hasher(ahash::RandomState::new()),
            pinned: AtomicI64::new(0),
            next_token: AtomicU64::new(1),
            fail_loads: AtomicBool::new(false),
        }
    }

    pub fn granule_blocks(&self) -> u32 {
        self.granule_blocks
    }

    /// Materializes the columns `attrs` of the granule starting at `base`.
    pub fn build_granule(&self, storage: &dyn BlockStorage, base: BlockNumber, attrs: &AttrSet) -> Result<()> {
        if base % self.granule_blocks != 0 || base + self.granule_blocks > storage.nblocks() {
            return Err(ScanError::Cache(format!(
                "block {} does not start a complete granule of {} blocks",
                base, self.granule_blocks
            )));
        }

        let desc = storage.tuple_desc();
        let mut ctids = Vec::new();
        let mut columns: Vec<Option<Vec<Datum>>> = (0..desc.natts())
            .map(|attno| attrs.contains(attno as u16).then(Vec::new))
            .collect();

        for block in base..base + self.granule_blocks {
            let page = storage.read_block(block)?;
            for (line, bytes) in page.tuples().enumerate() {
                let values = decode_tuple(&desc, bytes)?;
                ctids.push(ItemPointer::new(block, line as u16));
                for (column, value) in columns.iter_mut().zip(values) {
                    if let Some(column) = column {
                        column.push(value);
                    }
                }
            }
        }

        debug!(
            "cached granule {} of relation {}: {} rows, {} columns",
            base,
            storage.relation_id(),
            ctids.len(),
            attrs.len()
        );

        self.granules.insert(
            (storage.relation_id(), base),
            Arc::new(CachedGranule {
                ctids,
                columns,
                attrs: attrs.clone(),
            }),
        );
        Ok(())
    }

    /// Caches every complete granule of the relation.
    pub fn build_all(&self, storage: &dyn BlockStorage, attrs: &AttrSet) -> Result<usize> {
        let granules = storage.nblocks() / self.granule_blocks;
        for i in 0..granules {
            self.build_granule(storage, i * self.granule_blocks, attrs)?;
        }
        Ok(granules as usize)
    }

    pub fn invalidate(&self, relation: RelationId, base: BlockNumber) -> bool {
        self.granules.remove(&(relation, base)).is_some()
    }

    /// Handles currently held by callers.
    pub fn pinned(&self) -> i64 {
        self.pinned.load(Ordering::Acquire)
    }

    /// Makes every subsequent `load` fail. Test hook.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Release);
    }

    fn granule(&self, handle: &CacheHandle) -> Option<Arc<CachedGranule>> {
        self.granules
            .get(&(handle.relation, handle.base))
            .map(|entry| entry.value().clone())
    }
}

impl CacheProvider for MemoryColumnCache {
    fn lookup(&self, relation: RelationId, aligned_block: BlockNumber) -> Option<CacheHandle> {
        if !self.granules.contains_key(&(relation, aligned_block)) {
            return None;
        }
        self.pinned.fetch_add(1, Ordering::AcqRel);
        Some(CacheHandle {
            relation,
            base: aligned_block,
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn is_empty(&self, handle: &CacheHandle) -> bool {
        self.granule(handle).is_none_or(|g| g.ctids.is_empty())
    }

    fn covers(&self, handle: &CacheHandle, attrs: &AttrSet) -> bool {
        self.granule(handle).is_some_and(|g| attrs.is_subset_of(&g.attrs))
    }

    fn load(&self, handle: &CacheHandle, desc: &Arc<TupleDesc>, attrs: &AttrSet) -> Result<ChunkBuffer> {
        if self.fail_loads.load(Ordering::Acquire) {
            return Err(ScanError::Cache(format!(
                "failed to load granule {} of relation {}",
                handle.base, handle.relation
            )));
        }

        let granule = self.granule(handle).ok_or_else(|| {
            ScanError::Cache(format!("granule {} was invalidated", handle.base))
        })?;

        if !attrs.is_subset_of(&granule.attrs) {
            return Err(ScanError::Cache(format!(
                "granule {} does not hold every requested attribute",
                handle.base
            )));
        }

        let columns = granule
            .columns
            .iter()
            .enumerate()
            .map(|(attno, column)| {
                if attrs.contains(attno as u16) {
                    column.clone()
                } else {
                    None
                }
            })
            .collect();

        ChunkBuffer::new_column(desc.clone(), handle.relation, granule.ctids.clone(), columns)
    }

    fn release(&self, _handle: CacheHandle) {
        self.pinned.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        chunk::{ChunkFormat, read_all_tuples},
        db_type::DbType,
        schema::Attribute,
        storage_providers::memory::MemoryStorageProvider,
    };

    fn storage() -> MemoryStorageProvider {
        let desc = Arc::new(TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("name", DbType::STRING),
        ]));
        let rows = (0..20)
            .map(|i| vec![Datum::I32(i), Datum::Text(format!("row{}", i))])
            .collect();
        MemoryStorageProvider::from_rows(3, desc, 2, rows).unwrap()
    }

    #[test]
    fn test_lookup_load_release() {
        let storage = storage();
        let cache = MemoryColumnCache::new(4);
        let attrs = AttrSet::all(2);
        assert_eq!(cache.build_all(&storage, &attrs).unwrap(), 2);

        assert!(cache.lookup(3, 8).is_none());
        let handle = cache.lookup(3, 4).unwrap();
        assert_eq!(cache.pinned(), 1);
        assert!(!cache.is_empty(&handle));

        let chunk = cache.load(&handle, &storage.tuple_desc(), &attrs).unwrap();
        assert_eq!(chunk.format(), ChunkFormat::Column);
        let tuples = read_all_tuples(&chunk).unwrap();
        assert_eq!(tuples.len(), 8);
        assert_eq!(tuples[0].ctid, ItemPointer::new(4, 0));
        assert_eq!(tuples[0].values[0], Datum::I32(8));

        cache.release(handle);
        assert_eq!(cache.pinned(), 0);
    }

    #[test]
    fn test_partial_granule_rejected() {
        let storage = storage();
        let cache = MemoryColumnCache::new(4);
        assert!(cache.build_granule(&storage, 8, &AttrSet::all(2)).is_err());
        assert!(cache.build_granule(&storage, 2, &AttrSet::all(2)).is_err());
    }

    #[test]
    fn test_missing_attribute_fails_load() {
        let storage = storage();
        let cache = MemoryColumnCache::new(4);
        cache.build_granule(&storage, 0, &AttrSet::from_iter([0])).unwrap();

        let handle = cache.lookup(3, 0).unwrap();
        assert!(cache.covers(&handle, &AttrSet::from_iter([0])));
        assert!(!cache.covers(&handle, &AttrSet::all(2)));
        let err = cache.load(&handle, &storage.tuple_desc(), &AttrSet::all(2));
        assert!(matches!(err, Err(ScanError::Cache(_))));
        cache.release(handle);
    }
}
