use std::{sync::Arc, thread};

use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::StdRng};

use chunkscan_core::{
    cache::{
        CacheProvider,
        column_cache::MemoryColumnCache,
        scan_sync::{MemoryScanSync, ScanSyncService},
    },
    configuration::Configuration,
    core::{
        db_type::DbType,
        processor::{range_allocator::BlockRangeAllocator, shared_state::SharedScanState},
        schema::{AttrSet, Attribute, TupleDesc},
        storage_providers::{memory::MemoryStorageProvider, traits::BlockStorage},
        tuple::Datum,
    },
};

const RELATION: u32 = 3;

fn desc() -> Arc<TupleDesc> {
    Arc::new(TupleDesc::new(vec![Attribute::new("v", DbType::I32)]))
}

fn config(segment: u32, granule: u32, syncscan: bool) -> Configuration {
    Configuration {
        segment_blocks: Some(segment),
        cache_granule_blocks: Some(granule),
        syncscan: Some(syncscan),
        ..Default::default()
    }
}

/// Runs `workers` threads against one allocator, each asking for a random
/// number of blocks per call, and returns every block handed out.
fn assigned_blocks(allocator: &BlockRangeAllocator, workers: usize, seed: u64, attrs: Option<&AttrSet>) -> Vec<u32> {
    thread::scope(|scope| {
        let handles = (0..workers)
            .map(|worker| {
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed + worker as u64);
                    let mut blocks = Vec::new();
                    while let Some(range) = allocator.next_range(rng.random_range(1..=9), attrs).unwrap() {
                        blocks.extend(range.start..range.start + range.nblocks);
                        if let Some(chunk) = range.cached {
                            blocks.extend(chunk.ctids().iter().map(|ctid| ctid.block).dedup());
                        }
                    }
                    blocks
                })
            })
            .collect_vec();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    })
}

fn assert_each_block_once(mut blocks: Vec<u32>, nblocks: u32) {
    blocks.sort_unstable();
    assert_eq!(blocks, (0..nblocks).collect_vec());
}

#[test]
fn every_block_is_assigned_exactly_once() {
    for workers in [1, 2, 3, 8] {
        for nblocks in [0, 1, 7, 64, 301] {
            let allocator = BlockRangeAllocator::new(
                Arc::new(SharedScanState::new()),
                RELATION,
                nblocks,
                desc(),
                &config(16, 4, false),
                None,
                None,
            );
            let blocks = assigned_blocks(&allocator, workers, nblocks as u64, None);
            assert_each_block_once(blocks, nblocks);
        }
    }
}

#[test]
fn synchronized_start_wraps_and_covers_the_relation() {
    for workers in [1, 3, 8] {
        for (nblocks, start) in [(50, 17), (50, 49), (9, 0), (33, 40)] {
            let sync = Arc::new(MemoryScanSync::new());
            sync.set_location(RELATION, start);
            let allocator = BlockRangeAllocator::new(
                Arc::new(SharedScanState::new()),
                RELATION,
                nblocks,
                desc(),
                &config(8, 4, true),
                None,
                Some(sync.clone() as Arc<dyn ScanSyncService>),
            );
            let blocks = assigned_blocks(&allocator, workers, start as u64, None);
            assert_each_block_once(blocks, nblocks);

            // out-of-range hints start the scan at block 0
            let expected_start = if start < nblocks { start } else { 0 };
            let reports = sync.reports();
            assert!(reports.contains(&(RELATION, expected_start)));
            if workers == 1 {
                assert_eq!(reports.last(), Some(&(RELATION, expected_start)));
                assert_eq!(sync.get_location(RELATION, nblocks), expected_start);
            }
        }
    }
}

#[test]
fn cached_granules_and_raw_ranges_partition_the_relation() {
    let nblocks = 70;
    let rows = (0..nblocks as i32).map(|v| vec![Datum::I32(v)]).collect();
    let storage = MemoryStorageProvider::from_rows(RELATION, desc(), 1, rows).unwrap();
    assert_eq!(storage.nblocks(), nblocks);

    let cache = Arc::new(MemoryColumnCache::new(8));
    for base in [8, 16, 40] {
        cache.build_granule(&storage, base, &AttrSet::all(1)).unwrap();
    }
    let attrs = AttrSet::all(1);

    for workers in [1, 2, 3, 8] {
        let allocator = BlockRangeAllocator::new(
            Arc::new(SharedScanState::new()),
            RELATION,
            nblocks,
            desc(),
            &config(32, 8, false),
            Some(cache.clone() as Arc<dyn CacheProvider>),
            None,
        );
        let blocks = assigned_blocks(&allocator, workers, 7, Some(&attrs));
        assert_each_block_once(blocks, nblocks);
        assert_eq!(cache.pinned(), 0);
    }
}
