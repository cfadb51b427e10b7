use std::sync::Arc;

use log::{debug, trace};

use crate::{
    cache::{CacheHandle, CacheProvider, scan_sync::ScanSyncService},
    configuration::Configuration,
    core::{
        chunk::ChunkBuffer,
        error::Result,
        schema::{AttrSet, TupleDesc},
        support_types::{BlockNumber, RelationId},
    },
};

use super::shared_state::{BlockRangeCursor, SharedScanState};

/// Blocks assigned to one caller. `nblocks` raw blocks start at `start`;
/// `cached` carries a COLUMN chunk for the granule that follows them.
#[derive(Debug)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub nblocks: u32,
    pub cached: Option<ChunkBuffer>,
}

enum Probe {
    Miss,
    Hit { handle: CacheHandle, resume: BlockNumber },
    /// Only empty granules up to `resume`.
    EmptyRun { resume: BlockNumber },
}

impl Probe {
    fn release(self, cache: &dyn CacheProvider) {
        if let Probe::Hit { handle, .. } = self {
            cache.release(handle);
        }
    }
}

/// Hands out non-overlapping block ranges of one relation to cooperating
/// workers. The shared cursor lock is held for arithmetic only; cache probes
/// and the sync service are called with the lock released.
#[derive(Clone)]
pub struct BlockRangeAllocator {
    shared: Arc<SharedScanState>,
    relation: RelationId,
    nblocks: BlockNumber,
    desc: Arc<TupleDesc>,
    segment_blocks: u32,
    granule_blocks: u32,
    cache: Option<Arc<dyn CacheProvider>>,
    sync: Option<Arc<dyn ScanSyncService>>,
}

impl BlockRangeAllocator {
    pub fn new(
        shared: Arc<SharedScanState>,
        relation: RelationId,
        nblocks: BlockNumber,
        desc: Arc<TupleDesc>,
        config: &Configuration,
        cache: Option<Arc<dyn CacheProvider>>,
        sync: Option<Arc<dyn ScanSyncService>>,
    ) -> Self {
        BlockRangeAllocator {
            shared,
            relation,
            nblocks,
            desc,
            segment_blocks: config.segment_blocks(),
            granule_blocks: config.cache_granule_blocks(),
            cache: cache.filter(|_| config.enable_cache()),
            sync: sync.filter(|_| config.syncscan()),
        }
    }

    pub fn nblocks(&self) -> BlockNumber {
        self.nblocks
    }

    /// Assigns up to `requested` blocks. When `cache_attrs` is given and a
    /// granule boundary falls inside the assigned range, the granule may be
    /// served from the columnar cache instead. Returns `None` once every
    /// block of the relation has been handed out, or once any worker of the
    /// scan has failed.
    pub fn next_range(&self, requested: u32, cache_attrs: Option<&AttrSet>) -> Result<Option<BlockRange>> {
        loop {
            if self.shared.is_aborted() {
                trace!("relation {}: scan aborted, no more ranges", self.relation);
                return Ok(None);
            }
            let mut cursor = self.shared.lock();

            if !cursor.is_initialized() {
                match &self.sync {
                    None => Self::initialize(&mut cursor, 0, self.nblocks),
                    Some(sync) => {
                        let generation = cursor.generation;
                        drop(cursor);
                        let location = sync.get_location(self.relation, self.nblocks);
                        cursor = self.shared.lock();
                        if !cursor.is_initialized() && cursor.generation == generation {
                            Self::initialize(&mut cursor, location, self.nblocks);
                        } else if !cursor.is_initialized() {
                            trace!("scan was reset while fetching the sync location; retrying");
                            continue;
                        }
                    }
                }
            }

            let start_block = cursor.start_block.unwrap_or(0);

            if cursor.remaining == 0 {
                let report = !cursor.finished;
                cursor.finished = true;
                drop(cursor);
                if report {
                    debug!("relation {}: all {} blocks assigned", self.relation, self.nblocks);
                    if let Some(sync) = &self.sync {
                        sync.report_location(self.relation, start_block);
                    }
                }
                return Ok(None);
            }

            let current = cursor.current_block;
            let nr = self.clamp(&cursor, requested);

            // blocks past this point were handed out already or do not exist
            let limit = if current < start_block { start_block } else { self.nblocks };
            let aligned = current.next_multiple_of(self.granule_blocks);
            let probe_cache = match (&self.cache, cache_attrs) {
                (Some(_), Some(attrs)) => {
                    !attrs.is_empty() && aligned < current + nr && self.granule_fits(aligned, limit)
                }
                _ => false,
            };

            if !probe_cache {
                self.advance(&mut cursor, current + nr);
                drop(cursor);
                return Ok(Some(self.raw_range(current, nr)));
            }

            let generation = cursor.generation;
            drop(cursor);

            let (Some(cache), Some(attrs)) = (&self.cache, cache_attrs) else {
                continue;
            };
            let probe = self.probe(cache.as_ref(), attrs, aligned, limit);

            let mut cursor = self.shared.lock();
            if cursor.generation != generation {
                // someone moved the cursor while we were probing
                probe.release(cache.as_ref());
                continue;
            }

            match probe {
                Probe::Miss => {
                    // stop at the next boundary so the following granule gets probed too
                    let nr = nr.min(aligned + self.granule_blocks - current);
                    self.advance(&mut cursor, current + nr);
                    drop(cursor);
                    return Ok(Some(self.raw_range(current, nr)));
                }
                Probe::EmptyRun { resume } => {
                    self.advance(&mut cursor, resume);
                    drop(cursor);
                    trace!("skipped empty cached granules {}..{}", aligned, resume);
                    if aligned > current {
                        return Ok(Some(self.raw_range(current, aligned - current)));
                    }
                }
                Probe::Hit { handle, resume } => {
                    self.advance(&mut cursor, resume);
                    drop(cursor);

                    if let Some(sync) = &self.sync {
                        sync.report_location(self.relation, current);
                    }

                    let loaded = cache.load(&handle, &self.desc, attrs);
                    let base = handle.base;
                    cache.release(handle);
                    let chunk = loaded?;

                    self.shared.stats().add_ccache(1);
                    debug!(
                        "relation {}: granule {} served from cache ({} rows), {} raw blocks before it",
                        self.relation,
                        base,
                        chunk.nitems(),
                        aligned - current
                    );
                    return Ok(Some(BlockRange {
                        start: current,
                        nblocks: aligned - current,
                        cached: Some(chunk),
                    }));
                }
            }
        }
    }

    fn initialize(cursor: &mut BlockRangeCursor, start: BlockNumber, nblocks: BlockNumber) {
        let start = if start < nblocks { start } else { 0 };
        cursor.start_block = Some(start);
        cursor.current_block = start;
        cursor.remaining = nblocks;
        cursor.finished = false;
        cursor.generation += 1;
        debug!("scan starts at block {} of {}", start, nblocks);
    }

    /// Limits a request so it crosses neither a segment boundary, the end of
    /// the relation nor the start block.
    fn clamp(&self, cursor: &BlockRangeCursor, requested: u32) -> u32 {
        let current = cursor.current_block;
        let mut nr = requested.max(1).min(cursor.remaining);
        nr = nr.min(self.segment_blocks - current % self.segment_blocks);
        nr = nr.min(self.nblocks - current);
        if let Some(start) = cursor.start_block {
            if current < start {
                nr = nr.min(start - current);
            }
        }
        nr
    }

    /// A granule is usable only if it ends at or before `limit`: the start
    /// block once the cursor wrapped, the end of the relation otherwise.
    fn granule_fits(&self, at: BlockNumber, limit: BlockNumber) -> bool {
        at as u64 + self.granule_blocks as u64 <= limit as u64
    }

    fn probe(&self, cache: &dyn CacheProvider, attrs: &AttrSet, aligned: BlockNumber, limit: BlockNumber) -> Probe {
        let mut at = aligned;
        loop {
            let handle = if self.granule_fits(at, limit) {
                cache.lookup(self.relation, at)
            } else {
                None
            };
            // a granule built without some needed column is read raw
            let handle = match handle {
                Some(handle) if !cache.covers(&handle, attrs) => {
                    trace!("granule {} lacks requested attributes", at);
                    cache.release(handle);
                    None
                }
                other => other,
            };

            match handle {
                None if at == aligned => return Probe::Miss,
                None => return Probe::EmptyRun { resume: at },
                Some(handle) if cache.is_empty(&handle) => {
                    cache.release(handle);
                    at += self.granule_blocks;
                }
                Some(handle) => {
                    return Probe::Hit {
                        handle,
                        resume: at + self.granule_blocks,
                    };
                }
            }
        }
    }

    /// Moves the cursor to `to`, wrapping at the end of the relation.
    fn advance(&self, cursor: &mut BlockRangeCursor, to: BlockNumber) {
        let consumed = to - cursor.current_block;
        cursor.remaining -= consumed;
        cursor.current_block = if to >= self.nblocks { 0 } else { to };
        cursor.generation += 1;
    }

    fn raw_range(&self, start: BlockNumber, nblocks: u32) -> BlockRange {
        if let Some(sync) = &self.sync {
            sync.report_location(self.relation, start);
        }
        trace!("relation {}: blocks {}..{}", self.relation, start, start + nblocks);
        BlockRange {
            start,
            nblocks,
            cached: None,
        }
    }
}
