use std::sync::Arc;

use log::{debug, trace};

use crate::{
    BLCKSZ,
    configuration::Configuration,
    core::{
        chunk::{ChunkBuffer, ChunkFormat, ROW_ITEM_HEADER},
        error::{Result, ScanError},
        page::Page,
        program::ScanProgram,
        storage_providers::traits::{BlockStorage, PageScanCursor},
        support_types::{BlockNumber, ItemPointer},
    },
    memory_pool::BufferPool,
};

use super::range_allocator::BlockRangeAllocator;

#[derive(Debug)]
pub enum ChunkPoll {
    Ready(ChunkBuffer),
    /// Blocks were consumed but held no tuples. Not the end of the scan.
    Empty,
    EndOfScan,
}

/// Turns block ranges into chunks for one worker.
///
/// A raw chunk under construction survives across calls: when a range
/// comes back with a cached COLUMN chunk, that chunk is returned at once and
/// the raw chunk, together with any raw blocks still pending, is resumed on
/// the next call.
pub struct ChunkProducer {
    allocator: BlockRangeAllocator,
    storage: Arc<dyn BlockStorage>,
    program: Arc<ScanProgram>,
    pool: Arc<BufferPool>,
    chunk_size: usize,
    blocks_per_request: u32,
    direct_transfer: bool,
    suspended: Option<ChunkBuffer>,
    /// Raw blocks assigned to this worker and not read yet.
    pending: Option<(BlockNumber, u32)>,
    /// First pending block, already read, that did not fit the last chunk.
    held: Option<(BlockNumber, Page)>,
    exhausted: bool,
}

impl ChunkProducer {
    pub fn new(
        allocator: BlockRangeAllocator,
        storage: Arc<dyn BlockStorage>,
        program: Arc<ScanProgram>,
        pool: Arc<BufferPool>,
        config: &Configuration,
    ) -> Self {
        let direct_transfer = config.direct_transfer()
            && storage.supports_direct_transfer()
            && storage.nblocks() >= config.direct_transfer_threshold_blocks();

        debug!(
            "relation {}: {} chunks of {} bytes, direct transfer {}",
            storage.relation_id(),
            if direct_transfer { ChunkFormat::Block } else { ChunkFormat::Row },
            config.chunk_size(),
            if direct_transfer { "on" } else { "off" }
        );

        ChunkProducer {
            allocator,
            storage,
            program,
            pool,
            chunk_size: config.chunk_size(),
            blocks_per_request: config.blocks_per_request(),
            direct_transfer,
            suspended: None,
            pending: None,
            held: None,
            exhausted: false,
        }
    }

    pub fn direct_transfer(&self) -> bool {
        self.direct_transfer
    }

    pub fn nblocks_per_chunk(&self) -> usize {
        (self.chunk_size / BLCKSZ).max(1)
    }

    /// Drops any partial state so the next call starts a new pass.
    pub fn rewind(&mut self) {
        self.suspended = None;
        self.pending = None;
        self.held = None;
        self.exhausted = false;
    }

    pub fn produce_next_chunk(&mut self) -> Result<ChunkPoll> {
        loop {
            if let Some((cblock, numblocks)) = self.pending.take() {
                let consumed = self.load_blocks(cblock, numblocks)?;
                if consumed < numblocks {
                    // chunk full; keep the rest for the next call
                    self.pending = Some((cblock + consumed, numblocks - consumed));
                    return Ok(self.complete());
                }
                if self.suspended.as_ref().is_some_and(ChunkBuffer::is_full) {
                    return Ok(self.complete());
                }
            }

            if self.exhausted {
                return Ok(match self.suspended {
                    Some(_) => self.complete(),
                    None => ChunkPoll::EndOfScan,
                });
            }

            let requested = self.request_size();
            let attrs = Some(self.program.referenced_attrs());
            match self.allocator.next_range(requested, attrs)? {
                None => {
                    self.exhausted = true;
                }
                Some(range) => {
                    if range.nblocks > 0 {
                        self.pending = Some((range.start, range.nblocks));
                    }
                    if let Some(cached) = range.cached {
                        trace!(
                            "cached chunk of {} rows; suspending raw chunk with {} items",
                            cached.nitems(),
                            self.suspended.as_ref().map_or(0, ChunkBuffer::nitems)
                        );
                        return Ok(if cached.has_tuples() {
                            ChunkPoll::Ready(cached)
                        } else {
                            ChunkPoll::Empty
                        });
                    }
                }
            }
        }
    }

    fn request_size(&self) -> u32 {
        if !self.direct_transfer {
            return self.blocks_per_request;
        }
        let room = match &self.suspended {
            Some(chunk) => chunk.nrooms() - chunk.nitems(),
            None => self.nblocks_per_chunk(),
        };
        room.max(1) as u32
    }

    /// Hands out the chunk under construction, or `Empty` if it holds no tuples.
    fn complete(&mut self) -> ChunkPoll {
        match self.suspended.take() {
            Some(mut chunk) => {
                chunk.seal();
                if chunk.has_tuples() {
                    debug!("chunk ready: {} with {} items", chunk.format(), chunk.nitems());
                    ChunkPoll::Ready(chunk)
                } else {
                    ChunkPoll::Empty
                }
            }
            None => ChunkPoll::Empty,
        }
    }

    fn new_chunk(&self) -> ChunkBuffer {
        let desc = self.program.scan_desc().clone();
        let relation = self.storage.relation_id();
        if self.direct_transfer {
            ChunkBuffer::new_block(desc, relation, self.nblocks_per_chunk(), self.program.nrows_per_block())
        } else {
            let nrooms = self.chunk_size / (ROW_ITEM_HEADER + desc.header_size());
            ChunkBuffer::new_row(&self.pool, desc, relation, nrooms, self.chunk_size)
        }
    }

    /// Loads blocks `cblock..cblock + numblocks` into the current chunk and
    /// returns how many were consumed before it filled up.
    fn load_blocks(&mut self, cblock: BlockNumber, numblocks: u32) -> Result<u32> {
        let storage = self.storage.clone();
        let mut pages = PageScanCursor::new(storage.as_ref(), cblock, numblocks);
        let mut consumed = 0;

        while let Some(block) = pages.peek() {
            if self.suspended.is_none() {
                self.suspended = Some(self.new_chunk());
            }

            let fits = if self.direct_transfer && !storage.is_buffered(block) {
                pages.skip();
                self.reserve_block(block)?
            } else if self.direct_transfer {
                // a full BLOCK chunk is known without reading the page
                if self.suspended.as_ref().is_some_and(ChunkBuffer::is_full) {
                    false
                } else {
                    match pages.next_block() {
                        Some(read) => {
                            let (block, page) = read?;
                            self.add_page(block, page)?
                        }
                        None => break,
                    }
                }
            } else {
                let page = match self.held.take() {
                    Some((held, page)) if held == block => {
                        pages.skip();
                        page
                    }
                    _ => match pages.next_block() {
                        Some(read) => read?.1,
                        None => break,
                    },
                };
                let fits = self.add_block_rows(block, &page)?;
                if !fits {
                    self.held = Some((block, page));
                }
                fits
            };

            if !fits {
                if self.suspended.as_ref().is_none_or(|c| c.nitems() == 0) {
                    return Err(ScanError::ChunkTooSmall(format!(
                        "block {} does not fit into an empty chunk of {} bytes",
                        block, self.chunk_size
                    )));
                }
                return Ok(consumed);
            }
            consumed += 1;
        }
        Ok(consumed)
    }

    fn reserve_block(&mut self, block: BlockNumber) -> Result<bool> {
        match self.suspended.as_mut() {
            Some(chunk) => chunk.reserve_uncached(block),
            None => Ok(false),
        }
    }

    fn add_page(&mut self, block: BlockNumber, page: Page) -> Result<bool> {
        match self.suspended.as_mut() {
            Some(chunk) => chunk.append_page(block, page),
            None => Ok(false),
        }
    }

    fn add_block_rows(&mut self, block: BlockNumber, page: &Page) -> Result<bool> {
        let Some(chunk) = self.suspended.as_mut() else {
            return Ok(false);
        };

        let needed: usize = page.tuples().map(|t| ROW_ITEM_HEADER + t.len()).sum();
        if chunk.nitems() + page.ntuples() > chunk.nrooms()
            || chunk.row_usage() + needed > self.chunk_size
        {
            return Ok(false);
        }

        for (line, tuple) in page.tuples().enumerate() {
            if !chunk.append_row_tuple(ItemPointer::new(block, line as u16), tuple)? {
                return Err(ScanError::InvalidData(format!(
                    "block {} overflowed a chunk that had room for it",
                    block
                )));
            }
        }
        Ok(true)
    }
}
