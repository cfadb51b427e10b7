use std::{io, ops::Range, sync::Arc};

use crate::core::{
    page::Page,
    schema::TupleDesc,
    support_types::{BlockNumber, RelationId},
};

pub type IOResult<T> = std::result::Result<T, io::Error>;

/// Block-level access to one relation.
pub trait BlockStorage: Send + Sync {
    fn relation_id(&self) -> RelationId;

    fn tuple_desc(&self) -> Arc<TupleDesc>;

    fn nblocks(&self) -> BlockNumber;

    /// Reads one page into host memory, verifying its checksum.
    fn read_block(&self, block: BlockNumber) -> IOResult<Page>;

    /// Whether the block already sits in the host buffer cache. Such blocks
    /// are cheaper to copy from the host than to transfer directly.
    fn is_buffered(&self, block: BlockNumber) -> bool;

    fn supports_direct_transfer(&self) -> bool;

    /// Storage-to-device transfer of `blocks` into `dest`, one slot per block.
    fn transfer(&self, dest: &mut [Option<Page>], blocks: &[BlockNumber]) -> IOResult<()>;
}

/// Walks the blocks of a range in order.
pub struct PageScanCursor<'a> {
    storage: &'a dyn BlockStorage,
    range: Range<BlockNumber>,
}

impl<'a> PageScanCursor<'a> {
    pub fn new(storage: &'a dyn BlockStorage, start: BlockNumber, nblocks: u32) -> Self {
        PageScanCursor {
            storage,
            range: start..start.saturating_add(nblocks),
        }
    }

    /// Next block number without reading it.
    pub fn peek(&self) -> Option<BlockNumber> {
        (!self.range.is_empty()).then_some(self.range.start)
    }

    /// Skips the next block. Used when the block goes through direct transfer.
    pub fn skip(&mut self) -> Option<BlockNumber> {
        self.range.next()
    }

    pub fn next_block(&mut self) -> Option<IOResult<(BlockNumber, Page)>> {
        let block = self.range.next()?;
        Some(self.storage.read_block(block).map(|page| (block, page)))
    }

    pub fn remaining(&self) -> u32 {
        self.range.end - self.range.start
    }
}
