use std::{
    fmt::Display,
    io::{self, Cursor, Write},
    ops::Range,
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{BLCKSZ, memory_pool::{BufferPool, PooledBuffer}};

use super::{
    error::{Result, ScanError},
    page::Page,
    schema::TupleDesc,
    storage_providers::traits::BlockStorage,
    support_types::{BlockNumber, ItemPointer, RelationId},
    tuple::{Datum, ScanTuple, decode_tuple, encode_tuple, encoded_tuple_len},
};

/// Per-item header in a ROW chunk: ctid block, ctid line, tuple length.
pub const ROW_ITEM_HEADER: usize = 4 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkFormat {
    Row,
    Block,
    Column,
}

impl Display for ChunkFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkFormat::Row => f.write_str("ROW"),
            ChunkFormat::Block => f.write_str("BLOCK"),
            ChunkFormat::Column => f.write_str("COLUMN"),
        }
    }
}

#[derive(Debug, Clone)]
struct RowBody {
    offsets: Vec<u32>,
    data: PooledBuffer,
    nrooms: usize,
    length: usize,
}

#[derive(Debug, Clone)]
struct BlockBody {
    block_nums: Vec<BlockNumber>,
    pages: Vec<Option<Page>>,
    nitems: usize,
    nblocks_uncached: usize,
    nrows_per_block: u32,
    sealed: bool,
}

impl BlockBody {
    fn resident(&self) -> usize {
        self.nitems - self.nblocks_uncached
    }

    // Resident slots grow from the front, uncached slots from the back.
    // `pages.len()` equals nrooms until sealed and nitems afterwards, so the
    // same arithmetic holds in both states.
    fn uncached_range(&self) -> Range<usize> {
        self.pages.len() - self.nblocks_uncached..self.pages.len()
    }

    fn physical_slot(&self, index: usize) -> usize {
        let resident = self.resident();
        if index < resident {
            index
        } else {
            self.uncached_range().start + (index - resident)
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnBody {
    ctids: Vec<ItemPointer>,
    columns: Vec<Option<Vec<Datum>>>,
}

#[derive(Debug, Clone)]
enum ChunkBody {
    Row(RowBody),
    Block(BlockBody),
    Column(ColumnBody),
}

/// A batch of tuples in one of three physical layouts.
///
/// The format is fixed at construction. Byte storage of ROW chunks is
/// borrowed from a [`BufferPool`] and given back when the chunk drops.
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    desc: Arc<TupleDesc>,
    relation: RelationId,
    body: ChunkBody,
}

impl ChunkBuffer {
    pub fn new_row(
        pool: &Arc<BufferPool>,
        desc: Arc<TupleDesc>,
        relation: RelationId,
        nrooms: usize,
        length: usize,
    ) -> Self {
        ChunkBuffer {
            desc,
            relation,
            body: ChunkBody::Row(RowBody {
                offsets: Vec::with_capacity(nrooms.min(4096)),
                data: pool.acquire(length),
                nrooms,
                length,
            }),
        }
    }

    pub fn new_block(
        desc: Arc<TupleDesc>,
        relation: RelationId,
        nrooms: usize,
        nrows_per_block: u32,
    ) -> Self {
        ChunkBuffer {
            desc,
            relation,
            body: ChunkBody::Block(BlockBody {
                block_nums: vec![0; nrooms],
                pages: vec![None; nrooms],
                nitems: 0,
                nblocks_uncached: 0,
                nrows_per_block,
                sealed: false,
            }),
        }
    }

    /// Builds a COLUMN chunk. `columns` holds one entry per attribute of
    /// `desc`; attributes that were not materialized are `None`.
    pub fn new_column(
        desc: Arc<TupleDesc>,
        relation: RelationId,
        ctids: Vec<ItemPointer>,
        columns: Vec<Option<Vec<Datum>>>,
    ) -> Result<Self> {
        if columns.len() != desc.natts() {
            return Err(ScanError::InvalidData(format!(
                "column chunk has {} columns, descriptor has {}",
                columns.len(),
                desc.natts()
            )));
        }
        if let Some(bad) = columns.iter().flatten().find(|c| c.len() != ctids.len()) {
            return Err(ScanError::InvalidData(format!(
                "column length {} does not match {} rows",
                bad.len(),
                ctids.len()
            )));
        }

        Ok(ChunkBuffer {
            desc,
            relation,
            body: ChunkBody::Column(ColumnBody { ctids, columns }),
        })
    }

    pub fn format(&self) -> ChunkFormat {
        match self.body {
            ChunkBody::Row(_) => ChunkFormat::Row,
            ChunkBody::Block(_) => ChunkFormat::Block,
            ChunkBody::Column(_) => ChunkFormat::Column,
        }
    }

    #[inline]
    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    #[inline]
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// Tuples for ROW and COLUMN, pages for BLOCK.
    pub fn nitems(&self) -> usize {
        match &self.body {
            ChunkBody::Row(row) => row.offsets.len(),
            ChunkBody::Block(block) => block.nitems,
            ChunkBody::Column(column) => column.ctids.len(),
        }
    }

    pub fn nrooms(&self) -> usize {
        match &self.body {
            ChunkBody::Row(row) => row.nrooms,
            ChunkBody::Block(block) => block.pages.len(),
            ChunkBody::Column(column) => column.ctids.len(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.nitems() >= self.nrooms()
    }

    /// Byte footprint of the buffer when staged on a device.
    pub fn length(&self) -> usize {
        match &self.body {
            ChunkBody::Row(row) => row.length + 4 * row.nrooms,
            ChunkBody::Block(block) => block.pages.len() * (4 + BLCKSZ),
            ChunkBody::Column(column) => {
                let values: usize = column
                    .columns
                    .iter()
                    .flatten()
                    .flat_map(|c| c.iter())
                    .map(Datum::encoded_size)
                    .sum();
                values + column.ctids.len() * 6
            }
        }
    }

    /// Whether the chunk may hold at least one tuple. Pages not yet resident
    /// on the host count as non-empty.
    pub fn has_tuples(&self) -> bool {
        match &self.body {
            ChunkBody::Block(block) => {
                block.nblocks_uncached > 0
                    || block.pages[..block.resident()]
                        .iter()
                        .flatten()
                        .any(|p| p.ntuples() > 0)
            }
            _ => self.nitems() > 0,
        }
    }

    /// Number of tuples that can be read on the host right now.
    pub fn resident_tuples(&self) -> usize {
        match &self.body {
            ChunkBody::Block(block) => block.pages.iter().flatten().map(Page::ntuples).sum(),
            _ => self.nitems(),
        }
    }

    // ROW

    /// Appends an already encoded tuple. Returns `false` when either the slot
    /// capacity or the byte budget is exhausted.
    pub fn append_row_tuple(&mut self, ctid: ItemPointer, tuple: &[u8]) -> Result<bool> {
        let format = self.format();
        let ChunkBody::Row(row) = &mut self.body else {
            return Err(wrong_format(ChunkFormat::Row, format));
        };

        if row.offsets.len() >= row.nrooms
            || row.data.len() + ROW_ITEM_HEADER + tuple.len() > row.length
        {
            return Ok(false);
        }

        let offset = row.data.len();
        row.data.write_u32::<LittleEndian>(ctid.block)?;
        row.data.write_u16::<LittleEndian>(ctid.line)?;
        row.data.write_u32::<LittleEndian>(tuple.len() as u32)?;
        row.data.write_all(tuple)?;
        row.offsets.push(offset as u32);

        Ok(true)
    }

    pub fn append_row_values(&mut self, ctid: ItemPointer, values: &[Datum]) -> Result<bool> {
        let mut tuple = Vec::with_capacity(encoded_tuple_len(values));
        encode_tuple(&self.desc, values, &mut tuple)?;
        self.append_row_tuple(ctid, &tuple)
    }

    /// Bytes of the ROW data area in use.
    pub fn row_usage(&self) -> usize {
        match &self.body {
            ChunkBody::Row(row) => row.data.len(),
            _ => 0,
        }
    }

    pub fn row_item(&self, index: usize) -> Result<Option<(ItemPointer, &[u8])>> {
        let ChunkBody::Row(row) = &self.body else {
            return Err(wrong_format(ChunkFormat::Row, self.format()));
        };
        let Some(&offset) = row.offsets.get(index) else {
            return Ok(None);
        };

        let mut cursor = Cursor::new(&row.data[offset as usize..]);
        let block = cursor.read_u32::<LittleEndian>()?;
        let line = cursor.read_u16::<LittleEndian>()?;
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let start = offset as usize + ROW_ITEM_HEADER;
        let bytes = row.data.get(start..start + len).ok_or_else(|| {
            ScanError::InvalidData(format!("row item {} overruns the chunk", index))
        })?;

        Ok(Some((ItemPointer::new(block, line), bytes)))
    }

    pub fn row_tuple(&self, index: usize) -> Result<Option<ScanTuple>> {
        match self.row_item(index)? {
            Some((ctid, bytes)) => Ok(Some(ScanTuple::new(ctid, decode_tuple(&self.desc, bytes)?))),
            None => Ok(None),
        }
    }

    // BLOCK

    pub fn nblocks_uncached(&self) -> usize {
        match &self.body {
            ChunkBody::Block(block) => block.nblocks_uncached,
            _ => 0,
        }
    }

    pub fn nrows_per_block(&self) -> u32 {
        match &self.body {
            ChunkBody::Block(block) => block.nrows_per_block,
            _ => 1,
        }
    }

    /// Stores a host-resident page in the next front slot.
    pub fn append_page(&mut self, block_num: BlockNumber, page: Page) -> Result<bool> {
        let block = self.block_body_mut()?;
        if block.sealed || block.nitems >= block.pages.len() {
            return Ok(false);
        }
        let slot = block.resident();
        block.block_nums[slot] = block_num;
        block.pages[slot] = Some(page);
        block.nitems += 1;
        Ok(true)
    }

    /// Reserves a back slot for a page that will be transferred straight from
    /// storage to the device.
    pub fn reserve_uncached(&mut self, block_num: BlockNumber) -> Result<bool> {
        let block = self.block_body_mut()?;
        if block.sealed || block.nitems >= block.pages.len() {
            return Ok(false);
        }
        let slot = block.pages.len() - 1 - block.nblocks_uncached;
        block.block_nums[slot] = block_num;
        block.pages[slot] = None;
        block.nblocks_uncached += 1;
        block.nitems += 1;
        Ok(true)
    }

    /// Closes the gap between resident and uncached slots so that the first
    /// `nitems` slots form one dense run, then drops the unused tail.
    ///
    /// Resident slots occupy `[0, r)` and uncached slots `[nrooms - u, nrooms)`
    /// with `r + u <= nrooms`, so the destination `r` never lies past the
    /// source and a left rotation of `[r, nrooms)` moves the uncached run
    /// into place without overwriting a resident page.
    pub fn seal(&mut self) {
        let ChunkBody::Block(block) = &mut self.body else {
            return;
        };
        if block.sealed {
            return;
        }

        let nrooms = block.pages.len();
        let dst = block.resident();
        let src = nrooms - block.nblocks_uncached;
        if block.nblocks_uncached > 0 && dst < src {
            block.block_nums[dst..].rotate_left(src - dst);
            block.pages[dst..].rotate_left(src - dst);
        }
        block.block_nums.truncate(block.nitems);
        block.pages.truncate(block.nitems);
        block.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        match &self.body {
            ChunkBody::Block(block) => block.sealed,
            _ => true,
        }
    }

    /// Physical slots still waiting for a page.
    pub fn uncached_range(&self) -> Range<usize> {
        match &self.body {
            ChunkBody::Block(block) => block.uncached_range(),
            _ => 0..0,
        }
    }

    pub fn block_num(&self, slot: usize) -> Option<BlockNumber> {
        match &self.body {
            ChunkBody::Block(block) if slot < block.pages.len() => Some(block.block_nums[slot]),
            _ => None,
        }
    }

    pub fn page(&self, slot: usize) -> Option<&Page> {
        match &self.body {
            ChunkBody::Block(block) => block.pages.get(slot).and_then(Option::as_ref),
            _ => None,
        }
    }

    /// Block numbers of every occupied slot, in physical slot order.
    pub fn block_nums(&self) -> Vec<BlockNumber> {
        match &self.body {
            ChunkBody::Block(block) => (0..block.nitems)
                .map(|i| block.block_nums[block.physical_slot(i)])
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn uncached_block_nums(&self) -> Vec<BlockNumber> {
        match &self.body {
            ChunkBody::Block(block) => block.block_nums[block.uncached_range()].to_vec(),
            _ => Vec::new(),
        }
    }

    /// Puts a page into a slot that was reserved for direct transfer.
    pub fn install_page(&mut self, slot: usize, page: Page) -> Result<()> {
        let block = self.block_body_mut()?;
        match block.pages.get_mut(slot) {
            Some(entry) => {
                *entry = Some(page);
                Ok(())
            }
            None => Err(ScanError::InvalidData(format!("page slot {} out of range", slot))),
        }
    }

    /// Declares every page host-resident. Fails if a reserved slot is still empty.
    pub fn mark_resident(&mut self) -> Result<()> {
        let block = self.block_body_mut()?;
        if let Some(slot) = block.uncached_range().find(|&slot| block.pages[slot].is_none()) {
            return Err(ScanError::InvalidData(format!(
                "page slot {} (block {}) is not resident",
                slot, block.block_nums[slot]
            )));
        }
        block.nblocks_uncached = 0;
        Ok(())
    }

    /// Reads every not-yet-resident page from storage into host memory.
    pub fn fill_uncached(&mut self, storage: &dyn BlockStorage) -> Result<()> {
        for slot in self.uncached_range() {
            if self.page(slot).is_some() {
                continue;
            }
            let block_num = self.block_num(slot).unwrap_or_default();
            let page = storage.read_block(block_num)?;
            self.install_page(slot, page)?;
        }
        self.mark_resident()
    }

    // COLUMN

    pub fn column(&self, attno: usize) -> Option<&[Datum]> {
        match &self.body {
            ChunkBody::Column(column) => column.columns.get(attno)?.as_deref(),
            _ => None,
        }
    }

    pub fn ctids(&self) -> &[ItemPointer] {
        match &self.body {
            ChunkBody::Column(column) => &column.ctids,
            _ => &[],
        }
    }

    fn block_body_mut(&mut self) -> Result<&mut BlockBody> {
        let format = self.format();
        match &mut self.body {
            ChunkBody::Block(block) => Ok(block),
            _ => Err(wrong_format(ChunkFormat::Block, format)),
        }
    }
}

fn wrong_format(expected: ChunkFormat, actual: ChunkFormat) -> ScanError {
    ScanError::InvalidData(format!("expected a {} chunk, got {}", expected, actual))
}

/// Reads tuples out of a chunk in its native format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkCursor {
    index: usize,
    line: usize,
}

impl ChunkCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn next_tuple(&mut self, chunk: &ChunkBuffer) -> Result<Option<ScanTuple>> {
        match &chunk.body {
            ChunkBody::Row(_) => {
                let tuple = chunk.row_tuple(self.index)?;
                if tuple.is_some() {
                    self.index += 1;
                }
                Ok(tuple)
            }
            ChunkBody::Block(block) => loop {
                if self.index >= block.nitems {
                    return Ok(None);
                }
                let slot = block.physical_slot(self.index);
                let page = block.pages[slot].as_ref().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("block {} is not resident on the host", block.block_nums[slot]),
                    )
                })?;

                if let Some(bytes) = page.tuple(self.line) {
                    let ctid = ItemPointer::new(block.block_nums[slot], self.line as u16);
                    self.line += 1;
                    let values = decode_tuple(&chunk.desc, bytes)?;
                    return Ok(Some(ScanTuple::new(ctid, values)));
                }

                self.index += 1;
                self.line = 0;
            },
            ChunkBody::Column(column) => {
                let Some(&ctid) = column.ctids.get(self.index) else {
                    return Ok(None);
                };
                let values = column
                    .columns
                    .iter()
                    .map(|c| c.as_ref().map_or(Datum::Null, |c| c[self.index].clone()))
                    .collect();
                self.index += 1;
                Ok(Some(ScanTuple::new(ctid, values)))
            }
        }
    }
}

/// Collects every tuple of a chunk. Convenience for tests and kernels.
pub fn read_all_tuples(chunk: &ChunkBuffer) -> Result<Vec<ScanTuple>> {
    let mut cursor = ChunkCursor::new();
    let mut tuples = Vec::new();
    while let Some(tuple) = cursor.next_tuple(chunk)? {
        tuples.push(tuple);
    }
    Ok(tuples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{db_type::DbType, schema::Attribute};

    fn desc() -> Arc<TupleDesc> {
        Arc::new(TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("name", DbType::STRING),
        ]))
    }

    fn page_with(desc: &TupleDesc, ids: &[i32]) -> Page {
        let mut page = Page::new();
        for id in ids {
            let mut buf = Vec::new();
            encode_tuple(desc, &[Datum::I32(*id), Datum::Text(format!("n{}", id))], &mut buf).unwrap();
            assert!(page.add_tuple(&buf));
        }
        page.seal();
        page
    }

    #[test]
    fn test_row_chunk_respects_slots_and_budget() {
        let pool = BufferPool::new();
        let mut chunk = ChunkBuffer::new_row(&pool, desc(), 1, 2, 1024);

        let values = [Datum::I32(1), Datum::Text("a".into())];
        assert!(chunk.append_row_values(ItemPointer::new(0, 0), &values).unwrap());
        assert!(chunk.append_row_values(ItemPointer::new(0, 1), &values).unwrap());
        assert!(!chunk.append_row_values(ItemPointer::new(0, 2), &values).unwrap());
        assert_eq!(chunk.nitems(), 2);
        assert!(chunk.is_full());

        let mut tight = ChunkBuffer::new_row(&pool, desc(), 1, 100, ROW_ITEM_HEADER + 4);
        assert!(!tight.append_row_values(ItemPointer::new(0, 0), &values).unwrap());

        let tuple = chunk.row_tuple(1).unwrap().unwrap();
        assert_eq!(tuple.ctid, ItemPointer::new(0, 1));
        assert_eq!(tuple.values, values.to_vec());
    }

    #[test]
    fn test_block_append_wrong_format() {
        let pool = BufferPool::new();
        let mut chunk = ChunkBuffer::new_row(&pool, desc(), 1, 2, 1024);
        assert!(chunk.append_page(0, Page::new()).is_err());
    }

    #[test]
    fn test_block_seal_compacts_uncached_run() {
        let desc = desc();
        let mut chunk = ChunkBuffer::new_block(desc.clone(), 1, 6, 4);

        assert!(chunk.append_page(10, page_with(&desc, &[1])).unwrap());
        assert!(chunk.reserve_uncached(11).unwrap());
        assert!(chunk.append_page(12, page_with(&desc, &[3])).unwrap());
        assert!(chunk.reserve_uncached(13).unwrap());
        assert_eq!(chunk.uncached_range(), 4..6);

        chunk.seal();

        assert_eq!(chunk.nrooms(), 4);
        assert_eq!(chunk.uncached_range(), 2..4);
        assert_eq!(chunk.block_num(0), Some(10));
        assert_eq!(chunk.block_num(1), Some(12));
        assert!(chunk.page(0).is_some() && chunk.page(1).is_some());
        assert!(chunk.page(2).is_none() && chunk.page(3).is_none());
        let mut uncached = chunk.uncached_block_nums();
        uncached.sort();
        assert_eq!(uncached, vec![11, 13]);
    }

    #[test]
    fn test_block_seal_all_occupancies() {
        let desc = desc();
        for nrooms in 1..8usize {
            for resident in 0..=nrooms {
                for uncached in 0..=(nrooms - resident) {
                    let mut chunk = ChunkBuffer::new_block(desc.clone(), 1, nrooms, 1);
                    for b in 0..resident {
                        chunk.append_page(b as u32, Page::new()).unwrap();
                    }
                    for b in 0..uncached {
                        chunk.reserve_uncached((100 + b) as u32).unwrap();
                    }
                    chunk.seal();

                    for slot in 0..resident {
                        assert!(chunk.page(slot).is_some());
                        assert!(chunk.block_num(slot).unwrap() < 100);
                    }
                    for slot in chunk.uncached_range() {
                        assert!(chunk.page(slot).is_none());
                        assert!(chunk.block_num(slot).unwrap() >= 100);
                    }
                    assert_eq!(chunk.nrooms(), resident + uncached);
                }
            }
        }
    }

    #[test]
    fn test_block_cursor_and_fill() {
        let desc = desc();
        let mut chunk = ChunkBuffer::new_block(desc.clone(), 1, 3, 4);
        chunk.append_page(0, page_with(&desc, &[1, 2])).unwrap();
        chunk.reserve_uncached(1).unwrap();
        chunk.seal();
        assert!(chunk.has_tuples());

        assert!(read_all_tuples(&chunk).is_err());

        chunk.install_page(1, page_with(&desc, &[3])).unwrap();
        chunk.mark_resident().unwrap();
        assert_eq!(chunk.nblocks_uncached(), 0);

        let tuples = read_all_tuples(&chunk).unwrap();
        assert_eq!(tuples.len(), 3);
        assert_eq!(tuples[2].ctid, ItemPointer::new(1, 0));
        assert_eq!(tuples[2].values[0], Datum::I32(3));
    }

    #[test]
    fn test_block_of_empty_pages_has_no_tuples() {
        let mut chunk = ChunkBuffer::new_block(desc(), 1, 2, 4);
        chunk.append_page(0, Page::new()).unwrap();
        chunk.seal();
        assert!(!chunk.has_tuples());
    }

    #[test]
    fn test_column_chunk() {
        let desc = desc();
        let ctids = vec![ItemPointer::new(4, 0), ItemPointer::new(4, 1)];
        let chunk = ChunkBuffer::new_column(
            desc.clone(),
            1,
            ctids,
            vec![Some(vec![Datum::I32(1), Datum::I32(2)]), None],
        )
        .unwrap();

        let tuples = read_all_tuples(&chunk).unwrap();
        assert_eq!(tuples[1].values, vec![Datum::I32(2), Datum::Null]);

        let bad = ChunkBuffer::new_column(desc, 1, vec![ItemPointer::new(0, 0)], vec![None]);
        assert!(bad.is_err());
    }
}
