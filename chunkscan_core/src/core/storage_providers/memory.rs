use std::{
    io,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::core::{
    page::Page,
    schema::TupleDesc,
    support_types::{BlockNumber, RelationId},
    tuple::{Datum, encode_tuple, encoded_tuple_len},
};

use super::traits::{BlockStorage, IOResult};

/// Relation held entirely in memory as sealed page images.
pub struct MemoryStorageProvider {
    relation: RelationId,
    desc: Arc<TupleDesc>,
    pages: RwLock<Vec<Vec<u8>>>,
    buffered: Vec<AtomicBool>,
    direct_transfer: bool,
    reads: AtomicU64,
    transferred: AtomicU64,
}

impl MemoryStorageProvider {
    /// One inner vector of rows per block. Empty blocks are allowed.
    pub fn from_blocks(
        relation: RelationId,
        desc: Arc<TupleDesc>,
        blocks: Vec<Vec<Vec<Datum>>>,
    ) -> IOResult<Self> {
        let mut pages = Vec::with_capacity(blocks.len());

        for (block_num, rows) in blocks.into_iter().enumerate() {
            let mut page = Page::new();
            for values in rows {
                let mut tuple = Vec::with_capacity(encoded_tuple_len(&values));
                encode_tuple(&desc, &values, &mut tuple)?;
                if !page.add_tuple(&tuple) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("block {} overflows the page", block_num),
                    ));
                }
            }
            page.seal();
            pages.push(page.as_bytes().to_vec());
        }

        let buffered = (0..pages.len()).map(|_| AtomicBool::new(true)).collect();

        Ok(MemoryStorageProvider {
            relation,
            desc,
            pages: RwLock::new(pages),
            buffered,
            direct_transfer: true,
            reads: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
        })
    }

    /// Packs `rows` into blocks of at most `tuples_per_block` tuples.
    pub fn from_rows(
        relation: RelationId,
        desc: Arc<TupleDesc>,
        tuples_per_block: usize,
        rows: Vec<Vec<Datum>>,
    ) -> IOResult<Self> {
        let tuples_per_block = tuples_per_block.max(1);
        let mut blocks = Vec::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            blocks.push(rows.by_ref().take(tuples_per_block).collect());
        }
        Self::from_blocks(relation, desc, blocks)
    }

    pub fn with_direct_transfer(mut self, enabled: bool) -> Self {
        self.direct_transfer = enabled;
        self
    }

    pub fn set_buffered(&self, block: BlockNumber, buffered: bool) {
        if let Some(flag) = self.buffered.get(block as usize) {
            flag.store(buffered, Ordering::Relaxed);
        }
    }

    pub fn set_all_buffered(&self, buffered: bool) {
        self.buffered.iter().for_each(|f| f.store(buffered, Ordering::Relaxed));
    }

    /// Damages the stored image of `block` so its checksum no longer matches.
    pub fn corrupt_block(&self, block: BlockNumber) {
        if let Ok(mut pages) = self.pages.write() {
            if let Some(image) = pages.get_mut(block as usize) {
                if let Some(last) = image.last_mut() {
                    *last ^= 0xFF;
                }
            }
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn load(&self, block: BlockNumber) -> IOResult<Page> {
        let pages = self
            .pages
            .read()
            .map_err(|_| io::Error::other("page store lock poisoned"))?;
        let image = pages.get(block as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block {} beyond end of relation {}", block, self.relation),
            )
        })?;
        Page::from_bytes(image.clone())
    }
}

impl BlockStorage for MemoryStorageProvider {
    fn relation_id(&self) -> RelationId {
        self.relation
    }

    fn tuple_desc(&self) -> Arc<TupleDesc> {
        self.desc.clone()
    }

    fn nblocks(&self) -> BlockNumber {
        self.buffered.len() as BlockNumber
    }

    fn read_block(&self, block: BlockNumber) -> IOResult<Page> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.load(block)
    }

    fn is_buffered(&self, block: BlockNumber) -> bool {
        self.buffered
            .get(block as usize)
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    fn supports_direct_transfer(&self) -> bool {
        self.direct_transfer
    }

    fn transfer(&self, dest: &mut [Option<Page>], blocks: &[BlockNumber]) -> IOResult<()> {
        if dest.len() != blocks.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} destination slots for {} blocks", dest.len(), blocks.len()),
            ));
        }
        for (slot, block) in dest.iter_mut().zip(blocks) {
            *slot = Some(self.load(*block)?);
            self.transferred.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
