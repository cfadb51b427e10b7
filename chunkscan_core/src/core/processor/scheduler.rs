use std::sync::Arc;

use log::trace;

use crate::{
    configuration::Configuration,
    core::{
        chunk::{ChunkBuffer, ChunkFormat, ROW_ITEM_HEADER},
        program::ScanProgram,
        tuple::Datum,
    },
    memory_pool::BufferPool,
};

use super::task::{ResultIndex, ScanTask};

/// Wraps chunks into self-contained tasks with their own output buffers.
pub struct TaskScheduler {
    program: Arc<ScanProgram>,
    params: Vec<Datum>,
    headroom: f64,
    pool: Arc<BufferPool>,
    next_id: u64,
}

impl TaskScheduler {
    pub fn new(program: Arc<ScanProgram>, params: Vec<Datum>, config: &Configuration, pool: Arc<BufferPool>) -> Self {
        TaskScheduler {
            program,
            params,
            headroom: config.projection_headroom(),
            pool,
            next_id: 1,
        }
    }

    /// Upper bound of tuples the chunk can produce. BLOCK chunks are
    /// estimated from the program's rows-per-block figure.
    pub fn estimate_ntuples(&self, chunk: &ChunkBuffer) -> usize {
        match chunk.format() {
            ChunkFormat::Block => chunk.nitems() * self.program.nrows_per_block() as usize,
            _ => chunk.nitems(),
        }
    }

    /// Bytes reserved for a destination ROW buffer of `ntuples` rows.
    pub fn output_length(&self, ntuples: usize) -> usize {
        let per_tuple =
            self.program.proj_tuple_sz() as usize + self.program.proj_extra_sz() as usize + ROW_ITEM_HEADER;
        (self.headroom * (per_tuple * ntuples) as f64).ceil() as usize
    }

    pub fn build_task(&mut self, chunk: ChunkBuffer, with_direct_transfer: bool) -> ScanTask {
        let ntuples = self.estimate_ntuples(&chunk);
        let relation = chunk.relation();
        let by_index = chunk.format() == ChunkFormat::Row && !self.program.has_projection();

        let mut task = ScanTask::new(self.next_id, chunk, self.params.clone());
        self.next_id += 1;
        task.with_direct_transfer = with_direct_transfer;
        task.output_capacity = ntuples;

        if by_index {
            task.results = Some(ResultIndex::new(ntuples));
        } else {
            let length = self.output_length(ntuples);
            task.dst = Some(ChunkBuffer::new_row(
                &self.pool,
                self.program.proj_desc().clone(),
                relation,
                ntuples,
                length,
            ));
        }

        trace!(
            "task {}: {} source, {} output for {} tuples",
            task.id,
            task.src.format(),
            if by_index { "index" } else { "row buffer" },
            ntuples
        );
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        db_type::DbType,
        expression::Expr,
        schema::{Attribute, TupleDesc},
        support_types::ItemPointer,
    };

    fn desc() -> Arc<TupleDesc> {
        Arc::new(TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("name", DbType::STRING).with_width(12),
        ]))
    }

    fn row_chunk(pool: &Arc<BufferPool>, n: i32) -> ChunkBuffer {
        let mut chunk = ChunkBuffer::new_row(pool, desc(), 7, 64, 4096);
        for i in 0..n {
            let values = [Datum::I32(i), Datum::Text(format!("row{}", i))];
            assert!(chunk.append_row_values(ItemPointer::new(0, i as u16), &values).unwrap());
        }
        chunk
    }

    #[test]
    fn test_row_without_projection_uses_result_index() {
        let pool = BufferPool::new();
        let program = Arc::new(ScanProgram::new(desc(), None, None, &[]).unwrap());
        let mut scheduler = TaskScheduler::new(program, vec![], &Configuration::default(), pool.clone());

        let task = scheduler.build_task(row_chunk(&pool, 10), false);
        assert!(task.dst.is_none());
        assert_eq!(task.results.as_ref().map(|r| r.nrooms), Some(10));
        assert_eq!(task.output_capacity, 10);

        let next = scheduler.build_task(row_chunk(&pool, 1), false);
        assert_eq!(next.id, task.id + 1);
    }

    #[test]
    fn test_projection_allocates_destination_with_headroom() {
        let pool = BufferPool::new();
        let projection = vec![("id".to_string(), Expr::col(0))];
        let program = Arc::new(ScanProgram::new(desc(), None, Some(projection), &[]).unwrap());
        let config = Configuration {
            projection_headroom: Some(1.5),
            ..Default::default()
        };
        let mut scheduler = TaskScheduler::new(program.clone(), vec![Datum::I32(3)], &config, pool.clone());

        let task = scheduler.build_task(row_chunk(&pool, 8), false);
        assert!(task.results.is_none());
        let dst = task.dst.as_ref().unwrap();
        assert_eq!(dst.nrooms(), 8);
        assert_eq!(dst.desc().natts(), 1);

        // header 3 + width 4 + item header 10, times 8 tuples, times 1.5
        assert_eq!(program.proj_tuple_sz(), 7);
        assert_eq!(scheduler.output_length(8), 204);
        assert_eq!(task.params, vec![Datum::I32(3)]);
    }

    #[test]
    fn test_block_chunks_estimate_from_rows_per_block() {
        let pool = BufferPool::new();
        let program = Arc::new(ScanProgram::new(desc(), None, None, &[]).unwrap().with_nrows_per_block(5));
        let mut scheduler = TaskScheduler::new(program, vec![], &Configuration::default(), pool);

        let mut chunk = ChunkBuffer::new_block(desc(), 7, 4, 5);
        chunk.reserve_uncached(0).unwrap();
        chunk.reserve_uncached(1).unwrap();
        chunk.seal();

        let task = scheduler.build_task(chunk, true);
        assert!(task.with_direct_transfer);
        assert_eq!(task.output_capacity, 10);
        assert_eq!(task.dst.as_ref().map(ChunkBuffer::nrooms), Some(10));
    }
}
