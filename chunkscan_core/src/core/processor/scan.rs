use std::sync::Arc;

use log::{debug, info};

use crate::{
    accelerator::Accelerator,
    cache::{CacheProvider, scan_sync::ScanSyncService},
    configuration::Configuration,
    core::{
        chunk::ChunkFormat,
        error::Result,
        program::ScanProgram,
        stats::StatsSnapshot,
        storage_providers::traits::BlockStorage,
        tuple::{Datum, ScanTuple},
    },
    memory_pool::BufferPool,
    renderers::explain::ExplainOutput,
};

use super::{
    accelerated::AcceleratedExecutor,
    chunk_producer::{ChunkPoll, ChunkProducer},
    fallback::FallbackExecutor,
    range_allocator::BlockRangeAllocator,
    scheduler::TaskScheduler,
    shared_state::SharedScanState,
    task::{ScanTask, TaskState},
};

/// Per-scan counters that stay local to one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCounters {
    pub tuples_read: u64,
    pub tuples_returned: u64,
    pub tasks: u64,
    pub fallback_tasks: u64,
    pub nloops: u64,
}

/// Everything needed to start a scan. Cloned once per parallel worker; all
/// clones that share a [`SharedScanState`] cooperate on one relation.
#[derive(Clone)]
pub struct ScanBuilder {
    storage: Arc<dyn BlockStorage>,
    accelerator: Arc<dyn Accelerator>,
    program: Arc<ScanProgram>,
    params: Vec<Datum>,
    config: Configuration,
    cache: Option<Arc<dyn CacheProvider>>,
    sync: Option<Arc<dyn ScanSyncService>>,
    shared: Option<Arc<SharedScanState>>,
    pool: Option<Arc<BufferPool>>,
}

impl ScanBuilder {
    pub fn new(storage: Arc<dyn BlockStorage>, accelerator: Arc<dyn Accelerator>, program: Arc<ScanProgram>) -> Self {
        ScanBuilder {
            storage,
            accelerator,
            program,
            params: Vec::new(),
            config: Configuration::default(),
            cache: None,
            sync: None,
            shared: None,
            pool: None,
        }
    }

    pub fn params(mut self, params: Vec<Datum>) -> Self {
        self.params = params;
        self
    }

    pub fn configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn scan_sync(mut self, sync: Arc<dyn ScanSyncService>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn shared_state(mut self, shared: Arc<SharedScanState>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn program(&self) -> &Arc<ScanProgram> {
        &self.program
    }

    pub fn build(&self) -> Result<AcceleratedScan> {
        self.config.validate()?;

        let shared = self.shared.clone().unwrap_or_default();
        let pool = self.pool.clone().unwrap_or_else(BufferPool::new);

        let allocator = BlockRangeAllocator::new(
            shared.clone(),
            self.storage.relation_id(),
            self.storage.nblocks(),
            self.storage.tuple_desc(),
            &self.config,
            self.cache.clone(),
            self.sync.clone(),
        );
        let producer = ChunkProducer::new(
            allocator,
            self.storage.clone(),
            self.program.clone(),
            pool.clone(),
            &self.config,
        );
        let scheduler = TaskScheduler::new(self.program.clone(), self.params.clone(), &self.config, pool);
        let executor = AcceleratedExecutor::new(
            self.accelerator.clone(),
            self.storage.clone(),
            self.program.clone(),
            shared.clone(),
            self.config.cpu_fallback(),
        );
        let fallback = FallbackExecutor::new(self.program.clone(), shared.clone());

        info!(
            "scan of relation {} ({} blocks) on {}",
            self.storage.relation_id(),
            self.storage.nblocks(),
            self.accelerator.name()
        );

        Ok(AcceleratedScan {
            program: self.program.clone(),
            params: self.params.clone(),
            shared,
            producer,
            scheduler,
            executor,
            fallback,
            current: None,
            finished: false,
            detached: None,
            previous: StatsSnapshot::default(),
            counters: ScanCounters {
                nloops: 1,
                ..Default::default()
            },
        })
    }
}

/// One worker's view of an accelerated scan. Pulls chunks, runs each as a
/// task and hands out result tuples one at a time.
pub struct AcceleratedScan {
    program: Arc<ScanProgram>,
    params: Vec<Datum>,
    shared: Arc<SharedScanState>,
    producer: ChunkProducer,
    scheduler: TaskScheduler,
    executor: AcceleratedExecutor,
    fallback: FallbackExecutor,
    current: Option<ScanTask>,
    finished: bool,
    detached: Option<StatsSnapshot>,
    /// Statistics of passes before the last rescan.
    previous: StatsSnapshot,
    counters: ScanCounters,
}

impl AcceleratedScan {
    /// Next result tuple, or `None` at the end of the scan. A failure here
    /// aborts every worker sharing this scan's state.
    pub fn next_tuple(&mut self) -> Result<Option<ScanTuple>> {
        let next = self.fetch_next();
        if next.is_err() {
            self.shared.abort();
        }
        next
    }

    fn fetch_next(&mut self) -> Result<Option<ScanTuple>> {
        loop {
            if let Some(task) = self.current.as_mut() {
                if let Some(tuple) = task.next_result_tuple(&self.fallback)? {
                    self.counters.tuples_returned += 1;
                    return Ok(Some(tuple));
                }
                self.counters.tuples_read += task.nitems_in;
                self.current = None;
            }

            if self.finished {
                return Ok(None);
            }
            if self.shared.is_aborted() {
                debug!("worker stops: another worker of the scan failed");
                self.finished = true;
                return Ok(None);
            }

            match self.producer.produce_next_chunk()? {
                ChunkPoll::Ready(chunk) => {
                    let direct = chunk.format() == ChunkFormat::Block && self.producer.direct_transfer();
                    let mut task = self.scheduler.build_task(chunk, direct);
                    self.counters.tasks += 1;
                    if self.executor.execute(&mut task)? == TaskState::AccelFailedRecoverable {
                        self.counters.fallback_tasks += 1;
                    }
                    self.current = Some(task);
                }
                ChunkPoll::Empty => continue,
                ChunkPoll::EndOfScan => {
                    debug!(
                        "worker done: {} tasks, {} tuples read, {} returned",
                        self.counters.tasks, self.counters.tuples_read, self.counters.tuples_returned
                    );
                    self.finished = true;
                }
            }
        }
    }

    /// Restarts the scan from scratch. Tasks run to completion inside
    /// `next_tuple`, so dropping the current one leaves nothing in flight.
    pub fn rescan(&mut self) {
        self.current = None;
        self.previous.accumulate(self.stats());
        self.shared.reset();
        self.producer.rewind();
        self.finished = false;
        self.detached = None;
        self.counters.nloops += 1;
    }

    /// Copies the shared statistics out so they stay readable after the
    /// shared region is gone.
    pub fn shutdown(&mut self) -> StatsSnapshot {
        let snapshot = self.shared.stats().snapshot();
        self.detached = Some(snapshot);
        snapshot
    }

    pub fn recheck(&self, tuple: &ScanTuple) -> Result<Option<ScanTuple>> {
        self.fallback.recheck(tuple, &self.params)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.detached.unwrap_or_else(|| self.shared.stats().snapshot())
    }

    pub fn counters(&self) -> ScanCounters {
        self.counters
    }

    pub fn shared_state(&self) -> &Arc<SharedScanState> {
        &self.shared
    }

    pub fn direct_transfer(&self) -> bool {
        self.producer.direct_transfer()
    }

    pub fn explain(&self) -> ExplainOutput {
        let mut stats = self.previous;
        stats.accumulate(self.stats());
        ExplainOutput::new(&self.program, stats, self.counters, self.direct_transfer())
    }
}
