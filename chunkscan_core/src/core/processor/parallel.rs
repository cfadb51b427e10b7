use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info};
use tokio::{sync::mpsc, task};

use crate::{
    core::{
        error::{Result, ScanError},
        stats::StatsSnapshot,
        tuple::ScanTuple,
    },
    memory_pool::BufferPool,
    renderers::explain::ExplainOutput,
};

use super::{
    scan::{ScanBuilder, ScanCounters},
    shared_state::SharedScanState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: usize,
    pub counters: ScanCounters,
}

#[derive(Debug)]
pub struct ParallelScanOutput {
    pub tuples: Vec<ScanTuple>,
    pub per_worker: Vec<WorkerSummary>,
    pub stats: StatsSnapshot,
}

/// Runs one scan with several workers that pull block ranges from a shared
/// cursor. There is no coordinator thread: every worker builds, executes and
/// drains its own tasks and streams tuples to a single collector.
pub struct ParallelScan {
    builder: ScanBuilder,
    workers: usize,
    shared: Arc<SharedScanState>,
    runs: u64,
    totals: ScanCounters,
    /// Statistics of every finished run, for EXPLAIN.
    accumulated: StatsSnapshot,
    direct_transfer: bool,
    detached: Option<StatsSnapshot>,
}

impl ParallelScan {
    pub fn new(builder: ScanBuilder, workers: usize) -> Self {
        let shared = Arc::new(SharedScanState::new());
        let builder = builder.shared_state(shared.clone()).pool(BufferPool::new());
        ParallelScan {
            builder,
            workers: workers.max(1),
            shared,
            runs: 0,
            totals: ScanCounters::default(),
            accumulated: StatsSnapshot::default(),
            direct_transfer: false,
            detached: None,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn shared_state(&self) -> &Arc<SharedScanState> {
        &self.shared
    }

    /// Scans the whole relation once. A second call rescans it from the
    /// beginning.
    pub async fn run(&mut self) -> Result<ParallelScanOutput> {
        if self.runs > 0 {
            self.rescan();
        }

        // build every worker first so configuration errors surface before any I/O
        let scans = (0..self.workers)
            .map(|_| self.builder.build())
            .collect::<Result<Vec<_>>>()?;
        self.direct_transfer = scans.iter().any(|s| s.direct_transfer());
        self.runs += 1;

        info!("parallel scan with {} workers", self.workers);

        let (tx, mut rx) = mpsc::unbounded_channel::<ScanTuple>();

        let collector = tokio::spawn(async move {
            let mut tuples = Vec::with_capacity(1024);
            while let Some(tuple) = rx.recv().await {
                tuples.push(tuple);
            }
            tuples
        });

        let handles = scans
            .into_iter()
            .enumerate()
            .map(|(worker, mut scan)| {
                let tx = tx.clone();
                task::spawn_blocking(move || -> Result<WorkerSummary> {
                    while let Some(tuple) = scan.next_tuple()? {
                        if tx.send(tuple).is_err() {
                            // collector went away
                            break;
                        }
                    }
                    let counters = scan.counters();
                    debug!(
                        "worker {}: {} tasks, {} tuples read, {} returned",
                        worker, counters.tasks, counters.tuples_read, counters.tuples_returned
                    );
                    Ok(WorkerSummary { worker, counters })
                })
            })
            .collect::<Vec<_>>();

        // the collector ends once every worker dropped its sender
        drop(tx);

        let (results, tuples) = tokio::join!(join_all(handles), collector);
        let tuples = tuples.map_err(|e| ScanError::Worker(e.to_string()))?;

        let mut per_worker = Vec::with_capacity(results.len());
        for result in results {
            let summary = result.map_err(|e| ScanError::Worker(e.to_string()))??;
            per_worker.push(summary);
        }

        let stats = self.shutdown();
        self.accumulated.accumulate(stats);
        for summary in &per_worker {
            self.totals.tuples_read += summary.counters.tuples_read;
            self.totals.tuples_returned += summary.counters.tuples_returned;
            self.totals.tasks += summary.counters.tasks;
            self.totals.fallback_tasks += summary.counters.fallback_tasks;
        }
        self.totals.nloops = self.runs;

        info!(
            "parallel scan done: {} tuples, {} filtered, {} cached chunks",
            tuples.len(),
            stats.nitems_filtered,
            stats.ccache_count
        );

        Ok(ParallelScanOutput {
            tuples,
            per_worker,
            stats,
        })
    }

    /// Resets the shared cursor and counters. Only called between runs, when
    /// no worker is alive.
    pub fn rescan(&mut self) {
        self.shared.reset();
        self.detached = None;
    }

    fn shutdown(&mut self) -> StatsSnapshot {
        let snapshot = self.shared.stats().snapshot();
        self.detached = Some(snapshot);
        snapshot
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.detached.unwrap_or_else(|| self.shared.stats().snapshot())
    }

    /// Counters summed over all workers and runs.
    pub fn counters(&self) -> ScanCounters {
        self.totals
    }

    pub fn explain(&self) -> ExplainOutput {
        ExplainOutput::new(self.builder.program(), self.accumulated, self.totals, self.direct_transfer)
    }
}
