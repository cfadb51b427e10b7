use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use crate::core::{stats::RuntimeStats, support_types::BlockNumber};

/// Position of a scan inside its relation. Guarded by the mutex in
/// [`SharedScanState`]; only plain numbers live here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRangeCursor {
    /// `None` until the first caller picks the start block.
    pub start_block: Option<BlockNumber>,
    pub current_block: BlockNumber,
    /// Blocks not handed out yet.
    pub remaining: u32,
    /// The terminal position report has been sent.
    pub finished: bool,
    /// Bumped on every cursor move and on reset. Lets a caller that dropped
    /// the lock detect that someone else moved the cursor meanwhile.
    pub generation: u64,
}

impl BlockRangeCursor {
    pub fn is_initialized(&self) -> bool {
        self.start_block.is_some()
    }
}

/// State shared by every worker of one scan.
#[derive(Debug, Default)]
pub struct SharedScanState {
    cursor: Mutex<BlockRangeCursor>,
    stats: RuntimeStats,
    /// Set by the first worker that fails; the others stop taking work.
    aborted: AtomicBool,
}

impl SharedScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockRangeCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn cursor_snapshot(&self) -> BlockRangeCursor {
        self.lock().clone()
    }

    /// Rewinds the cursor and zeroes the counters. Callers must have drained
    /// every in-flight task of the previous pass.
    pub fn reset(&self) {
        let mut cursor = self.lock();
        let generation = cursor.generation + 1;
        *cursor = BlockRangeCursor {
            generation,
            ..Default::default()
        };
        drop(cursor);
        self.stats.reset();
        self.aborted.store(false, Ordering::Release);
    }
}
