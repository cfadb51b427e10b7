use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every worker of one scan. Only ever bumped with
/// atomic adds; `reset` runs at scan (re)start when no worker is active.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    nitems_filtered: AtomicU64,
    ccache_count: AtomicU64,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_filtered(&self, n: u64) {
        if n > 0 {
            self.nitems_filtered.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_ccache(&self, n: u64) {
        self.ccache_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn nitems_filtered(&self) -> u64 {
        self.nitems_filtered.load(Ordering::Relaxed)
    }

    pub fn ccache_count(&self) -> u64 {
        self.ccache_count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.nitems_filtered.store(0, Ordering::Relaxed);
        self.ccache_count.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nitems_filtered: self.nitems_filtered(),
            ccache_count: self.ccache_count(),
        }
    }
}

/// Plain copy of [`RuntimeStats`], kept after the shared region goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nitems_filtered: u64,
    pub ccache_count: u64,
}

impl StatsSnapshot {
    /// Adds the counters of another pass.
    pub fn accumulate(&mut self, other: StatsSnapshot) {
        self.nitems_filtered += other.nitems_filtered;
        self.ccache_count += other.ccache_count;
    }
}
