use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

use crate::core::support_types::{BlockNumber, RelationId};

/// Shares scan positions between concurrent scans of the same relation so a
/// new scan can start where another one currently is.
pub trait ScanSyncService: Send + Sync {
    /// Suggested start block, always below `nblocks`.
    fn get_location(&self, relation: RelationId, nblocks: BlockNumber) -> BlockNumber;

    fn report_location(&self, relation: RelationId, block: BlockNumber);
}

#[derive(Default)]
pub struct MemoryScanSync {
    locations: DashMap<RelationId, BlockNumber, ahash::RandomState>,
    lookups: AtomicU64,
    history: Mutex<Vec<(RelationId, BlockNumber)>>,
}

impl MemoryScanSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_location(&self, relation: RelationId, block: BlockNumber) {
        self.locations.insert(relation, block);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Every reported position, oldest first.
    pub fn reports(&self) -> Vec<(RelationId, BlockNumber)> {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ScanSyncService for MemoryScanSync {
    fn get_location(&self, relation: RelationId, nblocks: BlockNumber) -> BlockNumber {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        match self.locations.get(&relation) {
            Some(block) if *block < nblocks => *block,
            _ => 0,
        }
    }

    fn report_location(&self, relation: RelationId, block: BlockNumber) {
        self.locations.insert(relation, block);
        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push((relation, block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_clamped_to_relation() {
        let sync = MemoryScanSync::new();
        assert_eq!(sync.get_location(1, 10), 0);
        sync.report_location(1, 7);
        assert_eq!(sync.get_location(1, 10), 7);
        assert_eq!(sync.get_location(1, 5), 0);
        assert_eq!(sync.reports(), vec![(1, 7)]);
        assert_eq!(sync.lookups(), 3);
    }
}
