use crate::{
    DEFAULT_BLOCKS_PER_REQUEST, DEFAULT_CACHE_GRANULE_BLOCKS, DEFAULT_CHUNK_SIZE,
    DEFAULT_CONCURRENT_WORKERS, DEFAULT_PROJECTION_HEADROOM, DEFAULT_SEGMENT_BLOCKS,
    core::error::{Result, ScanError},
};

/// Scan settings. Unset fields fall back to the crate defaults.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    /// Byte budget of one ROW chunk; also bounds BLOCK chunk page slots.
    pub chunk_size: Option<usize>,
    pub blocks_per_request: Option<u32>,
    pub cpu_fallback: Option<bool>,
    pub direct_transfer: Option<bool>,
    pub direct_transfer_threshold_blocks: Option<u32>,
    pub enable_cache: Option<bool>,
    pub cache_granule_blocks: Option<u32>,
    pub segment_blocks: Option<u32>,
    pub projection_headroom: Option<f64>,
    pub syncscan: Option<bool>,
    pub concurrent_workers: Option<usize>,
}

impl Configuration {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn blocks_per_request(&self) -> u32 {
        self.blocks_per_request.unwrap_or(DEFAULT_BLOCKS_PER_REQUEST)
    }

    pub fn cpu_fallback(&self) -> bool {
        self.cpu_fallback.unwrap_or(true)
    }

    pub fn direct_transfer(&self) -> bool {
        self.direct_transfer.unwrap_or(false)
    }

    pub fn direct_transfer_threshold_blocks(&self) -> u32 {
        self.direct_transfer_threshold_blocks.unwrap_or(0)
    }

    pub fn enable_cache(&self) -> bool {
        self.enable_cache.unwrap_or(true)
    }

    pub fn cache_granule_blocks(&self) -> u32 {
        self.cache_granule_blocks.unwrap_or(DEFAULT_CACHE_GRANULE_BLOCKS)
    }

    pub fn segment_blocks(&self) -> u32 {
        self.segment_blocks.unwrap_or(DEFAULT_SEGMENT_BLOCKS)
    }

    pub fn projection_headroom(&self) -> f64 {
        self.projection_headroom.unwrap_or(DEFAULT_PROJECTION_HEADROOM)
    }

    pub fn syncscan(&self) -> bool {
        self.syncscan.unwrap_or(false)
    }

    pub fn concurrent_workers(&self) -> usize {
        self.concurrent_workers.unwrap_or(DEFAULT_CONCURRENT_WORKERS)
    }

    pub fn validate(&self) -> Result<()> {
        let granule = self.cache_granule_blocks();
        if granule == 0 || !granule.is_power_of_two() {
            return Err(ScanError::InvalidConfiguration(format!(
                "cache_granule_blocks must be a power of two, got {}",
                granule
            )));
        }
        if self.segment_blocks() == 0 {
            return Err(ScanError::InvalidConfiguration("segment_blocks must be positive".into()));
        }
        if self.blocks_per_request() == 0 {
            return Err(ScanError::InvalidConfiguration("blocks_per_request must be positive".into()));
        }
        if self.chunk_size() < crate::BLCKSZ {
            return Err(ScanError::InvalidConfiguration(format!(
                "chunk_size must hold at least one block ({} bytes), got {}",
                crate::BLCKSZ,
                self.chunk_size()
            )));
        }
        let headroom = self.projection_headroom();
        if headroom.is_nan() || headroom < 1.0 {
            return Err(ScanError::InvalidConfiguration(format!(
                "projection_headroom must be at least 1.0, got {}",
                self.projection_headroom()
            )));
        }
        if self.concurrent_workers() == 0 {
            return Err(ScanError::InvalidConfiguration("concurrent_workers must be positive".into()));
        }
        Ok(())
    }
}
