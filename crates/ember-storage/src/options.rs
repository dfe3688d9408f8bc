use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
pub const SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Fetch granularity. Power of two, multiple of the sector size.
    pub chunk_size: u32,
    /// Chunks fetched past the end of each request without a waiter.
    pub read_ahead_chunks: u32,
    pub max_concurrent_fetches: usize,
    /// Total tries per chunk, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_ahead_chunks: 1,
            max_concurrent_fetches: 4,
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl StorageOptions {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn chunk_size_is_valid(chunk_size: u32) -> bool {
        chunk_size.is_power_of_two() && chunk_size % SECTOR_SIZE == 0
    }
}

/// Expected SHA-256 of every chunk of one image, in chunk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkManifest {
    pub sha256: Vec<[u8; 32]>,
}

impl ChunkManifest {
    pub fn sha256_for_chunk(&self, chunk_index: u64) -> Option<[u8; 32]> {
        let idx: usize = chunk_index.try_into().ok()?;
        self.sha256.get(idx).copied()
    }
}
