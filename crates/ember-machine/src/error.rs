use ember_mem::MemoryFault;
use ember_snapshot::SnapshotError;
use ember_storage::DiskIoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MachineError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("guest memory of {size} bytes is below the 1 MiB minimum")]
    MemoryTooSmall { size: usize },

    #[error("VGA memory of {size} bytes cannot back the 128 KiB legacy window")]
    VgaMemoryTooSmall { size: usize },

    #[error("chunk size {0} is not a power of two multiple of 512")]
    InvalidChunkSize(u32),

    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("max_concurrent_fetches must be at least 1")]
    ZeroConcurrency,

    #[error("instructions_per_step must be at least 1")]
    ZeroInstructionBudget,

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Disk(#[from] DiskIoError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Memory(#[from] MemoryFault),

    #[error("firmware image {name} rejected: {reason}")]
    Firmware { name: String, reason: &'static str },
}
