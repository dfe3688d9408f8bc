use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    /// The blob was written by a newer format revision than this build understands.
    #[error("incompatible snapshot version {found} (newest supported is {supported})")]
    IncompatibleVersion { found: u16, supported: u16 },

    #[error("invalid endianness tag {0}")]
    InvalidEndianness(u8),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("snapshot integrity check failed")]
    IntegrityMismatch,

    #[error("guest RAM size mismatch (expected {expected} bytes, found {found} bytes)")]
    RamLenMismatch { expected: u64, found: u64 },

    #[error("video memory size mismatch (expected {expected} bytes, found {found} bytes)")]
    VramLenMismatch { expected: u64, found: u64 },

    /// An incremental snapshot was offered to a machine that is not at its parent snapshot.
    #[error("snapshot parent mismatch (machine is at {expected:?}, snapshot expects {found:?})")]
    ParentMismatch {
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// A device is mid-operation in a way that cannot be serialized; quiesce and retry.
    #[error("machine is not at a quiesce point: {device} is busy")]
    UnsafeState { device: &'static str },

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl SnapshotError {
    /// Structural failures of a blob (as opposed to version or machine-state problems).
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            SnapshotError::Io(_)
                | SnapshotError::InvalidMagic
                | SnapshotError::InvalidEndianness(_)
                | SnapshotError::Corrupt(_)
                | SnapshotError::IntegrityMismatch
                | SnapshotError::Lz4Decompress(_)
                | SnapshotError::Utf8(_)
        )
    }
}
