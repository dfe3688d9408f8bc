use thiserror::Error;

use crate::ImageHandle;

/// Failure surfaced to whoever asked for disk bytes. Cloned to every coalesced waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiskIoError {
    #[error("fetching {file_name} failed after {attempts} attempts: {last}")]
    Exhausted {
        file_name: String,
        attempts: u32,
        last: String,
    },

    #[error("fetching {file_name} failed: {message}")]
    Transport { file_name: String, message: String },

    #[error("integrity check failed for chunk {chunk_index}")]
    Integrity { chunk_index: u64 },

    #[error("out of bounds access: offset {offset} len {len} size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("bytes at offset {offset} are not resident")]
    NotResident { offset: u64 },

    #[error("unknown disk image {0:?}")]
    UnknownImage(ImageHandle),

    #[error("operation cancelled")]
    Cancelled,
}

/// Error reported by a [`crate::RangeProvider`]. `retryable` decides whether the adapter backs
/// off and tries again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let retryable = !matches!(
            err.kind(),
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::UnexpectedEof
        );
        Self {
            message: err.to_string(),
            retryable,
        }
    }
}
