//! Asynchronous, chunked access to remote disk images.
//!
//! Images are split into fixed-size chunks that are fetched on demand through a
//! [`RangeProvider`], coalesced per chunk, retried with exponential backoff and exposed only
//! once fully resident.

mod adapter;
mod error;
mod options;
mod provider;
mod range_set;

pub use adapter::{
    BlockDeviceAdapter, ChunkRequest, ChunkStatus, ChunkTableState, CompletedChunk, ImageHandle,
    ImageInfo, StorageTelemetry, StorageTelemetrySnapshot,
};
pub use error::{DiskIoError, TransportError};
pub use options::{ChunkManifest, StorageOptions, DEFAULT_CHUNK_SIZE, SECTOR_SIZE};
pub use provider::{
    FetchProgress, FileRangeProvider, MemoryRangeProvider, ProviderFuture, RangeProvider,
};
pub use range_set::{ByteRange, RangeSet};
