use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use ember_events::{EventBus, MachineEvent};
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DiskIoError, TransportError};
use crate::options::{ChunkManifest, StorageOptions};
use crate::provider::{FetchProgress, RangeProvider};
use crate::range_set::{ByteRange, RangeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Resident,
    Pending,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub handle: ImageHandle,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
}

/// Residency of one image, as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTableState {
    pub image: ImageHandle,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub resident: RangeSet,
}

/// Outcome of one chunk fetch, reported when the completion is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChunk {
    pub image: ImageHandle,
    pub chunk_index: u64,
    pub result: Result<(), DiskIoError>,
}

#[derive(Default)]
pub struct StorageTelemetry {
    fetches_issued: AtomicU64,
    bytes_downloaded: AtomicU64,
    coalesced_requests: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageTelemetrySnapshot {
    pub fetches_issued: u64,
    pub bytes_downloaded: u64,
    pub coalesced_requests: u64,
    pub retries: u64,
}

impl StorageTelemetry {
    pub fn snapshot(&self) -> StorageTelemetrySnapshot {
        StorageTelemetrySnapshot {
            fetches_issued: self.fetches_issued.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Handle to bytes requested through [`BlockDeviceAdapter::request_chunk`].
///
/// It resolves when the adapter's owner applies the covering completions, so polling it never
/// advances a fetch by itself.
#[derive(Debug)]
pub struct ChunkRequest {
    rx: oneshot::Receiver<Result<Vec<u8>, DiskIoError>>,
}

impl ChunkRequest {
    /// Non-blocking check used from device ticks.
    pub fn try_take(&mut self) -> Option<Result<Vec<u8>, DiskIoError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DiskIoError::Cancelled)),
        }
    }
}

impl Future for ChunkRequest {
    type Output = Result<Vec<u8>, DiskIoError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DiskIoError::Cancelled)))
    }
}

struct Image {
    file_name: String,
    source: String,
    total_size: u64,
    chunk_size: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
    resident: RangeSet,
    pending: BTreeSet<u64>,
    manifest: Option<Arc<ChunkManifest>>,
}

impl Image {
    fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    fn chunk_bounds(&self, chunk_index: u64) -> ByteRange {
        let start = chunk_index * self.chunk_size;
        ByteRange::new(start, (start + self.chunk_size).min(self.total_size))
    }

    fn chunk_status(&self, chunk_index: u64) -> ChunkStatus {
        if self.chunks.contains_key(&chunk_index) {
            ChunkStatus::Resident
        } else if self.pending.contains(&chunk_index) {
            ChunkStatus::Pending
        } else {
            ChunkStatus::Absent
        }
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<(), DiskIoError> {
        let oob = DiskIoError::OutOfBounds {
            offset,
            len,
            size: self.total_size,
        };
        match offset.checked_add(len) {
            Some(end) if end <= self.total_size => Ok(()),
            _ => Err(oob),
        }
    }

    /// Chunk indices covering the non-empty range `[offset, offset + len)`.
    fn covering_chunks(&self, offset: u64, len: u64) -> std::ops::RangeInclusive<u64> {
        let first = offset / self.chunk_size;
        let last = (offset + len - 1) / self.chunk_size;
        first..=last
    }

    fn copy_out(&self, offset: u64, dst: &mut [u8]) -> Result<(), DiskIoError> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < dst.len() {
            let chunk_index = pos / self.chunk_size;
            let chunk = self
                .chunks
                .get(&chunk_index)
                .ok_or(DiskIoError::NotResident { offset: pos })?;
            let within = (pos - chunk_index * self.chunk_size) as usize;
            let n = (chunk.len() - within).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&chunk[within..within + n]);
            written += n;
            pos += n as u64;
        }
        Ok(())
    }
}

struct Waiter {
    image: ImageHandle,
    offset: u64,
    len: u64,
    missing: BTreeSet<u64>,
    tx: oneshot::Sender<Result<Vec<u8>, DiskIoError>>,
}

struct Completion {
    generation: u64,
    image: ImageHandle,
    chunk_index: u64,
    result: Result<Vec<u8>, DiskIoError>,
}

/// Everything a fetch task needs, cloned out of the adapter so tasks never touch the chunk table.
#[derive(Clone)]
struct FetchContext {
    provider: Arc<dyn RangeProvider>,
    events: EventBus,
    fetch_sem: Arc<Semaphore>,
    telemetry: Arc<StorageTelemetry>,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl FetchContext {
    async fn fetch_with_retries(
        &self,
        source: &str,
        file_name: &str,
        range: ByteRange,
        progress: &FetchProgress,
    ) -> Result<Vec<u8>, DiskIoError> {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut last = String::new();

        for attempt in 1..=attempts {
            let err = match self.provider.fetch(source, range, progress.clone()).await {
                Ok(bytes) if bytes.len() as u64 == range.len() => return Ok(bytes),
                Ok(bytes) => TransportError::retryable(format!(
                    "short read: expected {} bytes, got {}",
                    range.len(),
                    bytes.len()
                )),
                Err(err) => err,
            };

            if !err.retryable {
                return Err(DiskIoError::Transport {
                    file_name: file_name.to_string(),
                    message: err.message,
                });
            }
            last = err.message;
            if attempt == attempts {
                break;
            }
            self.telemetry.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                file_name,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %last,
                "range fetch failed; retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(self.max_backoff);
        }

        Err(DiskIoError::Exhausted {
            file_name: file_name.to_string(),
            attempts,
            last,
        })
    }

    async fn fetch_chunk(
        &self,
        source: &str,
        file_name: &str,
        chunk_index: u64,
        range: ByteRange,
        manifest: Option<Arc<ChunkManifest>>,
    ) -> Result<Vec<u8>, DiskIoError> {
        let _permit = self
            .fetch_sem
            .acquire()
            .await
            .map_err(|_| DiskIoError::Cancelled)?;
        self.telemetry
            .fetches_issued
            .fetch_add(1, Ordering::Relaxed);

        let progress = FetchProgress::new(self.events.clone(), file_name, range.len());
        progress.start();
        let bytes = self
            .fetch_with_retries(source, file_name, range, &progress)
            .await?;

        if let Some(manifest) = manifest {
            let expected = manifest.sha256_for_chunk(chunk_index);
            let mut actual = [0u8; 32];
            actual.copy_from_slice(&Sha256::digest(&bytes));
            if expected != Some(actual) {
                return Err(DiskIoError::Integrity { chunk_index });
            }
        }

        self.telemetry
            .bytes_downloaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        progress.complete();
        Ok(bytes)
    }
}

/// Presents remote disk images as chunked block devices.
///
/// Fetches run as tasks on the supplied runtime and report back through a completion queue. The
/// chunk table is only mutated by [`drain_completions`](Self::drain_completions) and
/// [`next_completion`](Self::next_completion), both of which run on the owner's thread.
pub struct BlockDeviceAdapter {
    ctx: FetchContext,
    options: StorageOptions,
    runtime: Handle,
    token: CancellationToken,
    generation: u64,
    images: BTreeMap<ImageHandle, Image>,
    next_handle: u32,
    waiters: Vec<Waiter>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl BlockDeviceAdapter {
    pub fn new(
        provider: Arc<dyn RangeProvider>,
        events: EventBus,
        options: StorageOptions,
        runtime: Handle,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let ctx = FetchContext {
            provider,
            events,
            fetch_sem: Arc::new(Semaphore::new(options.max_concurrent_fetches.max(1))),
            telemetry: Arc::new(StorageTelemetry::default()),
            max_attempts: options.max_attempts,
            initial_backoff: options.initial_backoff(),
            max_backoff: options.max_backoff(),
        };
        Self {
            ctx,
            options,
            runtime,
            token: CancellationToken::new(),
            generation: 0,
            images: BTreeMap::new(),
            next_handle: 0,
            waiters: Vec::new(),
            completions_tx,
            completions_rx,
        }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn telemetry(&self) -> StorageTelemetrySnapshot {
        self.ctx.telemetry.snapshot()
    }

    /// Register an image, probing its size through the provider. No data is fetched.
    pub async fn open_image(
        &mut self,
        file_name: &str,
        source: &str,
    ) -> Result<ImageHandle, DiskIoError> {
        let total_size = self
            .ctx
            .provider
            .total_size(source)
            .await
            .map_err(|err| {
                self.ctx.events.publish(MachineEvent::DownloadError {
                    file_name: file_name.to_string(),
                });
                DiskIoError::Transport {
                    file_name: file_name.to_string(),
                    message: err.message,
                }
            })?;
        Ok(self.open_image_with_size(file_name, source, total_size))
    }

    pub fn open_image_with_size(
        &mut self,
        file_name: &str,
        source: &str,
        total_size: u64,
    ) -> ImageHandle {
        let handle = ImageHandle(self.next_handle);
        self.next_handle += 1;
        self.images.insert(
            handle,
            Image {
                file_name: file_name.to_string(),
                source: source.to_string(),
                total_size,
                chunk_size: u64::from(self.options.chunk_size),
                chunks: BTreeMap::new(),
                resident: RangeSet::new(),
                pending: BTreeSet::new(),
                manifest: None,
            },
        );
        debug!(file_name, total_size, ?handle, "disk image opened");
        handle
    }

    pub fn set_manifest(
        &mut self,
        image: ImageHandle,
        manifest: ChunkManifest,
    ) -> Result<(), DiskIoError> {
        let img = self.image_mut(image)?;
        img.manifest = Some(Arc::new(manifest));
        Ok(())
    }

    pub fn image_info(&self, image: ImageHandle) -> Option<ImageInfo> {
        self.images.get(&image).map(|img| ImageInfo {
            handle: image,
            file_name: img.file_name.clone(),
            total_size: img.total_size,
            chunk_size: img.chunk_size as u32,
        })
    }

    /// Download a whole file outside the chunk table (firmware, state files), with the same
    /// retry policy and progress events as chunk fetches.
    pub fn download(
        &self,
        file_name: &str,
        source: &str,
    ) -> impl Future<Output = Result<Vec<u8>, DiskIoError>> + Send + 'static {
        let ctx = self.ctx.clone();
        let file_name = file_name.to_string();
        let source = source.to_string();
        async move {
            let result = async {
                let total = ctx.provider.total_size(&source).await.map_err(|err| {
                    DiskIoError::Transport {
                        file_name: file_name.clone(),
                        message: err.message,
                    }
                })?;
                let progress = FetchProgress::new(ctx.events.clone(), &file_name, total);
                progress.start();
                let bytes = ctx
                    .fetch_with_retries(&source, &file_name, ByteRange::new(0, total), &progress)
                    .await?;
                progress.complete();
                Ok::<_, DiskIoError>(bytes)
            }
            .await;
            if result.is_err() {
                ctx.events.publish(MachineEvent::DownloadError {
                    file_name: file_name.clone(),
                });
            }
            result
        }
    }

    pub fn chunk_status(&self, image: ImageHandle, offset: u64) -> Result<ChunkStatus, DiskIoError> {
        let img = self.image(image)?;
        img.check_bounds(offset, 1)?;
        Ok(img.chunk_status(offset / img.chunk_size))
    }

    /// Copy resident bytes. Fails with `NotResident` unless every covering chunk is resident.
    pub fn read_resident(
        &self,
        image: ImageHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), DiskIoError> {
        let img = self.image(image)?;
        img.check_bounds(offset, buf.len() as u64)?;
        img.copy_out(offset, buf)
    }

    /// Ask for `len` bytes at `offset`. Missing chunks are fetched (or joined, if already in
    /// flight) and the returned request resolves once all of them are resident.
    pub fn request_chunk(&mut self, image: ImageHandle, offset: u64, len: u64) -> ChunkRequest {
        let (tx, rx) = oneshot::channel();
        let request = ChunkRequest { rx };

        let (missing, to_fetch) = {
            let img = match self.image(image) {
                Ok(img) => img,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return request;
                }
            };
            if let Err(err) = img.check_bounds(offset, len.max(1)) {
                let _ = tx.send(Err(err));
                return request;
            }
            let covering = img.covering_chunks(offset, len.max(1));
            let last = *covering.end();
            let missing: BTreeSet<u64> = covering
                .filter(|idx| !img.chunks.contains_key(idx))
                .collect();
            if missing.is_empty() {
                let mut buf = vec![0u8; len as usize];
                let _ = tx.send(img.copy_out(offset, &mut buf).map(|()| buf));
                return request;
            }

            let coalesced = missing.iter().filter(|idx| img.pending.contains(idx)).count();
            self.ctx
                .telemetry
                .coalesced_requests
                .fetch_add(coalesced as u64, Ordering::Relaxed);

            let read_ahead_end = last
                .saturating_add(u64::from(self.options.read_ahead_chunks))
                .min(img.chunk_count().saturating_sub(1));
            let to_fetch: Vec<u64> = missing
                .iter()
                .copied()
                .chain(last + 1..=read_ahead_end)
                .filter(|idx| img.chunk_status(*idx) == ChunkStatus::Absent)
                .collect();
            (missing, to_fetch)
        };

        for chunk_index in to_fetch {
            self.start_fetch(image, chunk_index);
        }
        self.waiters.push(Waiter {
            image,
            offset,
            len,
            missing,
            tx,
        });
        request
    }

    /// Start fetching every absent chunk overlapping `[start, end)`. Returns how many fetches
    /// were started.
    pub fn prefetch(&mut self, image: ImageHandle, start: u64, end: u64) -> Result<usize, DiskIoError> {
        let to_fetch: Vec<u64> = {
            let img = self.image(image)?;
            let end = end.min(img.total_size);
            if start >= end {
                return Ok(0);
            }
            img.covering_chunks(start, end - start)
                .filter(|idx| img.chunk_status(*idx) == ChunkStatus::Absent)
                .collect()
        };
        let started = to_fetch.len();
        for chunk_index in to_fetch {
            self.start_fetch(image, chunk_index);
        }
        Ok(started)
    }

    pub fn has_pending(&self) -> bool {
        self.images.values().any(|img| !img.pending.is_empty())
    }

    /// Apply every completion queued so far without waiting. Returns the number applied.
    pub fn drain_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if self.apply(completion).is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for and apply the next completion. `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<CompletedChunk> {
        loop {
            if !self.has_pending() {
                return None;
            }
            let completion = self.completions_rx.recv().await?;
            if let Some(done) = self.apply(completion) {
                return Some(done);
            }
        }
    }

    pub async fn wait_idle(&mut self) {
        while self.next_completion().await.is_some() {}
    }

    /// Abandon every in-flight fetch. Their chunks go back to `Absent` and all waiters receive
    /// `Cancelled`; late completions are discarded.
    pub fn cancel_all(&mut self) {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.generation += 1;
        for img in self.images.values_mut() {
            img.pending.clear();
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(DiskIoError::Cancelled));
        }
        debug!(generation = self.generation, "disk fetches cancelled");
    }

    pub fn chunk_tables(&self) -> Vec<ChunkTableState> {
        self.images
            .iter()
            .map(|(&image, img)| ChunkTableState {
                image,
                file_name: img.file_name.clone(),
                total_size: img.total_size,
                chunk_size: img.chunk_size as u32,
                resident: img.resident.clone(),
            })
            .collect()
    }

    fn image(&self, image: ImageHandle) -> Result<&Image, DiskIoError> {
        self.images
            .get(&image)
            .ok_or(DiskIoError::UnknownImage(image))
    }

    fn image_mut(&mut self, image: ImageHandle) -> Result<&mut Image, DiskIoError> {
        self.images
            .get_mut(&image)
            .ok_or(DiskIoError::UnknownImage(image))
    }

    fn start_fetch(&mut self, image: ImageHandle, chunk_index: u64) {
        let Some(img) = self.images.get_mut(&image) else {
            return;
        };
        if img.chunk_status(chunk_index) != ChunkStatus::Absent {
            return;
        }
        img.pending.insert(chunk_index);

        let range = img.chunk_bounds(chunk_index);
        let source = img.source.clone();
        let file_name = img.file_name.clone();
        let manifest = img.manifest.clone();
        let ctx = self.ctx.clone();
        let token = self.token.clone();
        let tx = self.completions_tx.clone();
        let generation = self.generation;
        debug!(file_name = %file_name, chunk_index, start = range.start, end = range.end, "chunk fetch queued");

        self.runtime.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(DiskIoError::Cancelled),
                result = ctx.fetch_chunk(&source, &file_name, chunk_index, range, manifest) => result,
            };
            let _ = tx.send(Completion {
                generation,
                image,
                chunk_index,
                result,
            });
        });
    }

    fn apply(&mut self, completion: Completion) -> Option<CompletedChunk> {
        if completion.generation != self.generation {
            return None;
        }
        let Completion {
            image,
            chunk_index,
            result,
            ..
        } = completion;
        let img = self.images.get_mut(&image)?;
        if !img.pending.remove(&chunk_index) {
            return None;
        }

        let failure = match result {
            Ok(bytes) => {
                let bounds = img.chunk_bounds(chunk_index);
                img.resident.insert(bounds.start, bounds.end);
                img.chunks.insert(chunk_index, bytes);
                debug!(file_name = %img.file_name, chunk_index, "chunk resident");
                None
            }
            Err(err) => {
                warn!(file_name = %img.file_name, chunk_index, error = %err, "chunk fetch failed");
                if err != DiskIoError::Cancelled {
                    self.ctx.events.publish(MachineEvent::DownloadError {
                        file_name: img.file_name.clone(),
                    });
                }
                Some(err)
            }
        };

        let img = self.images.get(&image)?;
        for mut waiter in std::mem::take(&mut self.waiters) {
            if waiter.image != image || !waiter.missing.contains(&chunk_index) {
                self.waiters.push(waiter);
                continue;
            }
            if let Some(err) = &failure {
                let _ = waiter.tx.send(Err(err.clone()));
                continue;
            }
            waiter.missing.remove(&chunk_index);
            if !waiter.missing.is_empty() {
                self.waiters.push(waiter);
                continue;
            }
            let mut buf = vec![0u8; waiter.len as usize];
            let _ = waiter
                .tx
                .send(img.copy_out(waiter.offset, &mut buf).map(|()| buf));
        }

        Some(CompletedChunk {
            image,
            chunk_index,
            result: failure.map_or(Ok(()), Err),
        })
    }
}
