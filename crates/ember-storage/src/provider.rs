//! Byte-range transports feeding the block adapter.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ember_events::{EventBus, MachineEvent, ProgressEvent};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::TransportError;
use crate::range_set::ByteRange;

pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send>>;

/// Source of image bytes. `source` is an opaque locator (URL, path, key) chosen by the host.
///
/// Futures must be `'static`; implementations clone whatever they need out of `self`.
pub trait RangeProvider: Send + Sync + 'static {
    fn total_size(&self, source: &str) -> ProviderFuture<u64>;

    /// Fetch exactly `range`. Implementations may report partial progress through `progress`.
    fn fetch(&self, source: &str, range: ByteRange, progress: FetchProgress)
        -> ProviderFuture<Vec<u8>>;
}

/// Progress reporter handed to one fetch. Publishes `download-progress` events and never lets
/// `loaded` go backwards.
#[derive(Clone)]
pub struct FetchProgress {
    events: EventBus,
    file_name: Arc<str>,
    total: u64,
    loaded: Arc<AtomicU64>,
}

impl FetchProgress {
    pub fn new(events: EventBus, file_name: &str, total: u64) -> Self {
        Self {
            events,
            file_name: Arc::from(file_name),
            total,
            loaded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    pub(crate) fn start(&self) {
        self.publish(self.loaded());
    }

    /// Report `loaded` bytes received so far. Values at or below the last report are ignored.
    pub fn update(&self, loaded: u64) {
        let loaded = loaded.min(self.total);
        let prev = self.loaded.fetch_max(loaded, Ordering::Relaxed);
        if loaded > prev {
            self.publish(loaded);
        }
    }

    pub(crate) fn complete(&self) {
        self.loaded.store(self.total, Ordering::Relaxed);
        self.publish(self.total);
    }

    fn publish(&self, loaded: u64) {
        self.events
            .publish(MachineEvent::DownloadProgress(ProgressEvent {
                file_name: self.file_name.to_string(),
                loaded,
                total: self.total,
                length_computable: true,
            }));
    }
}

#[derive(Default)]
struct MemoryInner {
    images: HashMap<String, Arc<Vec<u8>>>,
    failures: HashMap<String, (u32, bool)>,
    fetches: u64,
    progress_steps: u32,
}

/// In-memory provider for tests and embedders that already hold image bytes.
///
/// Failures can be injected per source; each injected failure consumes one fetch attempt.
#[derive(Clone, Default)]
pub struct MemoryRangeProvider {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRangeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: impl Into<String>, bytes: Vec<u8>) {
        self.lock().images.insert(source.into(), Arc::new(bytes));
    }

    /// Fail the next `count` fetches of `source`.
    pub fn fail_next(&self, source: impl Into<String>, count: u32, retryable: bool) {
        self.lock()
            .failures
            .insert(source.into(), (count, retryable));
    }

    /// Deliver each fetch in `steps` progress increments, yielding between them.
    pub fn set_progress_steps(&self, steps: u32) {
        self.lock().progress_steps = steps;
    }

    /// Number of `fetch` calls so far (failed attempts included).
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RangeProvider for MemoryRangeProvider {
    fn total_size(&self, source: &str) -> ProviderFuture<u64> {
        let size = self.lock().images.get(source).map(|img| img.len() as u64);
        let source = source.to_string();
        Box::pin(async move {
            size.ok_or_else(|| TransportError::fatal(format!("no such image: {source}")))
        })
    }

    fn fetch(
        &self,
        source: &str,
        range: ByteRange,
        progress: FetchProgress,
    ) -> ProviderFuture<Vec<u8>> {
        let (image, injected, steps) = {
            let mut inner = self.lock();
            inner.fetches += 1;
            let injected = match inner.failures.get_mut(source) {
                Some((count, retryable)) if *count > 0 => {
                    *count -= 1;
                    Some(*retryable)
                }
                _ => None,
            };
            (
                inner.images.get(source).cloned(),
                injected,
                inner.progress_steps,
            )
        };
        let source = source.to_string();

        Box::pin(async move {
            if let Some(retryable) = injected {
                let message = format!("injected failure for {source}");
                return Err(TransportError { message, retryable });
            }
            let image =
                image.ok_or_else(|| TransportError::fatal(format!("no such image: {source}")))?;
            let start = usize::try_from(range.start)
                .map_err(|_| TransportError::fatal("range start overflow"))?;
            let end = usize::try_from(range.end)
                .map_err(|_| TransportError::fatal("range end overflow"))?;
            if start > end || end > image.len() {
                return Err(TransportError::fatal(format!(
                    "range {start}..{end} outside {source}"
                )));
            }

            if steps > 1 {
                let len = range.len();
                for step in 1..steps {
                    progress.update(len * u64::from(step) / u64::from(steps));
                    tokio::task::yield_now().await;
                }
            }
            Ok(image[start..end].to_vec())
        })
    }
}

/// Serves images from files under `root`; `source` is a path relative to it (or absolute).
#[derive(Debug, Clone)]
pub struct FileRangeProvider {
    root: PathBuf,
}

impl FileRangeProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, source: &str) -> PathBuf {
        self.root.join(source)
    }
}

impl RangeProvider for FileRangeProvider {
    fn total_size(&self, source: &str) -> ProviderFuture<u64> {
        let path = self.resolve(source);
        Box::pin(async move { Ok(tokio::fs::metadata(&path).await?.len()) })
    }

    fn fetch(
        &self,
        source: &str,
        range: ByteRange,
        progress: FetchProgress,
    ) -> ProviderFuture<Vec<u8>> {
        let path = self.resolve(source);
        Box::pin(async move {
            let len = usize::try_from(range.len())
                .map_err(|_| TransportError::fatal("range too large"))?;
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(std::io::SeekFrom::Start(range.start)).await?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            progress.update(range.len());
            Ok(buf)
        })
    }
}
