//! Typed lifecycle and I/O progress events published by the emulator core.
//!
//! The browser glue historically registered string-keyed callbacks (`download-progress`,
//! `emulator-ready`, ...). Here every subscriber owns an unbounded channel of [`MachineEvent`]s and
//! drains it at its own pace. Events are delivered to each subscriber in emission order.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Progress of a single byte-range download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub file_name: String,
    pub loaded: u64,
    pub total: u64,
    /// `false` when the transport could not report a total size up front.
    pub length_computable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    DownloadProgress(ProgressEvent),
    DownloadError { file_name: String },
    EmulatorReady,
    IdeReadStart,
    IdeReadEnd,
    /// The host UI should capture the pointer for the guest.
    PointerLockRequested,
    Started,
    Stopped,
}

impl MachineEvent {
    /// Stable wire name, matching the listener names used by web front-ends.
    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::DownloadProgress(_) => "download-progress",
            MachineEvent::DownloadError { .. } => "download-error",
            MachineEvent::EmulatorReady => "emulator-ready",
            MachineEvent::IdeReadStart => "ide-read-start",
            MachineEvent::IdeReadEnd => "ide-read-end",
            MachineEvent::PointerLockRequested => "pointer-lock-requested",
            MachineEvent::Started => "emulator-started",
            MachineEvent::Stopped => "emulator-stopped",
        }
    }
}

type SubscriberList = Arc<Mutex<Vec<mpsc::UnboundedSender<MachineEvent>>>>;

/// Publish/subscribe hub. Cloning yields another handle to the same hub, so fetch tasks running
/// on other threads can publish progress without touching machine state.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: SubscriberList,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        EventReceiver { rx }
    }

    /// Deliver `event` to every live subscriber. Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: MachineEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<MachineEvent>>> {
        // A panicking publisher cannot leave the list half-updated, so poisoning is ignored.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<MachineEvent>,
}

impl EventReceiver {
    pub fn try_recv(&mut self) -> Option<MachineEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every event queued so far.
    pub fn drain(&mut self) -> Vec<MachineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn recv(&mut self) -> Option<MachineEvent> {
        self.rx.recv().await
    }
}
