use std::sync::Arc;

use ember_devices::{DeviceContext, DeviceSet};
use ember_events::{EventBus, EventReceiver, MachineEvent};
use ember_mem::GuestMemory;
use ember_snapshot::{
    restore_snapshot_checked, save_snapshot, DiskChunkTable, RestoreOptions, SaveOptions,
    SnapshotError,
};
use ember_storage::{BlockDeviceAdapter, ImageHandle, RangeProvider};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::bus::PlatformBus;
use crate::config::MachineConfig;
use crate::cpu::{Cpu, CpuBus, RunMode, StepExit};
use crate::error::Result;
use crate::pic::Pic;
use crate::state::{MachineState, SaveView, SnapshotLineage, StagedRestore};

/// Why the CPU phase of a macro-step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// The instruction budget ran out.
    Budget,
    Halted,
    /// The guest touched a port that needs the devices to run first.
    Yielded,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub executed: u64,
    pub cpu_exit: CpuExit,
    /// IRQ lines raised by the device tick.
    pub irqs_raised: usize,
    /// Async disk completions applied at the end of the step.
    pub completions: usize,
}

pub struct Machine {
    config: MachineConfig,
    state: MachineState,
    disk: BlockDeviceAdapter,
    events: EventBus,
    hda: Option<(ImageHandle, u64)>,
    running: bool,
    pointer_locked: bool,
    lineage: SnapshotLineage,
}

impl Machine {
    /// Build an unbooted machine: zeroed RAM, reset CPU, no firmware or disk.
    pub fn new(
        config: MachineConfig,
        provider: Arc<dyn RangeProvider>,
        runtime: Handle,
    ) -> Result<Self> {
        Self::with_events(config, provider, runtime, EventBus::new())
    }

    pub fn with_events(
        config: MachineConfig,
        provider: Arc<dyn RangeProvider>,
        runtime: Handle,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let state = MachineState::new(config.memory_size, config.device_config(), events.clone());
        let disk = BlockDeviceAdapter::new(
            provider,
            events.clone(),
            config.storage.clone(),
            runtime,
        );
        Ok(Self {
            config,
            state,
            disk,
            events,
            hda: None,
            running: false,
            pointer_locked: false,
            lineage: SnapshotLineage::default(),
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn cpu(&self) -> &Cpu {
        &self.state.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.state.cpu
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.state.mem
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.state.mem
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.state.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceSet {
        &mut self.state.devices
    }

    pub fn pic(&self) -> &Pic {
        &self.state.pic
    }

    pub fn disk(&self) -> &BlockDeviceAdapter {
        &self.disk
    }

    pub fn disk_mut(&mut self) -> &mut BlockDeviceAdapter {
        &mut self.disk
    }

    /// Completed macro-steps since power-on (restored with snapshots).
    pub fn steps(&self) -> u64 {
        self.state.steps
    }

    pub fn last_snapshot_id(&self) -> Option<u64> {
        self.lineage.last_id()
    }

    /// Open `source` as the primary master drive.
    pub async fn attach_disk(&mut self, file_name: &str, source: &str) -> Result<ImageHandle> {
        let handle = self.disk.open_image(file_name, source).await?;
        let total_size = self
            .disk
            .image_info(handle)
            .map(|info| info.total_size)
            .unwrap_or_default();
        let sectors = total_size / u64::from(ember_storage::SECTOR_SIZE);
        self.state.devices.ide.attach(handle, sectors);
        self.hda = Some((handle, sectors));
        info!(file_name, total_size, "hard disk attached");
        Ok(handle)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!("machine started");
        self.events.publish(MachineEvent::Started);
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        info!(steps = self.state.steps, "machine stopped");
        self.events.publish(MachineEvent::Stopped);
    }

    /// Run one macro-step: the CPU slice, one tick of every device, then the disk completions
    /// that arrived since the last step. Runs regardless of [`is_running`](Self::is_running).
    pub fn step(&mut self) -> StepReport {
        let before = self.state.cpu.instructions_retired();
        let cpu_exit = self.run_cpu();
        let executed = self.state.cpu.instructions_retired() - before;

        let now = self.state.steps;
        let MachineState {
            mem, devices, pic, ..
        } = &mut self.state;
        let mut ctx = DeviceContext {
            mem,
            disk: &mut self.disk,
            events: &self.events,
            now,
        };
        let raised = devices.tick_all(&mut ctx);
        for &line in &raised {
            pic.raise(line);
        }

        let completions = self.disk.drain_completions();
        self.state.steps += 1;
        StepReport {
            executed,
            cpu_exit,
            irqs_raised: raised.len(),
            completions,
        }
    }

    fn run_cpu(&mut self) -> CpuExit {
        let MachineState {
            cpu,
            mem,
            devices,
            pic,
            ..
        } = &mut self.state;
        let mut bus = PlatformBus::new(mem, devices, pic);
        let budget = self.config.scheduler.instructions_per_step;

        for _ in 0..budget {
            if cpu.accepts_interrupts() {
                if let Some(line) = bus.pic.pending() {
                    bus.pic.acknowledge(line);
                    if !cpu.raise_interrupt(Pic::vector(line), &mut bus) {
                        return CpuExit::Shutdown;
                    }
                }
            }
            match cpu.step(&mut bus) {
                StepExit::Continue => {}
                StepExit::Halted => return CpuExit::Halted,
                StepExit::Shutdown => return CpuExit::Shutdown,
            }
            if bus.take_yield_request() {
                return CpuExit::Yielded;
            }
        }
        match cpu.mode() {
            RunMode::Running => CpuExit::Budget,
            RunMode::Halted => CpuExit::Halted,
            RunMode::Shutdown => CpuExit::Shutdown,
        }
    }

    /// Run up to `max_steps` macro-steps while the machine is running. Returns the number of
    /// steps executed.
    pub fn run_slice(&mut self, max_steps: u64) -> u64 {
        let mut executed = 0;
        while self.running && executed < max_steps {
            self.step();
            executed += 1;
        }
        executed
    }

    /// Drive disk completions and busy devices, without running the CPU, until every device is
    /// quiescent.
    pub async fn quiesce(&mut self) {
        loop {
            let now = self.state.steps;
            let MachineState { mem, devices, pic, .. } = &mut self.state;
            let mut ctx = DeviceContext {
                mem,
                disk: &mut self.disk,
                events: &self.events,
                now,
            };
            for line in devices.tick_busy(&mut ctx) {
                pic.raise(line);
            }
            let Some(device) = devices.first_busy() else {
                return;
            };
            debug!(device, "waiting for device to quiesce");
            if self.disk.next_completion().await.is_none() {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn save(&mut self) -> Result<Vec<u8>> {
        self.save_with(SaveOptions::default(), None)
    }

    pub fn save_with(&mut self, options: SaveOptions, label: Option<String>) -> Result<Vec<u8>> {
        if let Some(device) = self.state.devices.first_busy() {
            return Err(SnapshotError::UnsafeState { device }.into());
        }
        let mut view = SaveView {
            state: &mut self.state,
            disk: &self.disk,
            lineage: &mut self.lineage,
            label,
        };
        let blob = save_snapshot(&mut view, options)?;
        debug!(len = blob.len(), "snapshot saved");
        Ok(blob)
    }

    /// Replace the machine state with the one in `bytes`. On error the live machine is left as
    /// it was.
    ///
    /// An incremental blob is only accepted when its parent is the snapshot this machine last
    /// saved or restored.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let mut staged = StagedRestore::new(
            self.state.mem.len(),
            self.config.device_config(),
            self.events.clone(),
            self.hda,
        );
        let options = RestoreOptions {
            expected_parent_snapshot_id: self.lineage.last_id(),
        };
        restore_snapshot_checked(bytes, &mut staged, options)?;

        let was_reading = self.state.devices.ide.is_reading();
        let tables = staged.commit(&mut self.state, &mut self.lineage)?;
        // Keep read start/end notifications paired across the swap.
        match (was_reading, self.state.devices.ide.is_reading()) {
            (false, true) => self.events.publish(MachineEvent::IdeReadStart),
            (true, false) => self.events.publish(MachineEvent::IdeReadEnd),
            _ => {}
        }
        self.apply_residency_hints(&tables);
        info!(
            steps = self.state.steps,
            snapshot_id = ?self.lineage.last_id(),
            "snapshot restored"
        );
        Ok(())
    }

    /// Re-request the chunks that were resident when the snapshot was taken. Tables for images
    /// that are not open under the same handle, name and size are skipped.
    fn apply_residency_hints(&mut self, tables: &[DiskChunkTable]) {
        for table in tables {
            let handle = ImageHandle(table.image);
            let matches = self.disk.image_info(handle).is_some_and(|info| {
                info.file_name == table.file_name && info.total_size == table.total_size
            });
            if !matches {
                warn!(
                    file_name = %table.file_name,
                    "snapshot disk table does not match an open image; skipping prefetch"
                );
                continue;
            }
            for &(start, end) in &table.resident {
                if let Err(err) = self.disk.prefetch(handle, start, end) {
                    warn!(file_name = %table.file_name, %err, "prefetch after restore failed");
                    break;
                }
            }
        }
    }

    /// Record a pointer-lock request; the host performs the actual capture.
    pub fn lock_pointer(&mut self) {
        self.pointer_locked = true;
        self.events.publish(MachineEvent::PointerLockRequested);
    }

    pub fn pointer_lock_requested(&self) -> bool {
        self.pointer_locked
    }

    pub fn serial_input(&mut self, byte: u8) {
        self.state.devices.serial.push_rx(byte);
    }

    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.state.devices.serial.take_tx()
    }

    pub fn vga_text(&self) -> String {
        self.state.devices.vga.text_snapshot()
    }
}
