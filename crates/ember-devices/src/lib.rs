//! Legacy PC devices driven by the execution scheduler.
//!
//! Every device is ticked once per macro-step in a fixed order and only ever sees guest memory
//! and the disk adapter through the [`DeviceContext`] it is handed for that tick.

mod ide;
mod pit;
mod serial;
pub mod state;
mod vga;

use ember_events::EventBus;
use ember_mem::GuestMemory;
use ember_snapshot::{DeviceId, DeviceState, SnapshotError};
use ember_storage::BlockDeviceAdapter;
use thiserror::Error;

pub use ide::{IdeController, IdeState, IDE_CMD_BASE, IDE_CTRL_PORT};
pub use pit::{Pit, PitMode, PIT_CHANNEL0_PORT, PIT_COMMAND_PORT};
pub use serial::{Serial16550, COM1_BASE};
pub use vga::{Vga, VGA_TEXT_COLS, VGA_TEXT_ROWS, VGA_WINDOW_END, VGA_WINDOW_START};

pub const IRQ_TIMER: u8 = 0;
pub const IRQ_SERIAL: u8 = 4;
pub const IRQ_IDE: u8 = 14;

pub const DEVICE_STATE_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device state decode failed: {0}")]
    Decode(#[from] SnapshotError),

    #[error("{device} state is invalid: {reason}")]
    InvalidState {
        device: &'static str,
        reason: &'static str,
    },

    #[error("unsupported {device} state version {version}")]
    UnsupportedVersion { device: &'static str, version: u16 },

    #[error("snapshot has no state for {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Timer,
    Serial,
    Vga,
    Ide,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Timer => "timer",
            DeviceKind::Serial => "serial",
            DeviceKind::Vga => "vga",
            DeviceKind::Ide => "ide",
        }
    }

    pub fn snapshot_id(self) -> DeviceId {
        match self {
            DeviceKind::Timer => DeviceId::PIT,
            DeviceKind::Serial => DeviceId::SERIAL,
            DeviceKind::Vga => DeviceId::VGA,
            DeviceKind::Ide => DeviceId::DISK_CONTROLLER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do this tick.
    Idle,
    /// State advanced.
    Progressed,
    /// Waiting on something outside the machine (disk data); try again next tick.
    Yielded,
}

pub struct DeviceContext<'a> {
    pub mem: &'a mut GuestMemory,
    pub disk: &'a mut BlockDeviceAdapter,
    pub events: &'a EventBus,
    /// Macro-step counter.
    pub now: u64,
}

pub trait Device {
    fn kind(&self) -> DeviceKind;

    fn claims_port(&self, port: u16) -> bool;
    fn port_read(&mut self, port: u16, size: u8) -> u32;
    fn port_write(&mut self, port: u16, size: u8, value: u32);

    fn tick(&mut self, ctx: &mut DeviceContext<'_>) -> TickOutcome;

    fn irq_line(&self) -> Option<u8>;
    /// Whether the device asserts its interrupt line after the last tick or port access. Edge
    /// sources clear their latch when sampled.
    fn take_interrupt_request(&mut self) -> bool;

    /// True when the device holds no in-flight external operation and its state is fully
    /// captured by [`save_state`](Self::save_state).
    fn is_quiescent(&self) -> bool;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub vga_memory_size: usize,
    pub pit_ticks_per_step: u32,
    pub retrace_period: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vga_memory_size: 8 * 1024 * 1024,
            pit_ticks_per_step: 1_000,
            retrace_period: 16,
        }
    }
}

/// The fixed device population of the machine.
pub struct DeviceSet {
    pub pit: Pit,
    pub serial: Serial16550,
    pub vga: Vga,
    pub ide: IdeController,
}

impl DeviceSet {
    pub fn new(config: DeviceConfig, events: EventBus) -> Self {
        Self {
            pit: Pit::new(config.pit_ticks_per_step),
            serial: Serial16550::new(COM1_BASE),
            vga: Vga::new(config.vga_memory_size, config.retrace_period),
            ide: IdeController::new(events),
        }
    }

    /// Devices in tick order.
    pub fn devices(&self) -> [&dyn Device; 4] {
        [&self.pit, &self.serial, &self.vga, &self.ide]
    }

    pub fn devices_mut(&mut self) -> [&mut dyn Device; 4] {
        [&mut self.pit, &mut self.serial, &mut self.vga, &mut self.ide]
    }

    pub fn port_read(&mut self, port: u16, size: u8) -> Option<u32> {
        self.devices_mut()
            .into_iter()
            .find(|dev| dev.claims_port(port))
            .map(|dev| dev.port_read(port, size))
    }

    pub fn port_write(&mut self, port: u16, size: u8, value: u32) -> bool {
        match self
            .devices_mut()
            .into_iter()
            .find(|dev| dev.claims_port(port))
        {
            Some(dev) => {
                dev.port_write(port, size, value);
                true
            }
            None => false,
        }
    }

    /// Tick every device in order and return the IRQ lines asserted afterwards.
    pub fn tick_all(&mut self, ctx: &mut DeviceContext<'_>) -> Vec<u8> {
        let mut raised = Vec::new();
        for dev in self.devices_mut() {
            dev.tick(ctx);
            if let Some(line) = dev.irq_line() {
                if dev.take_interrupt_request() {
                    raised.push(line);
                }
            }
        }
        raised
    }

    /// Tick only the devices that are mid-operation. Used to reach a quiesce point without
    /// running the CPU.
    pub fn tick_busy(&mut self, ctx: &mut DeviceContext<'_>) -> Vec<u8> {
        let mut raised = Vec::new();
        for dev in self.devices_mut() {
            if dev.is_quiescent() {
                continue;
            }
            dev.tick(ctx);
            if let Some(line) = dev.irq_line() {
                if dev.take_interrupt_request() {
                    raised.push(line);
                }
            }
        }
        raised
    }

    /// Name of the first device that cannot be snapshotted right now.
    pub fn first_busy(&self) -> Option<&'static str> {
        self.devices()
            .into_iter()
            .find(|dev| !dev.is_quiescent())
            .map(|dev| dev.kind().name())
    }

    pub fn save_states(&self) -> Vec<DeviceState> {
        self.devices()
            .into_iter()
            .map(|dev| DeviceState {
                id: dev.kind().snapshot_id(),
                version: DEVICE_STATE_VERSION,
                flags: 0,
                data: dev.save_state(),
            })
            .collect()
    }

    /// Load every device from `states`. Entries for other ids are ignored; a missing entry for
    /// one of ours is an error. On error the set is left partially loaded, so callers restore
    /// into a fresh set.
    pub fn load_states(&mut self, states: &[DeviceState]) -> Result<(), DeviceError> {
        for dev in self.devices_mut() {
            let kind = dev.kind();
            let state = states
                .iter()
                .find(|s| s.id == kind.snapshot_id())
                .ok_or(DeviceError::Missing(kind.name()))?;
            if state.version != DEVICE_STATE_VERSION {
                return Err(DeviceError::UnsupportedVersion {
                    device: kind.name(),
                    version: state.version,
                });
            }
            dev.load_state(&state.data)?;
        }
        Ok(())
    }
}
