//! The emulated PC: CPU interpreter, cooperative execution scheduler, snapshot glue and boot
//! sequence.
//!
//! A [`Machine`] owns all guest-visible state. Each macro-step runs a bounded CPU slice, ticks
//! every device once in a fixed order, then applies the disk completions that arrived from the
//! async fetch tasks. Nothing else mutates the machine, which keeps execution deterministic for
//! a given completion order and makes every step boundary a candidate snapshot point.

mod boot;
mod bus;
mod config;
pub mod cpu;
mod error;
mod machine;
mod pic;
mod state;

pub use boot::{RESET_VECTOR, VGA_BIOS_BASE};
pub use config::{ImageSource, MachineConfig, SchedulerConfig};
pub use cpu::{Cpu, CpuBus, Exception, RunMode, StepExit};
pub use error::{ConfigError, MachineError, Result};
pub use machine::{CpuExit, Machine, StepReport};
pub use pic::{Pic, IRQ_VECTOR_BASE, PIC_MASTER_CMD, PIC_MASTER_DATA, PIC_SLAVE_CMD, PIC_SLAVE_DATA};
pub use state::{MachineState, SnapshotLineage};

pub use ember_devices as devices;
pub use ember_events as events;
pub use ember_mem as mem;
pub use ember_snapshot as snapshot;
pub use ember_storage as storage;
