//! A small 32-bit flat-mode x86 interpreter.
//!
//! Only the instruction subset the firmware and test programs need is decoded; everything else
//! raises #UD. Memory faults raise #GP. Exceptions and external interrupts are delivered through
//! a vector table of 32-bit handler addresses loaded with `LIDT`; a vector that cannot be
//! delivered shuts the CPU down.

mod alu;
mod exec;

use ember_mem::{Eflags, Gpr, MemoryFault, RegisterFile};
use ember_snapshot::{CpuState, SnapshotError};
use tracing::warn;

pub trait CpuBus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception>;
    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception>;
    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception>;

    fn write_u8(&mut self, addr: u64, val: u8) -> Result<(), Exception>;
    fn write_u16(&mut self, addr: u64, val: u16) -> Result<(), Exception>;
    fn write_u32(&mut self, addr: u64, val: u32) -> Result<(), Exception>;

    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, val: u32);

    /// True once after an access that should end the current CPU slice early.
    fn take_yield_request(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InvalidOpcode { opcode: u8 },
    GeneralProtection { addr: u64 },
}

impl Exception {
    pub fn vector(self) -> u8 {
        match self {
            Exception::InvalidOpcode { .. } => 6,
            Exception::GeneralProtection { .. } => 13,
        }
    }
}

impl From<MemoryFault> for Exception {
    fn from(fault: MemoryFault) -> Self {
        Exception::GeneralProtection { addr: fault.addr }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Running,
    Halted,
    Shutdown,
}

impl RunMode {
    fn to_byte(self) -> u8 {
        match self {
            RunMode::Running => 0,
            RunMode::Halted => 1,
            RunMode::Shutdown => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RunMode::Running),
            1 => Some(RunMode::Halted),
            2 => Some(RunMode::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// An instruction retired or an exception was delivered.
    Continue,
    Halted,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cpu {
    pub regs: RegisterFile,
    mode: RunMode,
    vector_base: u32,
    vector_limit: u16,
    interrupt_shadow: bool,
    instructions_retired: u64,
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn instructions_retired(&self) -> u64 {
        self.instructions_retired
    }

    pub fn vector_table(&self) -> (u32, u16) {
        (self.vector_base, self.vector_limit)
    }

    pub fn set_vector_table(&mut self, base: u32, limit: u16) {
        self.vector_base = base;
        self.vector_limit = limit;
    }

    /// Whether an external interrupt may be delivered before the next instruction.
    pub fn accepts_interrupts(&self) -> bool {
        self.mode != RunMode::Shutdown
            && self.regs.flag(Eflags::IF)
            && !self.interrupt_shadow
    }

    /// Reset to the power-on state with execution starting at `eip`.
    pub fn reset(&mut self, eip: u32) {
        *self = Self::default();
        self.regs.eip = eip;
    }

    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> StepExit {
        match self.mode {
            RunMode::Halted => return StepExit::Halted,
            RunMode::Shutdown => return StepExit::Shutdown,
            RunMode::Running => {}
        }

        let start = self.regs.eip;
        let shadow = std::mem::take(&mut self.interrupt_shadow);
        match self.execute(bus) {
            Ok(exec::Flow::Next) => {
                self.instructions_retired += 1;
                StepExit::Continue
            }
            Ok(exec::Flow::Halt) => {
                self.instructions_retired += 1;
                self.mode = RunMode::Halted;
                StepExit::Halted
            }
            Err(exception) => {
                warn!(eip = format_args!("{start:#x}"), ?exception, "cpu exception");
                self.regs.eip = start;
                self.interrupt_shadow = shadow;
                if self.deliver(exception.vector(), start, bus) {
                    StepExit::Continue
                } else {
                    self.shutdown(exception.vector());
                    StepExit::Shutdown
                }
            }
        }
    }

    /// Deliver an external interrupt. Returns false if the CPU shut down instead.
    pub fn raise_interrupt<B: CpuBus>(&mut self, vector: u8, bus: &mut B) -> bool {
        if self.deliver(vector, self.regs.eip, bus) {
            true
        } else {
            self.shutdown(vector);
            false
        }
    }

    fn shutdown(&mut self, vector: u8) {
        warn!(vector, "interrupt vector not deliverable, cpu shut down");
        self.mode = RunMode::Shutdown;
    }

    /// Push EFLAGS and `return_eip`, clear IF and jump to the handler. False when the vector is
    /// outside the table, unmapped, or the stack is not writable.
    fn deliver<B: CpuBus>(&mut self, vector: u8, return_eip: u32, bus: &mut B) -> bool {
        let offset = u32::from(vector) * 4;
        if self.vector_limit == 0 || offset + 3 > u32::from(self.vector_limit) {
            return false;
        }
        let entry = u64::from(self.vector_base.wrapping_add(offset));
        let handler = match bus.read_u32(entry) {
            Ok(0) | Err(_) => return false,
            Ok(handler) => handler,
        };

        let esp = self.regs.reg(Gpr::Esp);
        let frame = esp.wrapping_sub(8);
        if bus
            .write_u32(u64::from(esp.wrapping_sub(4)), self.regs.eflags.bits())
            .is_err()
            || bus.write_u32(u64::from(frame), return_eip).is_err()
        {
            return false;
        }
        self.regs.set_reg(Gpr::Esp, frame);
        self.regs.eflags.remove(Eflags::IF);
        self.regs.eip = handler;
        self.interrupt_shadow = false;
        self.mode = RunMode::Running;
        true
    }

    pub fn to_state(&self) -> CpuState {
        CpuState {
            gpr: self.regs.gprs(),
            eip: self.regs.eip,
            eflags: self.regs.eflags.bits(),
            vector_base: self.vector_base,
            vector_limit: self.vector_limit,
            mode: self.mode.to_byte(),
            interrupt_shadow: self.interrupt_shadow,
            instructions_retired: self.instructions_retired,
        }
    }

    pub fn from_state(state: &CpuState) -> Result<Self, SnapshotError> {
        let mode = RunMode::from_byte(state.mode).ok_or(SnapshotError::Corrupt("cpu run mode"))?;
        let mut regs = RegisterFile::default();
        regs.set_gprs(state.gpr);
        regs.eip = state.eip;
        regs.eflags = Eflags::from_bits_truncate(state.eflags) | Eflags::RESERVED1;
        Ok(Self {
            regs,
            mode,
            vector_base: state.vector_base,
            vector_limit: state.vector_limit,
            interrupt_shadow: state.interrupt_shadow,
            instructions_retired: state.instructions_retired,
        })
    }
}
