use crate::state::{StateReader, StateWriter};
use crate::{Device, DeviceContext, DeviceError, DeviceKind, TickOutcome, IRQ_TIMER};

pub const PIT_CHANNEL0_PORT: u16 = 0x40;
pub const PIT_COMMAND_PORT: u16 = 0x43;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitMode {
    InterruptOnTerminalCount = 0,
    RateGenerator = 2,
    SquareWaveGenerator = 3,
}

impl PitMode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PitMode::InterruptOnTerminalCount),
            2 => Some(PitMode::RateGenerator),
            3 => Some(PitMode::SquareWaveGenerator),
            _ => None,
        }
    }

    fn periodic(self) -> bool {
        matches!(self, PitMode::RateGenerator | PitMode::SquareWaveGenerator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    LowOnly = 1,
    HighOnly = 2,
    LowHigh = 3,
}

impl Access {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Access::LowOnly),
            2 => Some(Access::HighOnly),
            3 => Some(Access::LowHigh),
            _ => None,
        }
    }
}

/// 8254 channel 0. Counts down `ticks_per_step` input clocks per scheduler tick and raises IRQ0
/// on terminal count.
#[derive(Debug, Clone)]
pub struct Pit {
    ticks_per_step: u32,
    mode: PitMode,
    access: Access,
    reload: u16,
    /// Clocks until terminal count, `1..=65536`.
    count: u32,
    counting: bool,
    fired: bool,
    pending_low: Option<u8>,
    read_high_next: bool,
    latched: Option<u16>,
    irq: bool,
}

impl Pit {
    pub fn new(ticks_per_step: u32) -> Self {
        Self {
            ticks_per_step,
            mode: PitMode::RateGenerator,
            access: Access::LowHigh,
            reload: 0,
            count: 65_536,
            counting: false,
            fired: false,
            pending_low: None,
            read_high_next: false,
            latched: None,
            irq: false,
        }
    }

    pub fn mode(&self) -> PitMode {
        self.mode
    }

    pub fn current_count(&self) -> u16 {
        (self.count & 0xFFFF) as u16
    }

    fn reload_ticks(&self) -> u32 {
        match self.reload {
            0 => 65_536,
            v => u32::from(v),
        }
    }

    /// Write to the command register (port 0x43).
    pub fn write_command(&mut self, value: u8) {
        if value >> 6 != 0 {
            return;
        }
        let access = (value >> 4) & 0b11;
        if access == 0 {
            // Counter latch command.
            if self.latched.is_none() {
                self.latched = Some(self.current_count());
                self.read_high_next = false;
            }
            return;
        }
        self.access = Access::from_u8(access).unwrap_or(Access::LowHigh);

        let mut mode = (value >> 1) & 0b111;
        if mode >= 6 {
            mode &= 0b11;
        }
        self.mode = PitMode::from_u8(mode).unwrap_or(PitMode::RateGenerator);
        self.counting = false;
        self.pending_low = None;
        self.read_high_next = false;
        self.latched = None;
    }

    /// Write to the channel 0 data port (0x40).
    pub fn write_channel0_data(&mut self, value: u8) {
        match self.access {
            Access::LowOnly => {
                self.reload = u16::from(value);
                self.arm();
            }
            Access::HighOnly => {
                self.reload = u16::from(value) << 8;
                self.arm();
            }
            Access::LowHigh => match self.pending_low.take() {
                None => self.pending_low = Some(value),
                Some(low) => {
                    self.reload = u16::from_le_bytes([low, value]);
                    self.arm();
                }
            },
        }
    }

    fn read_channel0_data(&mut self) -> u8 {
        let value = self.latched.unwrap_or_else(|| self.current_count());
        let [low, high] = value.to_le_bytes();
        match self.access {
            Access::LowOnly => {
                self.latched = None;
                low
            }
            Access::HighOnly => {
                self.latched = None;
                high
            }
            Access::LowHigh => {
                if self.read_high_next {
                    self.read_high_next = false;
                    self.latched = None;
                    high
                } else {
                    self.read_high_next = true;
                    low
                }
            }
        }
    }

    /// Count down one scheduler tick worth of input clocks.
    pub fn advance(&mut self) -> TickOutcome {
        if !self.counting || self.ticks_per_step == 0 {
            return TickOutcome::Idle;
        }
        let step = u64::from(self.ticks_per_step);
        let count = u64::from(self.count);
        if step < count {
            self.count = (count - step) as u32;
            return TickOutcome::Progressed;
        }

        if self.mode.periodic() {
            let period = u64::from(self.reload_ticks());
            self.count = (period - (step - count) % period) as u32;
            self.irq = true;
        } else {
            // One-shot: the counter keeps wrapping but only the first terminal count interrupts.
            self.count = (65_536 - (step - count) % 65_536) as u32;
            if !self.fired {
                self.fired = true;
                self.irq = true;
            }
        }
        TickOutcome::Progressed
    }

    fn arm(&mut self) {
        self.count = self.reload_ticks();
        self.counting = true;
        self.fired = false;
    }
}

impl Device for Pit {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Timer
    }

    fn claims_port(&self, port: u16) -> bool {
        (PIT_CHANNEL0_PORT..=PIT_COMMAND_PORT).contains(&port)
    }

    fn port_read(&mut self, port: u16, _size: u8) -> u32 {
        match port {
            PIT_CHANNEL0_PORT => u32::from(self.read_channel0_data()),
            _ => 0xFF,
        }
    }

    fn port_write(&mut self, port: u16, _size: u8, value: u32) {
        match port {
            PIT_CHANNEL0_PORT => self.write_channel0_data(value as u8),
            PIT_COMMAND_PORT => self.write_command(value as u8),
            _ => {}
        }
    }

    fn tick(&mut self, _ctx: &mut DeviceContext<'_>) -> TickOutcome {
        self.advance()
    }

    fn irq_line(&self) -> Option<u8> {
        Some(IRQ_TIMER)
    }

    fn take_interrupt_request(&mut self) -> bool {
        std::mem::take(&mut self.irq)
    }

    fn is_quiescent(&self) -> bool {
        true
    }

    fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();
        w.u8(self.mode as u8)
            .u8(self.access as u8)
            .u16(self.reload)
            .u32(self.count)
            .bool(self.counting)
            .bool(self.fired)
            .bool(self.pending_low.is_some())
            .u8(self.pending_low.unwrap_or(0))
            .bool(self.read_high_next)
            .bool(self.latched.is_some())
            .u16(self.latched.unwrap_or(0))
            .bool(self.irq);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let invalid = |reason| DeviceError::InvalidState {
            device: "timer",
            reason,
        };
        let mut r = StateReader::new(bytes);
        let mode = PitMode::from_u8(r.u8()?).ok_or_else(|| invalid("unknown mode"))?;
        let access = Access::from_u8(r.u8()?).ok_or_else(|| invalid("unknown access mode"))?;
        let reload = r.u16()?;
        let count = r.u32()?;
        if count == 0 || count > 65_536 {
            return Err(invalid("counter out of range"));
        }
        let counting = r.bool()?;
        let fired = r.bool()?;
        let has_low = r.bool()?;
        let low = r.u8()?;
        let read_high_next = r.bool()?;
        let has_latch = r.bool()?;
        let latch = r.u16()?;
        let irq = r.bool()?;

        *self = Self {
            ticks_per_step: self.ticks_per_step,
            mode,
            access,
            reload,
            count,
            counting,
            fired,
            pending_low: has_low.then_some(low),
            read_high_next,
            latched: has_latch.then_some(latch),
            irq,
        };
        Ok(())
    }
}
