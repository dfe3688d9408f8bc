use ember_devices::state::{StateReader, StateWriter};
use ember_devices::DeviceError;

pub const PIC_MASTER_CMD: u16 = 0x20;
pub const PIC_MASTER_DATA: u16 = 0x21;
pub const PIC_SLAVE_CMD: u16 = 0xA0;
pub const PIC_SLAVE_DATA: u16 = 0xA1;

/// Vector delivered for IRQ line 0; line `n` maps to `IRQ_VECTOR_BASE + n`.
pub const IRQ_VECTOR_BASE: u8 = 0x20;

/// Cascaded interrupt controller reduced to request and mask registers for 16 lines.
///
/// Lines are latched when a device raises them and cleared when the CPU accepts the
/// interrupt. Command-port writes (EOI) are accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pic {
    irr: u16,
    imr: u16,
}

impl Pic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, line: u8) {
        if line < 16 {
            self.irr |= 1 << line;
        }
    }

    /// Lowest-numbered requested line that is not masked.
    pub fn pending(&self) -> Option<u8> {
        let ready = self.irr & !self.imr;
        (ready != 0).then(|| ready.trailing_zeros() as u8)
    }

    pub fn acknowledge(&mut self, line: u8) {
        if line < 16 {
            self.irr &= !(1 << line);
        }
    }

    pub fn vector(line: u8) -> u8 {
        IRQ_VECTOR_BASE + line
    }

    pub fn mask(&self) -> u16 {
        self.imr
    }

    pub fn claims_port(port: u16) -> bool {
        matches!(
            port,
            PIC_MASTER_CMD | PIC_MASTER_DATA | PIC_SLAVE_CMD | PIC_SLAVE_DATA
        )
    }

    pub fn port_read(&self, port: u16) -> u8 {
        match port {
            PIC_MASTER_CMD => self.irr as u8,
            PIC_MASTER_DATA => self.imr as u8,
            PIC_SLAVE_CMD => (self.irr >> 8) as u8,
            PIC_SLAVE_DATA => (self.imr >> 8) as u8,
            _ => 0xFF,
        }
    }

    pub fn port_write(&mut self, port: u16, value: u8) {
        match port {
            PIC_MASTER_DATA => self.imr = (self.imr & 0xFF00) | u16::from(value),
            PIC_SLAVE_DATA => self.imr = (self.imr & 0x00FF) | (u16::from(value) << 8),
            _ => {}
        }
    }

    pub fn save_state(&self) -> Vec<u8> {
        StateWriter::new().u16(self.irr).u16(self.imr).finish()
    }

    pub fn load_state(bytes: &[u8]) -> Result<Self, DeviceError> {
        let mut r = StateReader::new(bytes);
        Ok(Self {
            irr: r.u16()?,
            imr: r.u16()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_unmasked_line_wins() {
        let mut pic = Pic::new();
        pic.raise(14);
        pic.raise(4);
        assert_eq!(pic.pending(), Some(4));

        pic.port_write(PIC_MASTER_DATA, 1 << 4);
        assert_eq!(pic.pending(), Some(14));
        assert_eq!(Pic::vector(14), 0x2E);

        pic.acknowledge(14);
        assert_eq!(pic.pending(), None);
        assert_eq!(pic.port_read(PIC_MASTER_CMD), 1 << 4);
    }

    #[test]
    fn eoi_is_ignored_and_state_round_trips() {
        let mut pic = Pic::new();
        pic.raise(0);
        pic.port_write(PIC_SLAVE_DATA, 0x40);
        pic.port_write(PIC_MASTER_CMD, 0x20);
        assert_eq!(pic.pending(), Some(0));

        let restored = Pic::load_state(&pic.save_state()).unwrap();
        assert_eq!(restored, pic);
        assert_eq!(restored.mask(), 0x4000);
        assert!(Pic::load_state(&[1]).is_err());
    }
}
