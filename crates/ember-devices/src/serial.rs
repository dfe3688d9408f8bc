use std::collections::VecDeque;

use crate::state::{StateReader, StateWriter};
use crate::{Device, DeviceContext, DeviceError, DeviceKind, TickOutcome, IRQ_SERIAL};

pub const COM1_BASE: u16 = 0x3F8;

const RX_FIFO_CAPACITY: usize = 4096;

const IER_RDA: u8 = 0x01;
const IER_THRE: u8 = 0x02;
const LCR_DLAB: u8 = 0x80;
const MCR_OUT2: u8 = 0x08;
const LSR_DR: u8 = 0x01;
const LSR_THRE_TEMT: u8 = 0x60;

/// 16550 UART. Transmitted bytes are collected for the host; received bytes are fed by the host.
#[derive(Debug, Clone)]
pub struct Serial16550 {
    base: u16,
    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    msr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,
    /// THR-empty interrupt waiting to be acknowledged by an IIR read or a THR write.
    thre_pending: bool,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl Serial16550 {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            ier: 0,
            fcr: 0,
            lcr: 0x03,
            mcr: 0,
            msr: 0,
            scr: 0,
            dll: 1,
            dlm: 0,
            thre_pending: false,
            rx: VecDeque::new(),
            tx: Vec::new(),
        }
    }

    /// Queue a byte from the host. Bytes beyond the FIFO capacity are dropped (overrun).
    pub fn push_rx(&mut self, byte: u8) {
        if self.rx.len() < RX_FIFO_CAPACITY {
            self.rx.push_back(byte);
        }
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    pub fn divisor(&self) -> u16 {
        u16::from_le_bytes([self.dll, self.dlm])
    }

    /// INTR output as wired on a PC: gated by `OUT2`.
    pub fn irq_level(&self) -> bool {
        self.interrupt_id().is_some() && (self.mcr & MCR_OUT2) != 0
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    fn fifo_enabled(&self) -> bool {
        (self.fcr & 0x01) != 0
    }

    /// Highest-priority pending interrupt, as the IIR id bits.
    fn interrupt_id(&self) -> Option<u8> {
        if (self.ier & IER_RDA) != 0 && !self.rx.is_empty() {
            Some(0x04)
        } else if (self.ier & IER_THRE) != 0 && self.thre_pending {
            Some(0x02)
        } else {
            None
        }
    }

    fn read_iir(&mut self) -> u8 {
        let fifo_bits = if self.fifo_enabled() { 0xC0 } else { 0x00 };
        match self.interrupt_id() {
            Some(0x02) => {
                self.thre_pending = false;
                fifo_bits | 0x02
            }
            Some(id) => fifo_bits | id,
            None => fifo_bits | 0x01,
        }
    }

    fn offset(&self, port: u16) -> Option<u16> {
        port.checked_sub(self.base).filter(|o| *o < 8)
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        let Some(off) = self.offset(port) else {
            return 0xFF;
        };
        match off {
            0 if self.dlab() => self.dll,
            0 => self.rx.pop_front().unwrap_or(0),
            1 if self.dlab() => self.dlm,
            1 => self.ier,
            2 => self.read_iir(),
            3 => self.lcr,
            4 => self.mcr,
            5 => {
                let mut lsr = LSR_THRE_TEMT;
                if !self.rx.is_empty() {
                    lsr |= LSR_DR;
                }
                lsr
            }
            6 => self.msr,
            _ => self.scr,
        }
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        let Some(off) = self.offset(port) else {
            return;
        };
        match off {
            0 if self.dlab() => self.dll = value,
            0 => {
                self.tx.push(value);
                // The transmitter drains instantly, so THR is empty again right away.
                self.thre_pending = true;
            }
            1 if self.dlab() => self.dlm = value,
            1 => {
                let enabling_thre = (value & IER_THRE) != 0 && (self.ier & IER_THRE) == 0;
                self.ier = value & 0x0F;
                if enabling_thre {
                    self.thre_pending = true;
                }
            }
            2 => {
                self.fcr = value;
                if (value & 0x02) != 0 {
                    self.rx.clear();
                }
            }
            3 => self.lcr = value,
            4 => self.mcr = value & 0x1F,
            7 => self.scr = value,
            _ => {}
        }
    }
}

impl Device for Serial16550 {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Serial
    }

    fn claims_port(&self, port: u16) -> bool {
        self.offset(port).is_some()
    }

    fn port_read(&mut self, port: u16, size: u8) -> u32 {
        match size {
            0 => 0,
            2 => {
                let lo = self.read_u8(port);
                let hi = self.read_u8(port.wrapping_add(1));
                u32::from(u16::from_le_bytes([lo, hi]))
            }
            4 => {
                let b0 = self.read_u8(port);
                let b1 = self.read_u8(port.wrapping_add(1));
                let b2 = self.read_u8(port.wrapping_add(2));
                let b3 = self.read_u8(port.wrapping_add(3));
                u32::from_le_bytes([b0, b1, b2, b3])
            }
            _ => u32::from(self.read_u8(port)),
        }
    }

    fn port_write(&mut self, port: u16, size: u8, value: u32) {
        let bytes = value.to_le_bytes();
        let n = match size {
            0 => 0,
            2 => 2,
            4 => 4,
            _ => 1,
        };
        for (i, byte) in bytes.iter().take(n).enumerate() {
            self.write_u8(port.wrapping_add(i as u16), *byte);
        }
    }

    fn tick(&mut self, _ctx: &mut DeviceContext<'_>) -> TickOutcome {
        TickOutcome::Idle
    }

    fn irq_line(&self) -> Option<u8> {
        Some(IRQ_SERIAL)
    }

    fn take_interrupt_request(&mut self) -> bool {
        self.irq_level()
    }

    fn is_quiescent(&self) -> bool {
        true
    }

    fn save_state(&self) -> Vec<u8> {
        let rx: Vec<u8> = self.rx.iter().copied().collect();
        let mut w = StateWriter::new();
        w.u8(self.ier)
            .u8(self.fcr)
            .u8(self.lcr)
            .u8(self.mcr)
            .u8(self.msr)
            .u8(self.scr)
            .u8(self.dll)
            .u8(self.dlm)
            .bool(self.thre_pending)
            .bytes(&rx);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut r = StateReader::new(bytes);
        self.ier = r.u8()?;
        self.fcr = r.u8()?;
        self.lcr = r.u8()?;
        self.mcr = r.u8()?;
        self.msr = r.u8()?;
        self.scr = r.u8()?;
        self.dll = r.u8()?;
        self.dlm = r.u8()?;
        self.thre_pending = r.bool()?;
        self.rx = r.bytes(RX_FIFO_CAPACITY)?.into();
        self.tx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size0_port_io_is_a_noop() {
        let mut uart = Serial16550::new(COM1_BASE);
        uart.push_rx(0xAB);

        assert_eq!(uart.port_read(COM1_BASE, 0), 0);
        assert_eq!(uart.port_read(COM1_BASE, 1) as u8, 0xAB);

        uart.port_write(COM1_BASE, 0, 0xCD);
        assert!(uart.take_tx().is_empty());
        uart.port_write(COM1_BASE, 1, 0xEF);
        assert_eq!(uart.take_tx(), vec![0xEF]);
    }

    #[test]
    fn divisor_latch_shadows_data_registers() {
        let mut uart = Serial16550::new(COM1_BASE);
        uart.write_u8(COM1_BASE + 3, 0x83);
        uart.write_u8(COM1_BASE, 0x0C);
        uart.write_u8(COM1_BASE + 1, 0x00);
        uart.write_u8(COM1_BASE + 3, 0x03);
        assert_eq!(uart.divisor(), 12);
        assert!(uart.take_tx().is_empty());
    }

    #[test]
    fn receive_interrupt_requires_out2() {
        let mut uart = Serial16550::new(COM1_BASE);
        uart.write_u8(COM1_BASE + 1, IER_RDA);
        uart.push_rx(b'x');
        assert!(!uart.irq_level());

        uart.write_u8(COM1_BASE + 4, MCR_OUT2);
        assert!(uart.irq_level());
        assert_eq!(uart.read_u8(COM1_BASE + 2) & 0x0F, 0x04);
        assert_eq!(uart.read_u8(COM1_BASE + 5) & LSR_DR, LSR_DR);

        assert_eq!(uart.read_u8(COM1_BASE), b'x');
        assert!(!uart.irq_level());
        assert_eq!(uart.read_u8(COM1_BASE + 2) & 0x0F, 0x01);
    }

    #[test]
    fn thre_interrupt_is_acknowledged_by_iir_read() {
        let mut uart = Serial16550::new(COM1_BASE);
        uart.write_u8(COM1_BASE + 4, MCR_OUT2);
        uart.write_u8(COM1_BASE + 1, IER_THRE);
        assert!(uart.irq_level());
        assert_eq!(uart.read_u8(COM1_BASE + 2) & 0x0F, 0x02);
        assert!(!uart.irq_level());

        uart.write_u8(COM1_BASE, b'!');
        assert!(uart.irq_level());
    }

    #[test]
    fn rx_fifo_survives_state_round_trip() {
        let mut uart = Serial16550::new(COM1_BASE);
        uart.write_u8(COM1_BASE + 1, IER_RDA);
        for b in b"hello" {
            uart.push_rx(*b);
        }

        let mut restored = Serial16550::new(COM1_BASE);
        restored.load_state(&uart.save_state()).unwrap();
        let received: Vec<u8> = (0..5).map(|_| restored.read_u8(COM1_BASE)).collect();
        assert_eq!(received, b"hello".to_vec());
    }
}
