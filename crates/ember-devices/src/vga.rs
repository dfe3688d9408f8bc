use crate::state::{StateReader, StateWriter};
use crate::{Device, DeviceContext, DeviceError, DeviceKind, TickOutcome};

/// Legacy VGA memory window routed to VRAM.
pub const VGA_WINDOW_START: u32 = 0xA0000;
pub const VGA_WINDOW_END: u32 = 0xC0000;

pub const VGA_TEXT_COLS: usize = 80;
pub const VGA_TEXT_ROWS: usize = 25;

/// VRAM offset of the color text buffer (guest physical 0xB8000).
const TEXT_PLANE_OFFSET: usize = 0x18000;

const PORT_MISC_WRITE: u16 = 0x3C2;
const PORT_DAC_READ_INDEX: u16 = 0x3C7;
const PORT_DAC_WRITE_INDEX: u16 = 0x3C8;
const PORT_DAC_DATA: u16 = 0x3C9;
const PORT_MISC_READ: u16 = 0x3CC;
const PORT_CRTC_INDEX: u16 = 0x3D4;
const PORT_CRTC_DATA: u16 = 0x3D5;
const PORT_INPUT_STATUS1: u16 = 0x3DA;

const CRTC_REG_COUNT: usize = 25;
const CRTC_START_HI: usize = 0x0C;
const CRTC_START_LO: usize = 0x0D;
const CRTC_CURSOR_HI: usize = 0x0E;
const CRTC_CURSOR_LO: usize = 0x0F;

const STATUS1_DISPLAY_DISABLED: u8 = 0x01;
const STATUS1_VRETRACE: u8 = 0x08;

#[derive(Debug, Clone)]
pub struct Vga {
    vram: Vec<u8>,
    misc_output: u8,
    crtc_index: u8,
    crtc_regs: [u8; CRTC_REG_COUNT],

    /// 256 entries of 6-bit RGB.
    palette: [u8; 768],
    dac_write_index: u8,
    dac_read_index: u8,
    dac_component: u8,

    retrace_period: u32,
    retrace_counter: u32,
    in_retrace: bool,
}

impl Vga {
    pub fn new(vram_size: usize, retrace_period: u32) -> Self {
        Self {
            vram: vec![0; vram_size],
            misc_output: 0x67,
            crtc_index: 0,
            crtc_regs: [0; CRTC_REG_COUNT],
            palette: [0; 768],
            dac_write_index: 0,
            dac_read_index: 0,
            dac_component: 0,
            retrace_period,
            retrace_counter: 0,
            in_retrace: false,
        }
    }

    pub fn vram(&self) -> &[u8] {
        &self.vram
    }

    /// Replace VRAM wholesale. Video memory is snapshotted outside the register state.
    pub fn restore_vram(&mut self, vram: Vec<u8>) -> Result<(), DeviceError> {
        if vram.len() != self.vram.len() {
            return Err(DeviceError::InvalidState {
                device: "vga",
                reason: "VRAM size mismatch",
            });
        }
        self.vram = vram;
        Ok(())
    }

    pub fn in_retrace(&self) -> bool {
        self.in_retrace
    }

    /// Whether `addr` falls inside the legacy window.
    pub fn claims_addr(addr: u32) -> bool {
        (VGA_WINDOW_START..VGA_WINDOW_END).contains(&addr)
    }

    pub fn mem_read(&self, addr: u32) -> u8 {
        addr.checked_sub(VGA_WINDOW_START)
            .and_then(|off| self.vram.get(off as usize))
            .copied()
            .unwrap_or(0xFF)
    }

    pub fn mem_write(&mut self, addr: u32, value: u8) {
        if let Some(slot) = addr
            .checked_sub(VGA_WINDOW_START)
            .and_then(|off| self.vram.get_mut(off as usize))
        {
            *slot = value;
        }
    }

    pub fn start_address(&self) -> u16 {
        u16::from_be_bytes([self.crtc_regs[CRTC_START_HI], self.crtc_regs[CRTC_START_LO]])
    }

    pub fn cursor_position(&self) -> u16 {
        u16::from_be_bytes([self.crtc_regs[CRTC_CURSOR_HI], self.crtc_regs[CRTC_CURSOR_LO]])
    }

    /// 6-bit RGB for palette entry `index`.
    pub fn palette_entry(&self, index: u8) -> [u8; 3] {
        let base = usize::from(index) * 3;
        [self.palette[base], self.palette[base + 1], self.palette[base + 2]]
    }

    /// The 80x25 text plane as printable ASCII, one line per row with trailing blanks removed.
    pub fn text_snapshot(&self) -> String {
        let start = TEXT_PLANE_OFFSET + usize::from(self.start_address()) * 2;
        let mut rows = Vec::with_capacity(VGA_TEXT_ROWS);
        for row in 0..VGA_TEXT_ROWS {
            let line: String = (0..VGA_TEXT_COLS)
                .map(|col| {
                    let cell = start + (row * VGA_TEXT_COLS + col) * 2;
                    match self.vram.get(cell).copied() {
                        Some(ch @ 0x20..=0x7E) => char::from(ch),
                        _ => ' ',
                    }
                })
                .collect();
            rows.push(line.trim_end().to_string());
        }
        rows.join("\n")
    }

    /// Advance the retrace generator by one scheduler tick.
    pub fn advance(&mut self) -> TickOutcome {
        if self.retrace_period == 0 {
            return TickOutcome::Idle;
        }
        self.retrace_counter += 1;
        if self.retrace_counter >= self.retrace_period {
            self.retrace_counter = 0;
            self.in_retrace = !self.in_retrace;
        }
        TickOutcome::Progressed
    }

    fn read_u8(&mut self, port: u16) -> u8 {
        match port {
            PORT_MISC_READ => self.misc_output,
            PORT_DAC_WRITE_INDEX => self.dac_write_index,
            PORT_DAC_DATA => {
                let idx = usize::from(self.dac_read_index) * 3 + usize::from(self.dac_component);
                let value = self.palette[idx];
                self.dac_component += 1;
                if self.dac_component == 3 {
                    self.dac_component = 0;
                    self.dac_read_index = self.dac_read_index.wrapping_add(1);
                }
                value
            }
            PORT_CRTC_INDEX => self.crtc_index,
            PORT_CRTC_DATA => self
                .crtc_regs
                .get(usize::from(self.crtc_index))
                .copied()
                .unwrap_or(0xFF),
            PORT_INPUT_STATUS1 => {
                if self.in_retrace {
                    STATUS1_VRETRACE | STATUS1_DISPLAY_DISABLED
                } else {
                    0
                }
            }
            _ => 0xFF,
        }
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        match port {
            PORT_MISC_WRITE => self.misc_output = value,
            PORT_DAC_READ_INDEX => {
                self.dac_read_index = value;
                self.dac_component = 0;
            }
            PORT_DAC_WRITE_INDEX => {
                self.dac_write_index = value;
                self.dac_component = 0;
            }
            PORT_DAC_DATA => {
                let idx = usize::from(self.dac_write_index) * 3 + usize::from(self.dac_component);
                self.palette[idx] = value & 0x3F;
                self.dac_component += 1;
                if self.dac_component == 3 {
                    self.dac_component = 0;
                    self.dac_write_index = self.dac_write_index.wrapping_add(1);
                }
            }
            PORT_CRTC_INDEX => self.crtc_index = value,
            PORT_CRTC_DATA => {
                if let Some(reg) = self.crtc_regs.get_mut(usize::from(self.crtc_index)) {
                    *reg = value;
                }
            }
            _ => {}
        }
    }
}

impl Device for Vga {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Vga
    }

    fn claims_port(&self, port: u16) -> bool {
        matches!(port, 0x3C0..=0x3CF | PORT_CRTC_INDEX | PORT_CRTC_DATA | PORT_INPUT_STATUS1)
    }

    fn port_read(&mut self, port: u16, size: u8) -> u32 {
        match size {
            0 => 0,
            2 => {
                let lo = self.read_u8(port);
                let hi = self.read_u8(port.wrapping_add(1));
                u32::from(u16::from_le_bytes([lo, hi]))
            }
            _ => u32::from(self.read_u8(port)),
        }
    }

    fn port_write(&mut self, port: u16, size: u8, value: u32) {
        match size {
            0 => {}
            // Index/data pairs are commonly programmed with one 16-bit OUT.
            2 | 4 => {
                let [lo, hi, ..] = value.to_le_bytes();
                self.write_u8(port, lo);
                self.write_u8(port.wrapping_add(1), hi);
            }
            _ => self.write_u8(port, value as u8),
        }
    }

    fn tick(&mut self, _ctx: &mut DeviceContext<'_>) -> TickOutcome {
        self.advance()
    }

    fn irq_line(&self) -> Option<u8> {
        None
    }

    fn take_interrupt_request(&mut self) -> bool {
        false
    }

    fn is_quiescent(&self) -> bool {
        true
    }

    fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();
        w.u8(self.misc_output)
            .u8(self.crtc_index)
            .bytes(&self.crtc_regs)
            .bytes(&self.palette)
            .u8(self.dac_write_index)
            .u8(self.dac_read_index)
            .u8(self.dac_component)
            .u32(self.retrace_counter)
            .bool(self.in_retrace)
            .u64(self.vram.len() as u64);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let invalid = |reason| DeviceError::InvalidState {
            device: "vga",
            reason,
        };
        let mut r = StateReader::new(bytes);
        let misc_output = r.u8()?;
        let crtc_index = r.u8()?;
        let crtc_regs: [u8; CRTC_REG_COUNT] = r
            .bytes(CRTC_REG_COUNT)?
            .try_into()
            .map_err(|_| invalid("bad CRTC register count"))?;
        let palette: [u8; 768] = r
            .bytes(768)?
            .try_into()
            .map_err(|_| invalid("bad palette length"))?;
        let dac_write_index = r.u8()?;
        let dac_read_index = r.u8()?;
        let dac_component = r.u8()?;
        if dac_component > 2 {
            return Err(invalid("DAC component out of range"));
        }
        let retrace_counter = r.u32()?;
        let in_retrace = r.bool()?;
        if r.u64()? != self.vram.len() as u64 {
            return Err(invalid("VRAM size mismatch"));
        }

        self.misc_output = misc_output;
        self.crtc_index = crtc_index;
        self.crtc_regs = crtc_regs;
        self.palette = palette;
        self.dac_write_index = dac_write_index;
        self.dac_read_index = dac_read_index;
        self.dac_component = dac_component;
        self.retrace_counter = retrace_counter;
        self.in_retrace = in_retrace;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VRAM: usize = 256 * 1024;

    fn put_text(vga: &mut Vga, cell: u32, text: &str) {
        for (i, b) in text.bytes().enumerate() {
            let addr = 0xB8000 + (cell + i as u32) * 2;
            vga.mem_write(addr, b);
            vga.mem_write(addr + 1, 0x07);
        }
    }

    #[test]
    fn text_plane_renders_from_vram() {
        let mut vga = Vga::new(VRAM, 16);
        put_text(&mut vga, 0, "Booting");
        put_text(&mut vga, 80 + 2, "ok");
        vga.mem_write(0xB8000 + 81 * 2, 0x01);

        let text = vga.text_snapshot();
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), VGA_TEXT_ROWS);
        assert_eq!(lines[0], "Booting");
        assert_eq!(lines[1], "  ok");
        assert!(lines[2..].iter().all(|l| l.is_empty()));
    }

    #[test]
    fn start_address_scrolls_the_text_plane() {
        let mut vga = Vga::new(VRAM, 16);
        put_text(&mut vga, 0, "first");
        put_text(&mut vga, 80, "second");

        vga.port_write(PORT_CRTC_INDEX, 1, CRTC_START_HI as u32);
        vga.port_write(PORT_CRTC_DATA, 1, 0);
        vga.port_write(PORT_CRTC_INDEX, 2, (80 << 8) | CRTC_START_LO as u32);
        assert_eq!(vga.start_address(), 80);
        assert!(vga.text_snapshot().starts_with("second\n"));
    }

    #[test]
    fn cursor_registers_round_trip() {
        let mut vga = Vga::new(VRAM, 16);
        vga.port_write(PORT_CRTC_INDEX, 2, 0x0100 | CRTC_CURSOR_HI as u32);
        vga.port_write(PORT_CRTC_INDEX, 2, 0x4000 | CRTC_CURSOR_LO as u32);
        assert_eq!(vga.cursor_position(), 0x0140);
        vga.port_write(PORT_CRTC_INDEX, 1, CRTC_CURSOR_LO as u32);
        assert_eq!(vga.port_read(PORT_CRTC_DATA, 1), 0x40);
    }

    #[test]
    fn retrace_bit_toggles_every_period() {
        let mut vga = Vga::new(VRAM, 3);
        let samples: Vec<u32> = (0..7)
            .map(|_| {
                vga.advance();
                vga.port_read(PORT_INPUT_STATUS1, 1) & u32::from(STATUS1_VRETRACE)
            })
            .collect();
        assert_eq!(samples, vec![0, 0, 8, 8, 8, 0, 0]);
    }

    #[test]
    fn dac_writes_are_six_bit_and_auto_increment() {
        let mut vga = Vga::new(VRAM, 16);
        vga.port_write(PORT_DAC_WRITE_INDEX, 1, 5);
        for v in [0xFF, 0x20, 0x10, 1, 2, 3] {
            vga.port_write(PORT_DAC_DATA, 1, v);
        }
        assert_eq!(vga.palette_entry(5), [0x3F, 0x20, 0x10]);
        assert_eq!(vga.palette_entry(6), [1, 2, 3]);

        vga.port_write(PORT_DAC_READ_INDEX, 1, 6);
        let read: Vec<u32> = (0..3).map(|_| vga.port_read(PORT_DAC_DATA, 1)).collect();
        assert_eq!(read, vec![1, 2, 3]);
    }

    #[test]
    fn register_state_excludes_vram_and_rejects_size_mismatch() {
        let mut vga = Vga::new(VRAM, 16);
        put_text(&mut vga, 0, "saved");
        vga.port_write(PORT_MISC_WRITE, 1, 0x63);

        let bytes = vga.save_state();
        assert!(bytes.len() < 1024);

        let mut restored = Vga::new(VRAM, 16);
        restored.load_state(&bytes).unwrap();
        assert_eq!(restored.port_read(PORT_MISC_READ, 1), 0x63);
        restored.restore_vram(vga.vram().to_vec()).unwrap();
        assert_eq!(restored.text_snapshot(), vga.text_snapshot());

        let mut smaller = Vga::new(VRAM / 2, 16);
        assert!(smaller.load_state(&bytes).is_err());
        assert!(smaller.restore_vram(vga.vram().to_vec()).is_err());
    }

    #[test]
    fn accesses_outside_vram_are_ignored() {
        let mut vga = Vga::new(0x1000, 16);
        vga.mem_write(0xB8000, b'x');
        assert_eq!(vga.mem_read(0xB8000), 0xFF);
        assert!(vga.text_snapshot().split('\n').all(str::is_empty));
    }
}
