use ember_devices::{DeviceSet, IDE_CMD_BASE, VGA_WINDOW_END, VGA_WINDOW_START};
use ember_mem::GuestMemory;
use tracing::trace;

use crate::cpu::{CpuBus, Exception};
use crate::pic::Pic;

/// Port write that starts an IDE command; the CPU slice ends after it so the controller sees
/// the command on the same macro-step.
const IDE_COMMAND_PORT: u16 = IDE_CMD_BASE + 7;

/// The CPU's view of the platform: guest RAM with the legacy VGA window carved out, and the
/// port space shared by the PIC and the device set.
pub(crate) struct PlatformBus<'a> {
    pub mem: &'a mut GuestMemory,
    pub devices: &'a mut DeviceSet,
    pub pic: &'a mut Pic,
    yield_requested: bool,
}

impl<'a> PlatformBus<'a> {
    pub fn new(mem: &'a mut GuestMemory, devices: &'a mut DeviceSet, pic: &'a mut Pic) -> Self {
        Self {
            mem,
            devices,
            pic,
            yield_requested: false,
        }
    }

    fn touches_vga(addr: u64, len: u64) -> bool {
        addr < u64::from(VGA_WINDOW_END) && addr.saturating_add(len) > u64::from(VGA_WINDOW_START)
    }

    fn read_bytewise<const N: usize>(&mut self, addr: u64) -> Result<[u8; N], Exception> {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read_u8(addr + i as u64)?;
        }
        Ok(out)
    }

    fn write_bytewise(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Exception> {
        for (i, byte) in bytes.iter().enumerate() {
            self.write_u8(addr + i as u64, *byte)?;
        }
        Ok(())
    }
}

fn open_bus(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => u32::MAX,
    }
}

impl CpuBus for PlatformBus<'_> {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        if Self::touches_vga(addr, 1) {
            return Ok(self.devices.vga.mem_read(addr as u32));
        }
        Ok(self.mem.read_u8(addr)?)
    }

    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception> {
        if Self::touches_vga(addr, 2) {
            return Ok(u16::from_le_bytes(self.read_bytewise(addr)?));
        }
        Ok(self.mem.read_u16(addr)?)
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception> {
        if Self::touches_vga(addr, 4) {
            return Ok(u32::from_le_bytes(self.read_bytewise(addr)?));
        }
        Ok(self.mem.read_u32(addr)?)
    }

    fn write_u8(&mut self, addr: u64, val: u8) -> Result<(), Exception> {
        if Self::touches_vga(addr, 1) {
            self.devices.vga.mem_write(addr as u32, val);
            return Ok(());
        }
        Ok(self.mem.write_u8(addr, val)?)
    }

    fn write_u16(&mut self, addr: u64, val: u16) -> Result<(), Exception> {
        if Self::touches_vga(addr, 2) {
            return self.write_bytewise(addr, &val.to_le_bytes());
        }
        Ok(self.mem.write_u16(addr, val)?)
    }

    fn write_u32(&mut self, addr: u64, val: u32) -> Result<(), Exception> {
        if Self::touches_vga(addr, 4) {
            return self.write_bytewise(addr, &val.to_le_bytes());
        }
        Ok(self.mem.write_u32(addr, val)?)
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        if Pic::claims_port(port) {
            return u32::from(self.pic.port_read(port));
        }
        self.devices.port_read(port, size).unwrap_or_else(|| {
            trace!(port = format_args!("{port:#x}"), size, "read from unclaimed port");
            open_bus(size)
        })
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) {
        if Pic::claims_port(port) {
            self.pic.port_write(port, val as u8);
            return;
        }
        if !self.devices.port_write(port, size, val) {
            trace!(port = format_args!("{port:#x}"), size, val, "write to unclaimed port");
        }
        if port == IDE_COMMAND_PORT {
            self.yield_requested = true;
        }
    }

    fn take_yield_request(&mut self) -> bool {
        std::mem::take(&mut self.yield_requested)
    }
}
