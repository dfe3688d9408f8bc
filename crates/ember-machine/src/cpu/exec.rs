use ember_mem::{Eflags, Gpr};

use super::alu;
use super::{Cpu, CpuBus, Exception};

pub(super) enum Flow {
    Next,
    Halt,
}

#[derive(Clone, Copy)]
enum Operand {
    Reg(u8),
    Mem(u64),
}

#[derive(Clone, Copy)]
struct ModRm {
    reg: u8,
    rm: Operand,
}

impl Cpu {
    fn fetch_u8<B: CpuBus>(&mut self, bus: &mut B) -> Result<u8, Exception> {
        let byte = bus.read_u8(u64::from(self.regs.eip))?;
        self.regs.eip = self.regs.eip.wrapping_add(1);
        Ok(byte)
    }

    fn fetch_u32<B: CpuBus>(&mut self, bus: &mut B) -> Result<u32, Exception> {
        let value = bus.read_u32(u64::from(self.regs.eip))?;
        self.regs.eip = self.regs.eip.wrapping_add(4);
        Ok(value)
    }

    fn fetch_rel8<B: CpuBus>(&mut self, bus: &mut B) -> Result<u32, Exception> {
        Ok(self.fetch_u8(bus)? as i8 as i32 as u32)
    }

    fn modrm<B: CpuBus>(&mut self, bus: &mut B) -> Result<ModRm, Exception> {
        let byte = self.fetch_u8(bus)?;
        let md = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        if md == 3 {
            return Ok(ModRm {
                reg,
                rm: Operand::Reg(rm),
            });
        }

        let mut addr = if rm == 4 {
            let sib = self.fetch_u8(bus)?;
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let base = sib & 7;
            let base_val = if base == 5 && md == 0 {
                self.fetch_u32(bus)?
            } else {
                self.regs.reg_by_index(base)
            };
            let index_val = if index == 4 {
                0
            } else {
                self.regs.reg_by_index(index) << scale
            };
            base_val.wrapping_add(index_val)
        } else if rm == 5 && md == 0 {
            self.fetch_u32(bus)?
        } else {
            self.regs.reg_by_index(rm)
        };

        match md {
            1 => addr = addr.wrapping_add(self.fetch_rel8(bus)?),
            2 => addr = addr.wrapping_add(self.fetch_u32(bus)?),
            _ => {}
        }
        Ok(ModRm {
            reg,
            rm: Operand::Mem(u64::from(addr)),
        })
    }

    fn read_rm<B: CpuBus>(&mut self, bus: &mut B, op: Operand, size: u32) -> Result<u32, Exception> {
        match (op, size) {
            (Operand::Reg(r), 1) => Ok(u32::from(self.regs.reg8(r))),
            (Operand::Reg(r), 2) => Ok(u32::from(self.regs.reg16(r))),
            (Operand::Reg(r), _) => Ok(self.regs.reg_by_index(r)),
            (Operand::Mem(a), 1) => Ok(u32::from(bus.read_u8(a)?)),
            (Operand::Mem(a), 2) => Ok(u32::from(bus.read_u16(a)?)),
            (Operand::Mem(a), _) => bus.read_u32(a),
        }
    }

    fn write_rm<B: CpuBus>(
        &mut self,
        bus: &mut B,
        op: Operand,
        size: u32,
        value: u32,
    ) -> Result<(), Exception> {
        match (op, size) {
            (Operand::Reg(r), 1) => self.regs.set_reg8(r, value as u8),
            (Operand::Reg(r), 2) => self.regs.set_reg16(r, value as u16),
            (Operand::Reg(r), _) => self.regs.set_reg_by_index(r, value),
            (Operand::Mem(a), 1) => bus.write_u8(a, value as u8)?,
            (Operand::Mem(a), 2) => bus.write_u16(a, value as u16)?,
            (Operand::Mem(a), _) => bus.write_u32(a, value)?,
        }
        Ok(())
    }

    fn read_reg(&self, index: u8, size: u32) -> u32 {
        match size {
            1 => u32::from(self.regs.reg8(index)),
            2 => u32::from(self.regs.reg16(index)),
            _ => self.regs.reg_by_index(index),
        }
    }

    fn write_reg(&mut self, index: u8, size: u32, value: u32) {
        match size {
            1 => self.regs.set_reg8(index, value as u8),
            2 => self.regs.set_reg16(index, value as u16),
            _ => self.regs.set_reg_by_index(index, value),
        }
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u32) -> Result<(), Exception> {
        let esp = self.regs.reg(Gpr::Esp).wrapping_sub(4);
        bus.write_u32(u64::from(esp), value)?;
        self.regs.set_reg(Gpr::Esp, esp);
        Ok(())
    }

    fn pop<B: CpuBus>(&mut self, bus: &mut B) -> Result<u32, Exception> {
        let esp = self.regs.reg(Gpr::Esp);
        let value = bus.read_u32(u64::from(esp))?;
        self.regs.set_reg(Gpr::Esp, esp.wrapping_add(4));
        Ok(value)
    }

    fn jump_relative(&mut self, rel: u32) {
        self.regs.eip = self.regs.eip.wrapping_add(rel);
    }

    /// Decode and execute one instruction at EIP.
    pub(super) fn execute<B: CpuBus>(&mut self, bus: &mut B) -> Result<Flow, Exception> {
        let mut opcode = self.fetch_u8(bus)?;
        let mut wide16 = false;
        while opcode == 0x66 {
            wide16 = true;
            opcode = self.fetch_u8(bus)?;
        }
        let size_v: u32 = if wide16 { 2 } else { 4 };

        if wide16 && !matches!(opcode, 0xE5 | 0xE7 | 0xED | 0xEF) {
            return Err(Exception::InvalidOpcode { opcode });
        }

        match opcode {
            // ALU r/m,reg / reg,r/m / acc,imm rows.
            0x00..=0x3F if opcode & 7 <= 5 => {
                let op = opcode >> 3;
                let size = if opcode & 1 == 0 { 1 } else { 4 };
                match opcode & 7 {
                    0 | 1 => {
                        let m = self.modrm(bus)?;
                        let dest = self.read_rm(bus, m.rm, size)?;
                        let src = self.read_reg(m.reg, size);
                        if let Some(r) = alu::group1(&mut self.regs.eflags, op, dest, src, size) {
                            self.write_rm(bus, m.rm, size, r)?;
                        }
                    }
                    2 | 3 => {
                        let m = self.modrm(bus)?;
                        let src = self.read_rm(bus, m.rm, size)?;
                        let dest = self.read_reg(m.reg, size);
                        if let Some(r) = alu::group1(&mut self.regs.eflags, op, dest, src, size) {
                            self.write_reg(m.reg, size, r);
                        }
                    }
                    _ => {
                        let src = if size == 1 {
                            u32::from(self.fetch_u8(bus)?)
                        } else {
                            self.fetch_u32(bus)?
                        };
                        let dest = self.read_reg(0, size);
                        if let Some(r) = alu::group1(&mut self.regs.eflags, op, dest, src, size) {
                            self.write_reg(0, size, r);
                        }
                    }
                }
            }
            0x0F => return self.execute_0f(bus),
            0x40..=0x4F => {
                let index = opcode & 7;
                let value = self.regs.reg_by_index(index);
                let r = alu::inc_dec_with_flags(&mut self.regs.eflags, value, opcode >= 0x48, 4);
                self.regs.set_reg_by_index(index, r);
            }
            0x50..=0x57 => {
                let value = self.regs.reg_by_index(opcode & 7);
                self.push(bus, value)?;
            }
            0x58..=0x5F => {
                let value = self.pop(bus)?;
                self.regs.set_reg_by_index(opcode & 7, value);
            }
            0x68 => {
                let value = self.fetch_u32(bus)?;
                self.push(bus, value)?;
            }
            0x6A => {
                let value = self.fetch_rel8(bus)?;
                self.push(bus, value)?;
            }
            0x70..=0x7F => {
                let rel = self.fetch_rel8(bus)?;
                if alu::condition(self.regs.eflags, opcode & 0xF) {
                    self.jump_relative(rel);
                }
            }
            0x80 | 0x81 | 0x83 => {
                let size = if opcode == 0x80 { 1 } else { 4 };
                let m = self.modrm(bus)?;
                let imm = match opcode {
                    0x80 => u32::from(self.fetch_u8(bus)?),
                    0x81 => self.fetch_u32(bus)?,
                    _ => self.fetch_rel8(bus)?,
                };
                let dest = self.read_rm(bus, m.rm, size)?;
                if let Some(r) = alu::group1(&mut self.regs.eflags, m.reg, dest, imm, size) {
                    self.write_rm(bus, m.rm, size, r)?;
                }
            }
            0x84 | 0x85 => {
                let size = if opcode == 0x84 { 1 } else { 4 };
                let m = self.modrm(bus)?;
                let a = self.read_rm(bus, m.rm, size)?;
                let b = self.read_reg(m.reg, size);
                alu::logic_with_flags(&mut self.regs.eflags, a & b, size);
            }
            0x88..=0x8B => {
                let size = if opcode & 1 == 0 { 1 } else { 4 };
                let m = self.modrm(bus)?;
                if opcode & 2 == 0 {
                    let value = self.read_reg(m.reg, size);
                    self.write_rm(bus, m.rm, size, value)?;
                } else {
                    let value = self.read_rm(bus, m.rm, size)?;
                    self.write_reg(m.reg, size, value);
                }
            }
            0x8D => {
                let m = self.modrm(bus)?;
                match m.rm {
                    Operand::Mem(addr) => self.regs.set_reg_by_index(m.reg, addr as u32),
                    Operand::Reg(_) => return Err(Exception::InvalidOpcode { opcode }),
                }
            }
            0x90 => {}
            0xA0..=0xA3 => {
                let size = if opcode & 1 == 0 { 1 } else { 4 };
                let addr = Operand::Mem(u64::from(self.fetch_u32(bus)?));
                if opcode < 0xA2 {
                    let value = self.read_rm(bus, addr, size)?;
                    self.write_reg(0, size, value);
                } else {
                    let value = self.read_reg(0, size);
                    self.write_rm(bus, addr, size, value)?;
                }
            }
            0xA8 => {
                let imm = u32::from(self.fetch_u8(bus)?);
                let al = self.read_reg(0, 1);
                alu::logic_with_flags(&mut self.regs.eflags, al & imm, 1);
            }
            0xA9 => {
                let imm = self.fetch_u32(bus)?;
                let eax = self.regs.reg(Gpr::Eax);
                alu::logic_with_flags(&mut self.regs.eflags, eax & imm, 4);
            }
            0xB0..=0xB7 => {
                let imm = self.fetch_u8(bus)?;
                self.regs.set_reg8(opcode & 7, imm);
            }
            0xB8..=0xBF => {
                let imm = self.fetch_u32(bus)?;
                self.regs.set_reg_by_index(opcode & 7, imm);
            }
            0xC3 => {
                self.regs.eip = self.pop(bus)?;
            }
            0xC6 | 0xC7 => {
                let size = if opcode == 0xC6 { 1 } else { 4 };
                let m = self.modrm(bus)?;
                if m.reg != 0 {
                    return Err(Exception::InvalidOpcode { opcode });
                }
                let imm = if size == 1 {
                    u32::from(self.fetch_u8(bus)?)
                } else {
                    self.fetch_u32(bus)?
                };
                self.write_rm(bus, m.rm, size, imm)?;
            }
            0xCD => {
                let vector = self.fetch_u8(bus)?;
                let return_eip = self.regs.eip;
                if !self.deliver(vector, return_eip, bus) {
                    let entry = self.vector_base.wrapping_add(u32::from(vector) * 4);
                    return Err(Exception::GeneralProtection {
                        addr: u64::from(entry),
                    });
                }
            }
            0xCF => {
                let esp = self.regs.reg(Gpr::Esp);
                let eip = bus.read_u32(u64::from(esp))?;
                let eflags = bus.read_u32(u64::from(esp.wrapping_add(4)))?;
                self.regs.set_reg(Gpr::Esp, esp.wrapping_add(8));
                self.regs.eip = eip;
                self.regs.eflags = Eflags::from_bits_truncate(eflags) | Eflags::RESERVED1;
            }
            0xE4..=0xE7 | 0xEC..=0xEF => {
                let port = if opcode < 0xE8 {
                    u16::from(self.fetch_u8(bus)?)
                } else {
                    self.regs.reg16(Gpr::Edx as u8)
                };
                let size = if opcode & 1 == 0 { 1 } else { size_v };
                if opcode & 2 == 0 {
                    let value = bus.io_read(port, size as u8);
                    self.write_reg(0, size, value);
                } else {
                    let value = self.read_reg(0, size);
                    bus.io_write(port, size as u8, value);
                }
            }
            0xE8 => {
                let rel = self.fetch_u32(bus)?;
                let return_eip = self.regs.eip;
                self.push(bus, return_eip)?;
                self.jump_relative(rel);
            }
            0xE9 => {
                let rel = self.fetch_u32(bus)?;
                self.jump_relative(rel);
            }
            0xEB => {
                let rel = self.fetch_rel8(bus)?;
                self.jump_relative(rel);
            }
            0xF4 => return Ok(Flow::Halt),
            0xF5 => {
                let cf = self.regs.flag(Eflags::CF);
                self.regs.set_flag(Eflags::CF, !cf);
            }
            0xF8 => self.regs.set_flag(Eflags::CF, false),
            0xF9 => self.regs.set_flag(Eflags::CF, true),
            0xFA => self.regs.set_flag(Eflags::IF, false),
            0xFB => {
                if !self.regs.flag(Eflags::IF) {
                    self.interrupt_shadow = true;
                }
                self.regs.set_flag(Eflags::IF, true);
            }
            0xFC => self.regs.set_flag(Eflags::DF, false),
            0xFD => self.regs.set_flag(Eflags::DF, true),
            0xFE => {
                let m = self.modrm(bus)?;
                if m.reg > 1 {
                    return Err(Exception::InvalidOpcode { opcode });
                }
                let value = self.read_rm(bus, m.rm, 1)?;
                let r = alu::inc_dec_with_flags(&mut self.regs.eflags, value, m.reg == 1, 1);
                self.write_rm(bus, m.rm, 1, r)?;
            }
            0xFF => {
                let m = self.modrm(bus)?;
                let value = self.read_rm(bus, m.rm, 4)?;
                match m.reg {
                    0 | 1 => {
                        let r =
                            alu::inc_dec_with_flags(&mut self.regs.eflags, value, m.reg == 1, 4);
                        self.write_rm(bus, m.rm, 4, r)?;
                    }
                    2 => {
                        let return_eip = self.regs.eip;
                        self.push(bus, return_eip)?;
                        self.regs.eip = value;
                    }
                    4 => self.regs.eip = value,
                    6 => self.push(bus, value)?,
                    _ => return Err(Exception::InvalidOpcode { opcode }),
                }
            }
            _ => return Err(Exception::InvalidOpcode { opcode }),
        }
        Ok(Flow::Next)
    }

    fn execute_0f<B: CpuBus>(&mut self, bus: &mut B) -> Result<Flow, Exception> {
        let opcode = self.fetch_u8(bus)?;
        match opcode {
            0x01 => {
                let m = self.modrm(bus)?;
                match (m.reg, m.rm) {
                    (3, Operand::Mem(addr)) => {
                        let limit = bus.read_u16(addr)?;
                        let base = bus.read_u32(addr + 2)?;
                        self.set_vector_table(base, limit);
                    }
                    _ => return Err(Exception::InvalidOpcode { opcode }),
                }
            }
            0x80..=0x8F => {
                let rel = self.fetch_u32(bus)?;
                if alu::condition(self.regs.eflags, opcode & 0xF) {
                    self.jump_relative(rel);
                }
            }
            0xB6 | 0xB7 => {
                let size = if opcode == 0xB6 { 1 } else { 2 };
                let m = self.modrm(bus)?;
                let value = self.read_rm(bus, m.rm, size)?;
                self.regs.set_reg_by_index(m.reg, value);
            }
            _ => return Err(Exception::InvalidOpcode { opcode }),
        }
        Ok(Flow::Next)
    }
}
