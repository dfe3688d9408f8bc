use bitflags::bitflags;

bitflags! {
    /// The subset of EFLAGS the interpreter maintains.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        /// Always reads as one.
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

impl Default for Eflags {
    fn default() -> Self {
        Eflags::RESERVED1
    }
}

/// 32-bit general purpose registers in encoding order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterFile {
    gpr: [u32; 8],
    pub eip: u32,
    pub eflags: Eflags,
}

impl RegisterFile {
    pub fn reg(&self, reg: Gpr) -> u32 {
        self.gpr[reg as usize]
    }

    pub fn set_reg(&mut self, reg: Gpr, value: u32) {
        self.gpr[reg as usize] = value;
    }

    pub fn reg_by_index(&self, index: u8) -> u32 {
        self.gpr[(index & 7) as usize]
    }

    pub fn set_reg_by_index(&mut self, index: u8, value: u32) {
        self.gpr[(index & 7) as usize] = value;
    }

    /// Low 16 bits of a register (AX, CX, ...).
    pub fn reg16(&self, index: u8) -> u16 {
        self.reg_by_index(index) as u16
    }

    pub fn set_reg16(&mut self, index: u8, value: u16) {
        let old = self.reg_by_index(index);
        self.set_reg_by_index(index, (old & 0xFFFF_0000) | u32::from(value));
    }

    /// 8-bit register by encoding: 0-3 = AL,CL,DL,BL; 4-7 = AH,CH,DH,BH.
    pub fn reg8(&self, index: u8) -> u8 {
        let index = index & 7;
        if index < 4 {
            self.gpr[index as usize] as u8
        } else {
            (self.gpr[(index - 4) as usize] >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, index: u8, value: u8) {
        let index = index & 7;
        if index < 4 {
            let r = &mut self.gpr[index as usize];
            *r = (*r & !0xFF) | u32::from(value);
        } else {
            let r = &mut self.gpr[(index - 4) as usize];
            *r = (*r & !0xFF00) | (u32::from(value) << 8);
        }
    }

    pub fn gprs(&self) -> [u32; 8] {
        self.gpr
    }

    pub fn set_gprs(&mut self, gpr: [u32; 8]) {
        self.gpr = gpr;
    }

    pub fn flag(&self, flag: Eflags) -> bool {
        self.eflags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: Eflags, on: bool) {
        self.eflags.set(flag, on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_registers_alias_low_and_high_halves() {
        let mut regs = RegisterFile::default();
        regs.set_reg(Gpr::Eax, 0x1122_3344);
        assert_eq!(regs.reg8(0), 0x44);
        assert_eq!(regs.reg8(4), 0x33);

        regs.set_reg8(4, 0xAB);
        regs.set_reg16(1, 0xBEEF);
        assert_eq!(regs.reg(Gpr::Eax), 0x1122_AB44);
        assert_eq!(regs.reg(Gpr::Ecx), 0x0000_BEEF);
    }

    #[test]
    fn eflags_reserved_bit_is_set_by_default() {
        assert_eq!(RegisterFile::default().eflags.bits(), 0x2);
    }
}
