use ember_mem::Eflags;

fn mask_for_size(size: u32) -> u32 {
    if size >= 4 {
        u32::MAX
    } else {
        (1u32 << (size * 8)) - 1
    }
}

fn sign_bit(size: u32) -> u32 {
    1u32 << (size * 8 - 1)
}

fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn set_result_flags(flags: &mut Eflags, result: u32, size: u32) {
    flags.set(Eflags::ZF, result == 0);
    flags.set(Eflags::SF, (result & sign_bit(size)) != 0);
    flags.set(Eflags::PF, parity(result as u8));
}

pub fn add_with_flags(flags: &mut Eflags, dest: u32, src: u32, carry_in: bool, size: u32) -> u32 {
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let src = src & mask;
    let full = u64::from(dest) + u64::from(src) + u64::from(carry_in);
    let result = (full as u32) & mask;

    flags.set(Eflags::CF, full > u64::from(mask));
    flags.set(
        Eflags::OF,
        ((dest ^ result) & (src ^ result) & sign_bit(size)) != 0,
    );
    set_result_flags(flags, result, size);
    result
}

pub fn sub_with_flags(flags: &mut Eflags, dest: u32, src: u32, borrow_in: bool, size: u32) -> u32 {
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let src = src & mask;
    let src2 = src.wrapping_add(u32::from(borrow_in)) & mask;
    let subtrahend = u64::from(src) + u64::from(borrow_in);
    let result = (u64::from(dest).wrapping_sub(subtrahend) as u32) & mask;

    flags.set(Eflags::CF, u64::from(dest) < subtrahend);
    flags.set(
        Eflags::OF,
        ((dest ^ src2) & (dest ^ result) & sign_bit(size)) != 0,
    );
    set_result_flags(flags, result, size);
    result
}

pub fn logic_with_flags(flags: &mut Eflags, result: u32, size: u32) -> u32 {
    let result = result & mask_for_size(size);
    flags.remove(Eflags::CF | Eflags::OF);
    set_result_flags(flags, result, size);
    result
}

/// INC/DEC: like ADD/SUB with 1 but CF is preserved.
pub fn inc_dec_with_flags(flags: &mut Eflags, value: u32, dec: bool, size: u32) -> u32 {
    let carry = flags.contains(Eflags::CF);
    let result = if dec {
        sub_with_flags(flags, value, 1, false, size)
    } else {
        add_with_flags(flags, value, 1, false, size)
    };
    flags.set(Eflags::CF, carry);
    result
}

/// Group-1 operation `op` (ADD, OR, ADC, SBB, AND, SUB, XOR, CMP). `None` when the result is
/// not written back (CMP).
pub fn group1(flags: &mut Eflags, op: u8, dest: u32, src: u32, size: u32) -> Option<u32> {
    let carry = flags.contains(Eflags::CF);
    match op & 7 {
        0 => Some(add_with_flags(flags, dest, src, false, size)),
        1 => Some(logic_with_flags(flags, dest | src, size)),
        2 => Some(add_with_flags(flags, dest, src, carry, size)),
        3 => Some(sub_with_flags(flags, dest, src, carry, size)),
        4 => Some(logic_with_flags(flags, dest & src, size)),
        5 => Some(sub_with_flags(flags, dest, src, false, size)),
        6 => Some(logic_with_flags(flags, dest ^ src, size)),
        _ => {
            sub_with_flags(flags, dest, src, false, size);
            None
        }
    }
}

/// Jcc / SETcc condition code.
pub fn condition(flags: Eflags, cc: u8) -> bool {
    let cf = flags.contains(Eflags::CF);
    let zf = flags.contains(Eflags::ZF);
    let sf = flags.contains(Eflags::SF);
    let of = flags.contains(Eflags::OF);
    let pf = flags.contains(Eflags::PF);
    let taken = match (cc >> 1) & 7 {
        0 => of,
        1 => cf,
        2 => zf,
        3 => cf || zf,
        4 => sf,
        5 => pf,
        6 => sf != of,
        _ => zf || (sf != of),
    };
    taken != ((cc & 1) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut flags = Eflags::default();
        assert_eq!(add_with_flags(&mut flags, 0xFF, 1, false, 1), 0);
        assert!(flags.contains(Eflags::CF | Eflags::ZF));
        assert!(!flags.contains(Eflags::OF));

        assert_eq!(add_with_flags(&mut flags, 0x7FFF_FFFF, 1, false, 4), 0x8000_0000);
        assert!(flags.contains(Eflags::OF | Eflags::SF));
        assert!(!flags.contains(Eflags::CF));
    }

    #[test]
    fn sub_borrow_and_signed_conditions() {
        let mut flags = Eflags::default();
        assert_eq!(sub_with_flags(&mut flags, 1, 2, false, 4), u32::MAX);
        assert!(flags.contains(Eflags::CF | Eflags::SF));
        // 1 < 2 both unsigned (B) and signed (L).
        assert!(condition(flags, 0x2));
        assert!(condition(flags, 0xC));
        assert!(!condition(flags, 0x4));
        assert!(condition(flags, 0x5));
    }

    #[test]
    fn inc_keeps_carry() {
        let mut flags = Eflags::default() | Eflags::CF;
        assert_eq!(inc_dec_with_flags(&mut flags, u32::MAX, false, 4), 0);
        assert!(flags.contains(Eflags::CF | Eflags::ZF));
        let mut flags = Eflags::default();
        assert_eq!(inc_dec_with_flags(&mut flags, 0, true, 4), u32::MAX);
        assert!(!flags.contains(Eflags::CF));
    }

    #[test]
    fn cmp_does_not_write_back() {
        let mut flags = Eflags::default();
        assert_eq!(group1(&mut flags, 7, 5, 5, 4), None);
        assert!(flags.contains(Eflags::ZF));
        assert_eq!(group1(&mut flags, 6, 0xF0, 0xFF, 1), Some(0x0F));
        assert!(!flags.contains(Eflags::CF));
    }
}
