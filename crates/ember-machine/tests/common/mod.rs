#![allow(dead_code)]

use std::sync::Arc;

use ember_machine::mem::Gpr;
use ember_machine::storage::{MemoryRangeProvider, StorageOptions};
use ember_machine::{Machine, MachineConfig};
use tokio::runtime::Handle;

pub const CODE: u32 = 0x1000;
pub const VECTORS: u32 = 0x2000;
pub const IDT_DESCRIPTOR: u32 = 0x2400;
pub const HANDLER: u32 = 0x1200;
pub const COUNTER: u32 = 0x3000;
pub const STACK: u32 = 0x9000;

pub fn config() -> MachineConfig {
    MachineConfig {
        memory_size: 2 * 1024 * 1024,
        vga_memory_size: 256 * 1024,
        autostart: false,
        storage: StorageOptions {
            chunk_size: 4096,
            read_ahead_chunks: 0,
            ..StorageOptions::default()
        },
        ..MachineConfig::default()
    }
}

pub fn disk_image() -> Vec<u8> {
    (0..16 * 4096).map(|i| (i * 13 % 251) as u8).collect()
}

pub fn machine(provider: &MemoryRangeProvider) -> Machine {
    Machine::new(config(), Arc::new(provider.clone()), Handle::current()).unwrap()
}

/// Copy `code` to [`CODE`] and point the CPU at it with a fresh stack.
pub fn load_program(machine: &mut Machine, code: &[u8]) {
    machine
        .memory_mut()
        .write_bytes(u64::from(CODE), code)
        .unwrap();
    let cpu = machine.cpu_mut();
    cpu.reset(CODE);
    cpu.regs.set_reg(Gpr::Esp, STACK);
}

/// Install `handler` for `vector` and a descriptor for `lidt [IDT_DESCRIPTOR]`.
pub fn install_vector(machine: &mut Machine, vector: u8, handler: u32) {
    let mem = machine.memory_mut();
    mem.write_u32(u64::from(VECTORS + u32::from(vector) * 4), handler)
        .unwrap();
    mem.write_u16(u64::from(IDT_DESCRIPTOR), 0xFF).unwrap();
    mem.write_u32(u64::from(IDT_DESCRIPTOR + 2), VECTORS).unwrap();
}

/// `lidt [IDT_DESCRIPTOR]`
pub const LIDT: [u8; 7] = [0x0F, 0x01, 0x1D, 0x00, 0x24, 0x00, 0x00];

/// Program the PIT for a 2000-clock rate generator, enable interrupts and idle in HLT.
pub fn timer_program() -> Vec<u8> {
    let mut code = LIDT.to_vec();
    code.extend_from_slice(&[
        0xB0, 0x34, // mov al, 0x34
        0xE6, 0x43, // out 0x43, al
        0xB0, 0xD0, // mov al, 0xd0
        0xE6, 0x40, // out 0x40, al
        0xB0, 0x07, // mov al, 0x07
        0xE6, 0x40, // out 0x40, al
        0xFB, // sti
        0xF4, // hlt
        0xEB, 0xFD, // jmp -3
    ]);
    code
}

/// `inc dword [COUNTER]; iret`
pub const COUNTING_HANDLER: [u8; 7] = [0xFF, 0x05, 0x00, 0x30, 0x00, 0x00, 0xCF];

/// A timer-driven machine: IRQ0 increments [`COUNTER`].
pub fn timer_machine(provider: &MemoryRangeProvider) -> Machine {
    let mut m = machine(provider);
    load_program(&mut m, &timer_program());
    m.memory_mut()
        .write_bytes(u64::from(HANDLER), &COUNTING_HANDLER)
        .unwrap();
    install_vector(&mut m, 0x20, HANDLER);
    m
}

pub fn counter(machine: &Machine) -> u32 {
    machine.memory().read_u32(u64::from(COUNTER)).unwrap()
}

/// Issue READ SECTORS for one sector at `lba` through the command block, then halt.
pub fn read_sector_program(lba: u8) -> Vec<u8> {
    vec![
        0xBA, 0xF2, 0x01, 0x00, 0x00, // mov edx, 0x1f2
        0xB0, 0x01, // mov al, 1
        0xEE, // out dx, al
        0x42, // inc edx (0x1f3)
        0xB0, lba, // mov al, lba
        0xEE, // out dx, al
        0x42, // inc edx (0x1f4)
        0xB0, 0x00, // mov al, 0
        0xEE, // out dx, al
        0x42, // inc edx (0x1f5)
        0xEE, // out dx, al
        0x42, // inc edx (0x1f6)
        0xB0, 0xE0, // mov al, 0xe0
        0xEE, // out dx, al
        0x42, // inc edx (0x1f7)
        0xB0, 0x20, // mov al, 0x20
        0xEE, // out dx, al
        0xF4, // hlt
    ]
}

/// Digest of everything guest-visible: RAM, registers, VRAM and scheduler position.
pub fn state_hash(machine: &Machine) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(machine.memory().as_slice());
    let cpu = machine.cpu();
    for reg in cpu.regs.gprs() {
        hasher.update(&reg.to_le_bytes());
    }
    hasher.update(&cpu.regs.eip.to_le_bytes());
    hasher.update(&cpu.regs.eflags.bits().to_le_bytes());
    hasher.update(&cpu.instructions_retired().to_le_bytes());
    hasher.update(machine.devices().vga.vram());
    hasher.update(&machine.steps().to_le_bytes());
    hasher.finalize()
}
