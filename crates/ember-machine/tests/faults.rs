mod common;

use common::*;
use ember_machine::mem::Gpr;
use ember_machine::storage::MemoryRangeProvider;
use ember_machine::{CpuExit, RunMode};

/// `mov ebx, 0x55; hlt`
const GP_HANDLER: [u8; 6] = [0xBB, 0x55, 0x00, 0x00, 0x00, 0xF4];

#[tokio::test]
async fn memory_fault_is_delivered_as_general_protection() {
    let provider = MemoryRangeProvider::new();
    let mut m = machine(&provider);
    let mut code = LIDT.to_vec();
    // mov eax, [0xffffff00]
    code.extend_from_slice(&[0xA1, 0x00, 0xFF, 0xFF, 0xFF, 0xF4]);
    load_program(&mut m, &code);
    m.memory_mut()
        .write_bytes(u64::from(HANDLER), &GP_HANDLER)
        .unwrap();
    install_vector(&mut m, 13, HANDLER);

    let report = m.step();
    assert_eq!(report.cpu_exit, CpuExit::Halted);
    assert_eq!(m.cpu().regs.reg(Gpr::Ebx), 0x55);

    // The frame points back at the faulting instruction.
    let esp = m.cpu().regs.reg(Gpr::Esp);
    assert_eq!(esp, STACK - 8);
    let return_eip = m.memory().read_u32(u64::from(esp)).unwrap();
    assert_eq!(return_eip, CODE + LIDT.len() as u32);

    assert!(m.save().is_ok());
}

#[tokio::test]
async fn undeliverable_fault_shuts_the_cpu_down_but_devices_keep_running() {
    let provider = MemoryRangeProvider::new();
    let mut m = machine(&provider);
    load_program(
        &mut m,
        &[
            0xB0, 0x34, 0xE6, 0x43, // PIT: rate generator
            0xB0, 0x10, 0xE6, 0x40, 0xB0, 0x00, 0xE6, 0x40, // reload 0x0010
            0x0F, 0x0B, // ud2
        ],
    );

    let report = m.step();
    assert_eq!(report.cpu_exit, CpuExit::Shutdown);
    assert_eq!(report.executed, 6);
    assert_eq!(m.cpu().mode(), RunMode::Shutdown);

    // IRQ0 keeps being latched even though the CPU will never take it.
    let report = m.step();
    assert_eq!(report.cpu_exit, CpuExit::Shutdown);
    assert_eq!(report.executed, 0);
    assert_eq!(report.irqs_raised, 1);
    assert_eq!(m.pic().pending(), Some(0));
    assert_eq!(m.steps(), 2);
}

#[tokio::test]
async fn rom_writes_are_dropped() {
    let provider = MemoryRangeProvider::new();
    let mut m = machine(&provider);
    m.memory_mut().load_rom(0xF_0000, &[0xAA; 16]).unwrap();
    load_program(
        &mut m,
        &[
            0xC6, 0x05, 0x00, 0x00, 0x0F, 0x00, 0x11, // mov byte [0xf0000], 0x11
            0xF4,
        ],
    );
    m.step();
    assert_eq!(m.memory().read_u8(0xF_0000).unwrap(), 0xAA);
    assert_eq!(m.cpu().mode(), RunMode::Halted);
}
