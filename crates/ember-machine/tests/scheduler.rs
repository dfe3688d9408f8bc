mod common;

use common::*;
use ember_machine::events::MachineEvent;
use ember_machine::mem::Gpr;
use ember_machine::storage::MemoryRangeProvider;
use ember_machine::{CpuExit, RunMode};

#[tokio::test]
async fn serial_output_reaches_the_host() {
    let provider = MemoryRangeProvider::new();
    let mut m = machine(&provider);
    load_program(
        &mut m,
        &[
            0xBE, 0x00, 0x11, 0x00, 0x00, // mov esi, 0x1100
            0xBA, 0xF8, 0x03, 0x00, 0x00, // mov edx, 0x3f8
            0x8A, 0x06, // mov al, [esi]
            0x84, 0xC0, // test al, al
            0x74, 0x04, // jz done
            0xEE, // out dx, al
            0x46, // inc esi
            0xEB, 0xF6, // jmp loop
            0xF4, // done: hlt
        ],
    );
    m.memory_mut().write_bytes(0x1100, b"hello\0").unwrap();

    let report = m.step();
    assert_eq!(report.cpu_exit, CpuExit::Halted);
    assert_eq!(m.take_serial_output(), b"hello".to_vec());
    assert_eq!(m.cpu().mode(), RunMode::Halted);
    assert_eq!(m.steps(), 1);
}

#[tokio::test]
async fn timer_interrupts_wake_a_halted_cpu() {
    let provider = MemoryRangeProvider::new();
    let mut m = timer_machine(&provider);

    // Step 1 runs the setup and halts; the PIT fires at the end of every second step and the
    // interrupt is taken at the start of the following one.
    for _ in 0..10 {
        m.step();
    }
    assert_eq!(counter(&m), 4);
    assert_eq!(m.cpu().mode(), RunMode::Halted);
    assert_eq!(m.cpu().regs.reg(Gpr::Esp), STACK);
    assert_eq!(m.pic().pending(), Some(0));
}

#[tokio::test]
async fn budget_bounds_each_cpu_slice() {
    let provider = MemoryRangeProvider::new();
    let mut m = machine(&provider);
    // l: inc eax; jmp l
    load_program(&mut m, &[0x40, 0xEB, 0xFD]);

    let report = m.step();
    let budget = u64::from(m.config().scheduler.instructions_per_step);
    assert_eq!(report.cpu_exit, CpuExit::Budget);
    assert_eq!(report.executed, budget);
    assert_eq!(u64::from(m.cpu().regs.reg(Gpr::Eax)), budget / 2);
}

#[tokio::test]
async fn ide_command_ends_the_cpu_slice() {
    let provider = MemoryRangeProvider::new();
    provider.insert("hda", disk_image());
    let mut m = machine(&provider);
    m.attach_disk("hda.img", "hda").await.unwrap();
    load_program(
        &mut m,
        &[
            0xBA, 0xF7, 0x01, 0x00, 0x00, // mov edx, 0x1f7
            0xB0, 0xEC, // mov al, 0xec (IDENTIFY)
            0xEE, // out dx, al
            0xF4, // hlt
        ],
    );

    let report = m.step();
    assert_eq!(report.cpu_exit, CpuExit::Yielded);
    assert_eq!(report.executed, 3);
    // The controller saw the command in the same step and raised IRQ14.
    assert_eq!(report.irqs_raised, 1);
    assert_eq!(m.pic().pending(), Some(14));

    assert_eq!(m.step().cpu_exit, CpuExit::Halted);
}

#[tokio::test]
async fn disk_read_makes_progress_while_the_cpu_runs() {
    let provider = MemoryRangeProvider::new();
    provider.insert("hda", disk_image());
    let mut m = machine(&provider);
    m.attach_disk("hda.img", "hda").await.unwrap();
    let mut rx = m.subscribe();
    load_program(&mut m, &read_sector_program(2));

    m.step();
    assert_eq!(m.devices().first_busy(), Some("ide"));

    // Keep stepping until the fetch task lands; the CPU never blocks on it.
    let mut steps = 1;
    while m.devices().first_busy().is_some() {
        tokio::task::yield_now().await;
        m.step();
        steps += 1;
        assert!(steps < 1_000, "disk read never completed");
    }
    assert_eq!(m.devices().ide.status() & 0x08, 0x08);

    let events = rx.drain();
    assert!(events.contains(&MachineEvent::IdeReadStart));
    assert!(events
        .iter()
        .any(|e| matches!(e, MachineEvent::DownloadProgress(p) if p.file_name == "hda.img")));
}

#[tokio::test]
async fn start_stop_and_run_slice() {
    let provider = MemoryRangeProvider::new();
    let mut m = timer_machine(&provider);
    let mut rx = m.subscribe();

    assert_eq!(m.run_slice(5), 0);
    m.start();
    m.start();
    assert!(m.is_running());
    assert_eq!(m.run_slice(5), 5);
    m.stop();
    assert_eq!(m.run_slice(5), 0);
    assert_eq!(m.steps(), 5);
    assert_eq!(rx.drain(), vec![MachineEvent::Started, MachineEvent::Stopped]);
}

#[tokio::test]
async fn host_hooks() {
    let provider = MemoryRangeProvider::new();
    let mut m = machine(&provider);
    let mut rx = m.subscribe();

    m.lock_pointer();
    assert!(m.pointer_lock_requested());
    assert_eq!(rx.drain(), vec![MachineEvent::PointerLockRequested]);

    // Byte fed by the host shows up in the receive buffer register.
    m.serial_input(b'k');
    load_program(
        &mut m,
        &[
            0xBA, 0xF8, 0x03, 0x00, 0x00, // mov edx, 0x3f8
            0xEC, // in al, dx
            0xF4, // hlt
        ],
    );
    m.step();
    assert_eq!(m.cpu().regs.reg8(0), b'k');

    // Text written to the VGA text plane.
    load_program(
        &mut m,
        &[
            0xC7, 0x05, 0x00, 0x80, 0x0B, 0x00, 0x4F, 0x07, 0x4B, 0x07, // mov [0xb8000], "OK"
            0xF4,
        ],
    );
    m.step();
    assert!(m.vga_text().starts_with("OK"));
}
