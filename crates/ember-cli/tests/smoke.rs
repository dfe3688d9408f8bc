use std::path::Path;
use std::process::{Command, Output};

/// 64-byte BIOS whose reset vector prints `OK` on COM1 and halts.
fn write_bios(dir: &Path) {
    let mut image = vec![0x90u8; 64];
    let reset = image.len() - 16;
    image[reset..reset + 12].copy_from_slice(&[
        0xBA, 0xF8, 0x03, 0x00, 0x00, // mov edx, 0x3f8
        0xB0, b'O', // mov al, 'O'
        0xEE, // out dx, al
        0xB0, b'K', // mov al, 'K'
        0xEE, // out dx, al
        0xF4, // hlt
    ]);
    std::fs::write(dir.join("bios.bin"), image).expect("failed to write bios");
}

/// 128-byte BIOS that reads sector 0 of the primary disk with polled PIO and echoes its first
/// byte on COM1.
fn write_disk_bios(dir: &Path) {
    let mut image = vec![0x90u8; 128];
    let main = [
        0xBA, 0xF2, 0x01, 0x00, 0x00, // mov edx, 0x1f2
        0xB0, 0x01, // mov al, 1
        0xEE, // out dx, al
        0x42, 0xB0, 0x00, 0xEE, // lba 7:0
        0x42, 0xEE, // lba 15:8
        0x42, 0xEE, // lba 23:16
        0x42, 0xB0, 0xE0, 0xEE, // master, LBA mode
        0x42, 0xB0, 0x20, 0xEE, // READ SECTORS
        0xBA, 0xF7, 0x01, 0x00, 0x00, // wait: mov edx, 0x1f7
        0xEC, // in al, dx
        0xA8, 0x08, // test al, DRQ
        0x74, 0xF6, // jz wait
        0xBA, 0xF0, 0x01, 0x00, 0x00, // mov edx, 0x1f0
        0xED, // in eax, dx
        0xBA, 0xF8, 0x03, 0x00, 0x00, // mov edx, 0x3f8
        0xEE, // out dx, al
        0xF4, // hlt
    ];
    image[..main.len()].copy_from_slice(&main);
    let reset = image.len() - 16;
    let back = -(reset as i32 + 5);
    image[reset] = 0xE9; // jmp main
    image[reset + 1..reset + 5].copy_from_slice(&back.to_le_bytes());
    std::fs::write(dir.join("disk-bios.bin"), image).expect("failed to write bios");

    let mut disk = vec![0u8; 4096];
    disk[..2].copy_from_slice(b"D!");
    std::fs::write(dir.join("hda.img"), disk).expect("failed to write disk image");
}

fn run(dir: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("--root")
        .arg(dir)
        .args(["--bios", "bios.bin", "--memory-mib", "2", "--vga-memory-mib", "1"])
        .args(extra)
        .output()
        .expect("failed to run ember")
}

#[test]
fn boots_bios_and_prints_serial() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    write_bios(tmp.path());
    let snapshot = tmp.path().join("state.bin");

    let output = run(
        tmp.path(),
        &[
            "--steps",
            "3",
            "--snapshot-save",
            snapshot.to_str().expect("path should be UTF-8"),
        ],
    );
    assert!(
        output.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(output.stdout.windows(2).any(|w| w == b"OK"));

    let blob = std::fs::read(&snapshot).expect("snapshot should be written");
    assert!(blob.starts_with(b"EMBRSNAP"));
}

#[test]
fn missing_bios_fails() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let output = run(tmp.path(), &["--steps", "1"]);
    assert!(!output.status.success());
}

#[test]
fn disk_reads_complete_with_and_without_reproducible_stepping() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    write_disk_bios(tmp.path());

    for extra in [&["--reproducible"][..], &[][..]] {
        let output = Command::new(env!("CARGO_BIN_EXE_ember"))
            .arg("--root")
            .arg(tmp.path())
            .args(["--bios", "disk-bios.bin", "--hda", "hda.img"])
            .args(["--memory-mib", "2", "--vga-memory-mib", "1", "--steps", "2000"])
            .args(extra)
            .output()
            .expect("failed to run ember");
        assert!(
            output.status.success(),
            "{extra:?} stderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert_eq!(output.stdout, b"D", "{extra:?}");
    }
}
