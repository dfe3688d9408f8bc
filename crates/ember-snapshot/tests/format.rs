use ember_snapshot::{
    restore_snapshot, restore_snapshot_checked, save_snapshot, Compression, CpuState, DeviceId, DeviceState, DiskChunkTable,
    RamMode, RamWriteOptions, RestoreOptions, Result, SaveOptions, SnapshotError, SnapshotMeta, SnapshotSource,
    SnapshotTarget, HEADER_LEN, SNAPSHOT_VERSION_CURRENT,
};

#[derive(Clone, Default)]
struct Machine {
    meta: Option<SnapshotMeta>,
    cpu: CpuState,
    devices: Vec<DeviceState>,
    disks: Vec<DiskChunkTable>,
    ram: Vec<u8>,
    vram: Vec<u8>,
    dirty: Vec<u64>,
}

impl SnapshotSource for Machine {
    fn snapshot_meta(&mut self) -> SnapshotMeta {
        self.meta.clone().unwrap_or_default()
    }

    fn cpu_state(&self) -> CpuState {
        self.cpu.clone()
    }

    fn device_states(&self) -> Vec<DeviceState> {
        self.devices.clone()
    }

    fn disk_chunk_tables(&self) -> Vec<DiskChunkTable> {
        self.disks.clone()
    }

    fn ram_len(&self) -> usize {
        self.ram.len()
    }

    fn read_ram(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        buf.copy_from_slice(&self.ram[offset..offset + buf.len()]);
        Ok(())
    }

    fn take_dirty_pages(&mut self) -> Option<Vec<u64>> {
        Some(std::mem::take(&mut self.dirty))
    }

    fn vram_len(&self) -> usize {
        self.vram.len()
    }

    fn read_vram(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        buf.copy_from_slice(&self.vram[offset..offset + buf.len()]);
        Ok(())
    }
}

impl SnapshotTarget for Machine {
    fn restore_meta(&mut self, meta: SnapshotMeta) -> Result<()> {
        self.meta = Some(meta);
        Ok(())
    }

    fn restore_cpu_state(&mut self, state: CpuState) -> Result<()> {
        self.cpu = state;
        Ok(())
    }

    fn restore_device_states(&mut self, states: Vec<DeviceState>) -> Result<()> {
        self.devices = states;
        Ok(())
    }

    fn restore_disk_chunk_tables(&mut self, tables: Vec<DiskChunkTable>) -> Result<()> {
        self.disks = tables;
        Ok(())
    }

    fn ram_len(&self) -> usize {
        self.ram.len()
    }

    fn write_ram(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let offset = offset as usize;
        self.ram[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn vram_len(&self) -> usize {
        self.vram.len()
    }

    fn write_vram(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let offset = offset as usize;
        self.vram[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

fn sample() -> Machine {
    Machine {
        meta: Some(SnapshotMeta {
            snapshot_id: 1,
            parent_snapshot_id: None,
            created_unix_ms: 0,
            label: Some("boot".into()),
        }),
        cpu: CpuState {
            gpr: [1, 2, 3, 4, 0x7000, 6, 7, 8],
            eip: 0xFFFF0,
            eflags: 0x202,
            vector_base: 0x1000,
            vector_limit: 0x3FF,
            mode: 1,
            interrupt_shadow: false,
            instructions_retired: 12345,
        },
        devices: vec![
            DeviceState {
                id: DeviceId::VGA,
                version: 1,
                flags: 0,
                data: vec![9; 32],
            },
            DeviceState {
                id: DeviceId::PIT,
                version: 1,
                flags: 0,
                data: vec![1, 2, 3],
            },
        ],
        disks: vec![DiskChunkTable {
            image: 0,
            file_name: "hda.img".into(),
            total_size: 1 << 20,
            chunk_size: 65536,
            resident: vec![(0, 65536), (131072, 196608)],
        }],
        ram: (0..64 * 1024u32).map(|i| (i * 7) as u8).collect(),
        vram: Vec::new(),
        dirty: vec![3, 1],
    }
}

#[test]
fn save_then_restore_reproduces_every_section() {
    let mut source = sample();
    let bytes = save_snapshot(&mut source, SaveOptions::default()).unwrap();

    let mut target = Machine {
        ram: vec![0; source.ram.len()],
        ..Machine::default()
    };
    restore_snapshot(&bytes, &mut target).unwrap();

    assert_eq!(target.meta, source.meta);
    assert_eq!(target.cpu, source.cpu);
    assert_eq!(target.disks, source.disks);
    assert_eq!(target.ram, source.ram);
    // Devices are written in id order.
    let ids: Vec<_> = target.devices.iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![DeviceId::PIT, DeviceId::VGA]);
}

#[test]
fn saving_is_deterministic() {
    let a = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    let b = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn dirty_snapshot_applies_over_a_base_image() {
    let mut source = sample();
    let base = save_snapshot(&mut source, SaveOptions::default()).unwrap();

    source.ram[4096] = 0xEE;
    source.dirty = vec![1];
    let opts = SaveOptions {
        ram: RamWriteOptions {
            mode: RamMode::Dirty,
            compression: Compression::None,
            ..RamWriteOptions::default()
        },
    };
    let diff = save_snapshot(&mut source, opts).unwrap();

    let mut target = Machine {
        ram: vec![0; source.ram.len()],
        ..Machine::default()
    };
    restore_snapshot(&base, &mut target).unwrap();
    restore_snapshot(&diff, &mut target).unwrap();
    assert_eq!(target.ram, source.ram);
}

#[test]
fn newer_version_is_incompatible() {
    let mut bytes = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    let newer = SNAPSHOT_VERSION_CURRENT + 1;
    bytes[8..10].copy_from_slice(&newer.to_le_bytes());

    let mut target = Machine {
        ram: vec![0; 64 * 1024],
        ..Machine::default()
    };
    let err = restore_snapshot(&bytes, &mut target).unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::IncompatibleVersion { found, supported }
            if found == newer && supported == SNAPSHOT_VERSION_CURRENT
    ));
    assert!(target.ram.iter().all(|&b| b == 0));
    assert!(target.meta.is_none());
}

#[test]
fn flipped_byte_fails_integrity_before_any_section_is_applied() {
    let mut bytes = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    bytes[HEADER_LEN + 20] ^= 0x01;

    let mut target = Machine {
        ram: vec![0; 64 * 1024],
        ..Machine::default()
    };
    let err = restore_snapshot(&bytes, &mut target).unwrap_err();
    assert!(matches!(err, SnapshotError::IntegrityMismatch));
    assert!(err.is_corrupt());
    assert!(target.meta.is_none());
}

#[test]
fn truncated_blob_is_corrupt() {
    let bytes = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    for cut in [0, 4, HEADER_LEN, bytes.len() / 2, bytes.len() - 1] {
        let mut target = Machine {
            ram: vec![0; 64 * 1024],
            ..Machine::default()
        };
        let err = restore_snapshot(&bytes[..cut], &mut target).unwrap_err();
        assert!(err.is_corrupt(), "cut at {cut}: {err:?}");
    }
}

#[test]
fn ram_size_mismatch_is_rejected() {
    let bytes = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    let mut target = Machine {
        ram: vec![0; 32 * 1024],
        ..Machine::default()
    };
    let err = restore_snapshot(&bytes, &mut target).unwrap_err();
    assert!(matches!(err, SnapshotError::RamLenMismatch { .. }));
}

fn dirty_child(source: &mut Machine) -> Vec<u8> {
    source.meta = Some(SnapshotMeta {
        snapshot_id: 2,
        parent_snapshot_id: Some(1),
        created_unix_ms: 0,
        label: None,
    });
    source.ram[4096] = 0xEE;
    source.dirty = vec![1];
    let opts = SaveOptions {
        ram: RamWriteOptions {
            mode: RamMode::Dirty,
            ..RamWriteOptions::default()
        },
    };
    save_snapshot(source, opts).unwrap()
}

#[test]
fn checked_restore_rejects_dirty_blob_for_another_parent() {
    let mut source = sample();
    let base = save_snapshot(&mut source, SaveOptions::default()).unwrap();
    let diff = dirty_child(&mut source);

    let mut target = Machine {
        ram: vec![0; source.ram.len()],
        ..Machine::default()
    };
    restore_snapshot(&base, &mut target).unwrap();
    let before = target.ram.clone();

    for expected in [None, Some(7)] {
        let err = restore_snapshot_checked(
            &diff,
            &mut target,
            RestoreOptions {
                expected_parent_snapshot_id: expected,
            },
        )
        .unwrap_err();
        assert!(
            matches!(err, SnapshotError::ParentMismatch { expected: e, found: Some(1) } if e == expected),
            "{err:?}"
        );
        assert!(!err.is_corrupt());
        assert_eq!(target.ram, before);
    }

    restore_snapshot_checked(
        &diff,
        &mut target,
        RestoreOptions {
            expected_parent_snapshot_id: Some(1),
        },
    )
    .unwrap();
    assert_eq!(target.ram, source.ram);
}

#[test]
fn checked_restore_ignores_parent_for_full_blobs() {
    let mut source = sample();
    source.meta = Some(SnapshotMeta {
        snapshot_id: 5,
        parent_snapshot_id: Some(4),
        created_unix_ms: 0,
        label: None,
    });
    let bytes = save_snapshot(&mut source, SaveOptions::default()).unwrap();

    let mut target = Machine {
        ram: vec![0; source.ram.len()],
        ..Machine::default()
    };
    restore_snapshot_checked(
        &bytes,
        &mut target,
        RestoreOptions {
            expected_parent_snapshot_id: Some(99),
        },
    )
    .unwrap();
    assert_eq!(target.ram, source.ram);
}

#[test]
fn video_memory_travels_in_its_own_section() {
    let mut source = sample();
    // Larger than a device entry may be.
    source.vram = (0..65 * 1024 * 1024u32).map(|i| (i >> 12) as u8).collect();
    let bytes = save_snapshot(&mut source, SaveOptions::default()).unwrap();

    let mut target = Machine {
        ram: vec![0; source.ram.len()],
        vram: vec![0; source.vram.len()],
        ..Machine::default()
    };
    restore_snapshot(&bytes, &mut target).unwrap();
    assert!(target.vram == source.vram);

    let mut smaller = Machine {
        ram: vec![0; source.ram.len()],
        vram: vec![0; 1024 * 1024],
        ..Machine::default()
    };
    let err = restore_snapshot(&bytes, &mut smaller).unwrap_err();
    assert!(matches!(err, SnapshotError::VramLenMismatch { .. }), "{err:?}");
}

#[test]
fn missing_video_memory_section_is_corrupt() {
    let bytes = save_snapshot(&mut sample(), SaveOptions::default()).unwrap();
    let mut target = Machine {
        ram: vec![0; 64 * 1024],
        vram: vec![0; 4096],
        ..Machine::default()
    };
    let err = restore_snapshot(&bytes, &mut target).unwrap_err();
    assert!(matches!(err, SnapshotError::Corrupt("missing VRAM section")));
}
