//! Glue between the live machine and the snapshot container.
//!
//! Saving reads straight from the live state. Restoring decodes into a [`StagedRestore`] and
//! only touches the live machine once the whole blob has been accepted.

use std::time::{SystemTime, UNIX_EPOCH};

use ember_devices::state::{StateReader, StateWriter};
use ember_devices::{DeviceConfig, DeviceError, DeviceSet};
use ember_events::EventBus;
use ember_mem::{GuestMemory, RomRange, PAGE_SIZE};
use ember_snapshot::{
    CpuState, DeviceId, DeviceState, DiskChunkTable, Result, SnapshotError, SnapshotMeta,
    SnapshotSource, SnapshotTarget,
};
use ember_storage::{BlockDeviceAdapter, ImageHandle};
use tracing::warn;

use crate::cpu::Cpu;
use crate::pic::Pic;

const MACHINE_STATE_VERSION: u16 = 1;
const MAX_ROM_RANGES: u32 = 64;

/// Everything a snapshot captures apart from disk residency.
pub struct MachineState {
    pub cpu: Cpu,
    pub mem: GuestMemory,
    pub devices: DeviceSet,
    pub pic: Pic,
    /// Completed macro-steps.
    pub steps: u64,
}

impl MachineState {
    pub fn new(memory_size: usize, config: DeviceConfig, events: EventBus) -> Self {
        Self {
            cpu: Cpu::new(),
            mem: GuestMemory::new(memory_size),
            devices: DeviceSet::new(config, events),
            pic: Pic::new(),
            steps: 0,
        }
    }

    /// Device entries for state the machine owns outside of the device set.
    fn platform_states(&self) -> Vec<DeviceState> {
        let mut roms = StateWriter::new();
        roms.u32(self.mem.rom_ranges().len() as u32);
        for range in self.mem.rom_ranges() {
            roms.u64(range.start).u64(range.end);
        }

        vec![
            platform_entry(DeviceId::PIC, self.pic.save_state()),
            platform_entry(
                DeviceId::CPU_INTERNAL,
                StateWriter::new().u64(self.steps).finish(),
            ),
            platform_entry(DeviceId::MEMORY, roms.finish()),
        ]
    }
}

fn platform_entry(id: DeviceId, data: Vec<u8>) -> DeviceState {
    DeviceState {
        id,
        version: MACHINE_STATE_VERSION,
        flags: 0,
        data,
    }
}

/// Snapshot id lineage: every save gets a fresh id and names the previous save (or the
/// snapshot the machine was restored from) as its parent.
#[derive(Debug, Clone, Default)]
pub struct SnapshotLineage {
    next_id: u64,
    last_id: Option<u64>,
}

impl SnapshotLineage {
    pub fn last_id(&self) -> Option<u64> {
        self.last_id
    }

    fn next_meta(&mut self, label: Option<String>) -> SnapshotMeta {
        let snapshot_id = self.next_id;
        self.next_id += 1;
        let meta = SnapshotMeta {
            snapshot_id,
            parent_snapshot_id: self.last_id,
            created_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
                .try_into()
                .unwrap_or(u64::MAX),
            label,
        };
        self.last_id = Some(snapshot_id);
        meta
    }

    fn restored(&mut self, meta: &SnapshotMeta) {
        self.last_id = Some(meta.snapshot_id);
        self.next_id = self.next_id.max(meta.snapshot_id.saturating_add(1));
    }
}

pub(crate) struct SaveView<'a> {
    pub state: &'a mut MachineState,
    pub disk: &'a BlockDeviceAdapter,
    pub lineage: &'a mut SnapshotLineage,
    pub label: Option<String>,
}

impl SnapshotSource for SaveView<'_> {
    fn snapshot_meta(&mut self) -> SnapshotMeta {
        self.lineage.next_meta(self.label.take())
    }

    fn cpu_state(&self) -> CpuState {
        self.state.cpu.to_state()
    }

    fn device_states(&self) -> Vec<DeviceState> {
        let mut states = self.state.devices.save_states();
        states.extend(self.state.platform_states());
        states
    }

    fn disk_chunk_tables(&self) -> Vec<DiskChunkTable> {
        self.disk
            .chunk_tables()
            .into_iter()
            .map(|table| DiskChunkTable {
                image: table.image.0,
                file_name: table.file_name,
                total_size: table.total_size,
                chunk_size: table.chunk_size,
                resident: table
                    .resident
                    .ranges()
                    .iter()
                    .map(|r| (r.start, r.end))
                    .collect(),
            })
            .collect()
    }

    fn ram_len(&self) -> usize {
        self.state.mem.len()
    }

    fn read_ram(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.state
            .mem
            .read_bytes(offset, buf)
            .map_err(|_| SnapshotError::Corrupt("ram read out of range"))
    }

    fn take_dirty_pages(&mut self) -> Option<Vec<u64>> {
        Some(self.state.mem.take_dirty_pages())
    }

    fn vram_len(&self) -> usize {
        self.state.devices.vga.vram().len()
    }

    fn read_vram(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let vram = self.state.devices.vga.vram();
        let start = usize::try_from(offset)
            .map_err(|_| SnapshotError::Corrupt("vram read out of range"))?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| vram.get(start..end))
            .ok_or(SnapshotError::Corrupt("vram read out of range"))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

fn device_error(err: DeviceError) -> SnapshotError {
    match err {
        DeviceError::Decode(err) => err,
        other => {
            warn!(error = %other, "rejecting device state");
            SnapshotError::Corrupt("invalid device state")
        }
    }
}

fn find_platform_entry<'a>(states: &'a [DeviceState], id: DeviceId) -> Result<&'a [u8]> {
    let state = states
        .iter()
        .find(|s| s.id == id)
        .ok_or(SnapshotError::Corrupt("missing platform device state"))?;
    if state.version != MACHINE_STATE_VERSION {
        return Err(SnapshotError::Corrupt("unsupported platform device state"));
    }
    Ok(&state.data)
}

struct StagedPlatform {
    devices: DeviceSet,
    pic: Pic,
    steps: u64,
    roms: Vec<RomRange>,
}

/// Restore target that accumulates decoded sections without touching the live machine.
pub(crate) struct StagedRestore {
    ram_len: usize,
    device_config: DeviceConfig,
    events: EventBus,
    drive: Option<(ImageHandle, u64)>,
    meta: Option<SnapshotMeta>,
    cpu: Option<Cpu>,
    platform: Option<StagedPlatform>,
    tables: Vec<DiskChunkTable>,
    ram: Vec<(u64, Vec<u8>)>,
    vram: Option<Vec<u8>>,
}

impl StagedRestore {
    pub fn new(
        ram_len: usize,
        device_config: DeviceConfig,
        events: EventBus,
        drive: Option<(ImageHandle, u64)>,
    ) -> Self {
        Self {
            ram_len,
            device_config,
            events,
            drive,
            meta: None,
            cpu: None,
            platform: None,
            tables: Vec::new(),
            ram: Vec::new(),
            vram: None,
        }
    }

    /// Swap the staged state into `live`. Returns the restored disk residency tables.
    pub fn commit(
        self,
        live: &mut MachineState,
        lineage: &mut SnapshotLineage,
    ) -> Result<Vec<DiskChunkTable>> {
        let cpu = self
            .cpu
            .ok_or(SnapshotError::Corrupt("missing CPU section"))?;
        let mut platform = self
            .platform
            .ok_or(SnapshotError::Corrupt("missing devices section"))?;
        if let Some(vram) = self.vram {
            platform
                .devices
                .vga
                .restore_vram(vram)
                .map_err(device_error)?;
        }

        for (offset, data) in &self.ram {
            live.mem
                .restore_bytes(*offset, data)
                .map_err(|_| SnapshotError::Corrupt("ram chunk out of range"))?;
        }
        live.mem.clear_rom_ranges();
        for range in platform.roms {
            live.mem
                .add_rom_range(range)
                .map_err(|_| SnapshotError::Corrupt("rom range out of bounds"))?;
        }
        live.mem.clear_dirty();

        live.cpu = cpu;
        live.devices = platform.devices;
        live.pic = platform.pic;
        live.steps = platform.steps;
        if let Some(meta) = &self.meta {
            lineage.restored(meta);
        }
        Ok(self.tables)
    }

    fn decode_roms(&self, bytes: &[u8]) -> std::result::Result<Vec<RomRange>, DeviceError> {
        let invalid = |reason| DeviceError::InvalidState {
            device: "memory",
            reason,
        };
        let mut r = StateReader::new(bytes);
        let count = r.u32()?;
        if count > MAX_ROM_RANGES {
            return Err(invalid("too many rom ranges"));
        }
        let mut roms = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let start = r.u64()?;
            let end = r.u64()?;
            if start > end || end > self.ram_len as u64 {
                return Err(invalid("rom range out of bounds"));
            }
            roms.push(RomRange { start, end });
        }
        Ok(roms)
    }

    fn decode_platform(
        &self,
        states: &[DeviceState],
    ) -> std::result::Result<StagedPlatform, DeviceError> {
        let mut devices = DeviceSet::new(self.device_config, self.events.clone());
        if let Some((image, sectors)) = self.drive {
            devices.ide.attach(image, sectors);
        }
        devices.load_states(states)?;

        let pic = Pic::load_state(
            find_platform_entry(states, DeviceId::PIC).map_err(DeviceError::Decode)?,
        )?;
        let steps = StateReader::new(
            find_platform_entry(states, DeviceId::CPU_INTERNAL).map_err(DeviceError::Decode)?,
        )
        .u64()?;
        let roms = self.decode_roms(
            find_platform_entry(states, DeviceId::MEMORY).map_err(DeviceError::Decode)?,
        )?;
        Ok(StagedPlatform {
            devices,
            pic,
            steps,
            roms,
        })
    }
}

impl SnapshotTarget for StagedRestore {
    fn restore_meta(&mut self, meta: SnapshotMeta) -> Result<()> {
        self.meta = Some(meta);
        Ok(())
    }

    fn restore_cpu_state(&mut self, state: CpuState) -> Result<()> {
        self.cpu = Some(Cpu::from_state(&state)?);
        Ok(())
    }

    fn restore_device_states(&mut self, states: Vec<DeviceState>) -> Result<()> {
        self.platform = Some(self.decode_platform(&states).map_err(device_error)?);
        Ok(())
    }

    fn restore_disk_chunk_tables(&mut self, tables: Vec<DiskChunkTable>) -> Result<()> {
        self.tables = tables;
        Ok(())
    }

    fn ram_len(&self) -> usize {
        self.ram_len
    }

    fn write_ram(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(SnapshotError::Corrupt("ram chunk overflow"))?;
        if end > self.ram_len as u64 {
            return Err(SnapshotError::Corrupt("ram chunk out of range"));
        }
        // Coalesce page-sized writes from dirty snapshots into runs.
        if let Some((last_offset, last)) = self.ram.last_mut() {
            if *last_offset + last.len() as u64 == offset && last.len() < 64 * PAGE_SIZE {
                last.extend_from_slice(data);
                return Ok(());
            }
        }
        self.ram.push((offset, data.to_vec()));
        Ok(())
    }

    fn vram_len(&self) -> usize {
        self.device_config.vga_memory_size
    }

    fn write_vram(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let len = self.device_config.vga_memory_size;
        let vram = self.vram.get_or_insert_with(|| vec![0; len]);
        let start = usize::try_from(offset)
            .map_err(|_| SnapshotError::Corrupt("vram chunk out of range"))?;
        let dst = start
            .checked_add(data.len())
            .and_then(|end| vram.get_mut(start..end))
            .ok_or(SnapshotError::Corrupt("vram chunk out of range"))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn post_restore(&mut self) -> Result<()> {
        if self.platform.is_none() {
            return Err(SnapshotError::Corrupt("missing devices section"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_chains_parent_ids() {
        let mut lineage = SnapshotLineage::default();
        let first = lineage.next_meta(None);
        let second = lineage.next_meta(Some("after boot".into()));
        assert_eq!(first.parent_snapshot_id, None);
        assert_eq!(second.parent_snapshot_id, Some(first.snapshot_id));
        assert_eq!(second.label.as_deref(), Some("after boot"));

        let mut other = SnapshotLineage::default();
        other.restored(&second);
        let third = other.next_meta(None);
        assert_eq!(third.parent_snapshot_id, Some(second.snapshot_id));
        assert!(third.snapshot_id > second.snapshot_id);
    }

    #[test]
    fn staged_ram_writes_are_bounds_checked() {
        let mut staged =
            StagedRestore::new(8192, DeviceConfig::default(), EventBus::new(), None);
        staged.write_ram(0, &[1; 4096]).unwrap();
        staged.write_ram(4096, &[2; 4096]).unwrap();
        assert_eq!(staged.ram.len(), 1);
        assert!(matches!(
            staged.write_ram(8000, &[0; 512]),
            Err(SnapshotError::Corrupt(_))
        ));
    }

    #[test]
    fn staged_vram_writes_are_bounds_checked() {
        let config = DeviceConfig {
            vga_memory_size: 4096,
            ..DeviceConfig::default()
        };
        let mut staged = StagedRestore::new(4096, config, EventBus::new(), None);
        assert_eq!(SnapshotTarget::vram_len(&staged), 4096);
        staged.write_vram(1024, &[7; 1024]).unwrap();
        assert!(matches!(
            staged.write_vram(4000, &[0; 512]),
            Err(SnapshotError::Corrupt(_))
        ));
        let vram = staged.vram.as_deref().unwrap();
        assert_eq!(vram[1024..2048], [7; 1024]);
        assert_eq!(vram[..1024], [0; 1024]);
    }

    #[test]
    fn rom_ranges_must_fit_in_ram() {
        let staged = StagedRestore::new(0x1000, DeviceConfig::default(), EventBus::new(), None);
        let mut w = StateWriter::new();
        w.u32(1).u64(0x800).u64(0x2000);
        assert!(staged.decode_roms(&w.finish()).is_err());
    }
}
