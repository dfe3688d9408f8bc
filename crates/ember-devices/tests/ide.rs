use std::sync::Arc;

use ember_devices::{
    Device, DeviceConfig, DeviceContext, DeviceSet, IdeState, TickOutcome, IDE_CMD_BASE,
};
use ember_events::{EventBus, MachineEvent};
use ember_mem::GuestMemory;
use ember_storage::{BlockDeviceAdapter, MemoryRangeProvider, StorageOptions};
use tokio::runtime::Handle;

const CHUNK: u32 = 4096;
const STATUS_DRDY_DRQ: u32 = 0x48;

fn image() -> Vec<u8> {
    (0..8 * CHUNK as usize).map(|i| (i * 7 % 251) as u8).collect()
}

struct Rig {
    provider: MemoryRangeProvider,
    events: EventBus,
    mem: GuestMemory,
    disk: BlockDeviceAdapter,
    devices: DeviceSet,
}

impl Rig {
    async fn new() -> Self {
        let provider = MemoryRangeProvider::new();
        provider.insert("hda", image());
        let events = EventBus::new();
        let options = StorageOptions {
            chunk_size: CHUNK,
            read_ahead_chunks: 0,
            ..StorageOptions::default()
        };
        let mut disk = BlockDeviceAdapter::new(
            Arc::new(provider.clone()),
            events.clone(),
            options,
            Handle::current(),
        );
        let hda = disk.open_image("hda.img", "hda").await.unwrap();
        let config = DeviceConfig {
            vga_memory_size: 256 * 1024,
            ..DeviceConfig::default()
        };
        let mut devices = DeviceSet::new(config, events.clone());
        devices.ide.attach(hda, image().len() as u64 / 512);
        Self {
            provider,
            events,
            mem: GuestMemory::new(1 << 20),
            disk,
            devices,
        }
    }

    fn tick_ide(&mut self) -> TickOutcome {
        let mut ctx = DeviceContext {
            mem: &mut self.mem,
            disk: &mut self.disk,
            events: &self.events,
            now: 0,
        };
        self.devices.ide.tick(&mut ctx)
    }

    fn issue_read(&mut self, lba: u8, count: u8) {
        let ide = &mut self.devices.ide;
        ide.port_write(IDE_CMD_BASE + 2, 1, u32::from(count));
        ide.port_write(IDE_CMD_BASE + 3, 1, u32::from(lba));
        ide.port_write(IDE_CMD_BASE + 4, 1, 0);
        ide.port_write(IDE_CMD_BASE + 5, 1, 0);
        ide.port_write(IDE_CMD_BASE + 6, 1, 0xE0);
        ide.port_write(IDE_CMD_BASE + 7, 1, 0x20);
    }
}

fn ide_events(events: Vec<MachineEvent>) -> Vec<MachineEvent> {
    events
        .into_iter()
        .filter(|e| matches!(e, MachineEvent::IdeReadStart | MachineEvent::IdeReadEnd))
        .collect()
}

#[tokio::test]
async fn read_yields_until_the_chunk_is_resident() {
    let mut rig = Rig::new().await;
    let mut rx = rig.events.subscribe();
    rig.issue_read(9, 2);

    assert_eq!(rig.tick_ide(), TickOutcome::Progressed);
    assert_eq!(rig.devices.ide.state(), IdeState::DataTransfer);
    assert!(!rig.devices.ide.is_quiescent());
    assert_eq!(rig.devices.first_busy(), Some("ide"));
    assert_eq!(rig.tick_ide(), TickOutcome::Yielded);
    assert!(!rig.devices.ide.take_interrupt_request());

    let done = rig.disk.next_completion().await.unwrap();
    assert_eq!(done.result, Ok(()));
    assert_eq!(rig.tick_ide(), TickOutcome::Progressed);
    assert!(rig.devices.ide.is_quiescent());
    assert!(rig.devices.ide.take_interrupt_request());
    assert_eq!(rig.devices.ide.port_read(IDE_CMD_BASE + 7, 1), STATUS_DRDY_DRQ);

    let expected = image();
    let first: Vec<u8> = (0..256)
        .flat_map(|_| (rig.devices.ide.port_read(IDE_CMD_BASE, 2) as u16).to_le_bytes())
        .collect();
    assert_eq!(first, expected[9 * 512..10 * 512]);
    assert_eq!(rig.devices.ide.state(), IdeState::DataTransfer);

    // Sector 10 lives in the same chunk, so it is served on the next tick.
    assert_eq!(rig.tick_ide(), TickOutcome::Progressed);
    let second: Vec<u8> = (0..128)
        .flat_map(|_| rig.devices.ide.port_read(IDE_CMD_BASE, 4).to_le_bytes())
        .collect();
    assert_eq!(second, expected[10 * 512..11 * 512]);

    assert_eq!(rig.devices.ide.state(), IdeState::Idle);
    assert_eq!(rig.devices.ide.status(), 0x40);
    assert_eq!(rig.provider.fetch_count(), 1);
    assert_eq!(
        ide_events(rx.drain()),
        vec![MachineEvent::IdeReadStart, MachineEvent::IdeReadEnd]
    );
    assert_eq!(rig.devices.first_busy(), None);
}

#[tokio::test]
async fn disk_error_aborts_the_command_and_returns_to_idle() {
    let mut rig = Rig::new().await;
    rig.provider.fail_next("hda", 1, false);
    let mut rx = rig.events.subscribe();
    rig.issue_read(0, 1);

    rig.tick_ide();
    let done = rig.disk.next_completion().await.unwrap();
    assert!(done.result.is_err());
    assert_eq!(rig.tick_ide(), TickOutcome::Progressed);

    let ide = &mut rig.devices.ide;
    assert_eq!(ide.state(), IdeState::Idle);
    assert!(ide.is_quiescent());
    assert_eq!(ide.status(), 0x41);
    assert_eq!(ide.error(), 0x44);
    assert!(ide.take_interrupt_request());

    let events = rx.drain();
    assert!(events.contains(&MachineEvent::DownloadError {
        file_name: "hda.img".into()
    }));
    assert_eq!(
        ide_events(events),
        vec![MachineEvent::IdeReadStart, MachineEvent::IdeReadEnd]
    );

    // The drive is usable again once the transport recovers.
    rig.issue_read(0, 1);
    rig.tick_ide();
    rig.disk.wait_idle().await;
    assert_eq!(rig.tick_ide(), TickOutcome::Progressed);
    assert_eq!(rig.devices.ide.status(), 0x48);
}

#[tokio::test]
async fn busy_controller_state_is_reissued_after_restore() {
    let mut rig = Rig::new().await;
    rig.issue_read(3, 1);
    rig.tick_ide();
    assert!(rig.devices.ide.is_waiting_for_data());
    let saved = rig.devices.save_states();

    rig.disk.wait_idle().await;
    let mut fresh = Rig::new().await;
    fresh.devices.load_states(&saved).unwrap();
    assert!(fresh.devices.ide.is_quiescent());
    assert_eq!(fresh.devices.ide.state(), IdeState::DataTransfer);

    // The restored controller asks the adapter again on its next tick.
    assert_eq!(fresh.tick_ide(), TickOutcome::Yielded);
    fresh.disk.wait_idle().await;
    assert_eq!(fresh.tick_ide(), TickOutcome::Progressed);
    let word = fresh.devices.ide.port_read(IDE_CMD_BASE, 2) as u16;
    let expected = image();
    assert_eq!(word.to_le_bytes(), [expected[3 * 512], expected[3 * 512 + 1]]);
}
