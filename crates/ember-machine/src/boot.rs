use std::sync::Arc;

use ember_events::{EventBus, MachineEvent};
use ember_storage::RangeProvider;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::{ImageSource, MachineConfig};
use crate::error::{MachineError, Result};
use crate::machine::Machine;

/// The system BIOS image ends at the top of the first megabyte.
const BIOS_END: u64 = 0x10_0000;
const MAX_BIOS_LEN: usize = 256 * 1024;
/// Legacy option ROM area for the VGA BIOS.
pub const VGA_BIOS_BASE: u64 = 0xC_0000;
const MAX_VGA_BIOS_LEN: usize = 128 * 1024;
/// Real-mode reset vector, `F000:FFF0`.
pub const RESET_VECTOR: u32 = 0xF_FFF0;

impl Machine {
    /// Build a machine from `config`: fetch firmware, open the hard disk, apply the initial
    /// state, announce readiness and start if `autostart` is set.
    pub async fn boot(
        config: MachineConfig,
        provider: Arc<dyn RangeProvider>,
        runtime: Handle,
    ) -> Result<Self> {
        Self::boot_with_events(config, provider, runtime, EventBus::new()).await
    }

    pub async fn boot_with_events(
        config: MachineConfig,
        provider: Arc<dyn RangeProvider>,
        runtime: Handle,
        events: EventBus,
    ) -> Result<Self> {
        let mut machine = Self::with_events(config.clone(), provider, runtime, events)?;

        if let Some(bios) = &config.bios {
            let image = machine.fetch(bios).await?;
            if image.is_empty() || image.len() > MAX_BIOS_LEN {
                return Err(firmware_error(bios, "size must be between 1 byte and 256 KiB"));
            }
            let base = BIOS_END - image.len() as u64;
            machine.memory_mut().load_rom(base, &image)?;
            info!(file_name = %bios.name, len = image.len(), "bios loaded");
        }
        if let Some(vga_bios) = &config.vga_bios {
            let image = machine.fetch(vga_bios).await?;
            if image.len() > MAX_VGA_BIOS_LEN {
                return Err(firmware_error(vga_bios, "larger than 128 KiB"));
            }
            machine.memory_mut().load_rom(VGA_BIOS_BASE, &image)?;
            info!(file_name = %vga_bios.name, len = image.len(), "vga bios loaded");
        }
        machine.cpu_mut().reset(RESET_VECTOR);

        if let Some(hda) = &config.hda {
            machine.attach_disk(&hda.name, &hda.url).await?;
        }

        if let Some(initial) = &config.initial_state {
            let blob = machine.fetch(initial).await?;
            machine.restore(&blob)?;
            info!(file_name = %initial.name, "initial state restored");
        }

        info!("emulator ready");
        machine.events().publish(MachineEvent::EmulatorReady);
        if config.autostart {
            machine.start();
        }
        Ok(machine)
    }

    async fn fetch(&self, source: &ImageSource) -> Result<Vec<u8>> {
        Ok(self.disk().download(&source.name, &source.url).await?)
    }
}

fn firmware_error(source: &ImageSource, reason: &'static str) -> MachineError {
    MachineError::Firmware {
        name: source.name.clone(),
        reason,
    }
}
