use ember_devices::{DeviceConfig, VGA_WINDOW_END, VGA_WINDOW_START};
use ember_storage::StorageOptions;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const MIB: usize = 1024 * 1024;

/// A file the machine loads: `name` is what progress and error events report, `url` is the key
/// handed to the range provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    pub name: String,
    pub url: String,
}

impl ImageSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// CPU instruction budget of one macro-step.
    pub instructions_per_step: u32,
    /// PIT input clocks per macro-step.
    pub pit_ticks_per_step: u32,
    /// Macro-steps between vertical retrace transitions.
    pub retrace_period: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instructions_per_step: 10_000,
            pit_ticks_per_step: 1_000,
            retrace_period: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub memory_size: usize,
    pub vga_memory_size: usize,
    pub bios: Option<ImageSource>,
    pub vga_bios: Option<ImageSource>,
    pub hda: Option<ImageSource>,
    pub initial_state: Option<ImageSource>,
    pub autostart: bool,
    pub scheduler: SchedulerConfig,
    pub storage: StorageOptions,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: 128 * MIB,
            vga_memory_size: 8 * MIB,
            bios: None,
            vga_bios: None,
            hda: None,
            initial_state: None,
            autostart: true,
            scheduler: SchedulerConfig::default(),
            storage: StorageOptions::default(),
        }
    }
}

impl MachineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_size < MIB {
            return Err(ConfigError::MemoryTooSmall {
                size: self.memory_size,
            });
        }
        if self.vga_memory_size < (VGA_WINDOW_END - VGA_WINDOW_START) as usize {
            return Err(ConfigError::VgaMemoryTooSmall {
                size: self.vga_memory_size,
            });
        }
        if !StorageOptions::chunk_size_is_valid(self.storage.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.storage.chunk_size));
        }
        if self.storage.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.storage.max_concurrent_fetches == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.scheduler.instructions_per_step == 0 {
            return Err(ConfigError::ZeroInstructionBudget);
        }
        Ok(())
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            vga_memory_size: self.vga_memory_size,
            pit_ticks_per_step: self.scheduler.pit_ticks_per_step,
            retrace_period: self.scheduler.retrace_period,
        }
    }
}
