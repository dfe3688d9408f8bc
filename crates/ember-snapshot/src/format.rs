pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBRSNAP";
pub const SNAPSHOT_VERSION_V1: u16 = 1;
/// Newest container revision this build can read.
pub const SNAPSHOT_VERSION_CURRENT: u16 = SNAPSHOT_VERSION_V1;
pub const SNAPSHOT_ENDIANNESS_LITTLE: u8 = 1;

/// magic + version + endianness + reserved + flags
pub const HEADER_LEN: usize = 8 + 2 + 1 + 1 + 4;
/// id + version + flags + len
pub const SECTION_HEADER_LEN: usize = 4 + 2 + 2 + 8;
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

impl SectionId {
    pub const META: SectionId = SectionId(1);
    pub const CPU: SectionId = SectionId(2);
    pub const DEVICES: SectionId = SectionId(4);
    pub const DISKS: SectionId = SectionId(5);
    pub const RAM: SectionId = SectionId(6);
    /// Display adapter memory, chunked like a full `RAM` section.
    pub const VRAM: SectionId = SectionId(7);
    /// SHA-256 over every byte preceding this section's header. Always last.
    pub const INTEGRITY: SectionId = SectionId(0x7F);

    pub fn name(self) -> Option<&'static str> {
        match self {
            SectionId::META => Some("META"),
            SectionId::CPU => Some("CPU"),
            SectionId::DEVICES => Some("DEVICES"),
            SectionId::DISKS => Some("DISKS"),
            SectionId::RAM => Some("RAM"),
            SectionId::VRAM => Some("VRAM"),
            SectionId::INTEGRITY => Some("INTEGRITY"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Interrupt controller: latched requests and masks.
    pub const PIC: DeviceId = DeviceId(1);
    /// 8254 PIT.
    pub const PIT: DeviceId = DeviceId(3);
    /// IDE controller (primary channel) register file and PIO buffer.
    pub const DISK_CONTROLLER: DeviceId = DeviceId(6);
    pub const VGA: DeviceId = DeviceId(7);
    pub const SERIAL: DeviceId = DeviceId(8);
    /// Non-architectural machine state (scheduler counters).
    pub const CPU_INTERNAL: DeviceId = DeviceId(9);
    /// Memory glue state (ROM windows).
    pub const MEMORY: DeviceId = DeviceId(11);

    pub fn name(self) -> Option<&'static str> {
        match self {
            DeviceId::PIC => Some("PIC"),
            DeviceId::PIT => Some("PIT"),
            DeviceId::DISK_CONTROLLER => Some("DISK_CONTROLLER"),
            DeviceId::VGA => Some("VGA"),
            DeviceId::SERIAL => Some("SERIAL"),
            DeviceId::CPU_INTERNAL => Some("CPU_INTERNAL"),
            DeviceId::MEMORY => Some("MEMORY"),
            _ => None,
        }
    }
}

impl core::fmt::Display for SectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "SectionId({})", self.0),
        }
    }
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "DeviceId({})", self.0),
        }
    }
}
