use bitflags::bitflags;
use ember_events::{EventBus, MachineEvent};
use ember_storage::{ChunkRequest, DiskIoError, ImageHandle, SECTOR_SIZE};
use tracing::{debug, warn};

use crate::state::{StateReader, StateWriter};
use crate::{Device, DeviceContext, DeviceError, DeviceKind, TickOutcome, IRQ_IDE};

pub const IDE_CMD_BASE: u16 = 0x1F0;
pub const IDE_CTRL_PORT: u16 = 0x3F6;

const SECTOR: usize = SECTOR_SIZE as usize;
const SECTOR_BYTES: u64 = SECTOR_SIZE as u64;

const REG_DATA: u16 = 0;
const REG_ERROR_FEATURES: u16 = 1;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA0: u16 = 3;
const REG_LBA1: u16 = 4;
const REG_LBA2: u16 = 5;
const REG_DEVICE: u16 = 6;
const REG_STATUS_COMMAND: u16 = 7;

const CTRL_NIEN: u8 = 0x02;
const CTRL_SRST: u8 = 0x04;

const ERR_ABRT: u8 = 0x04;
const ERR_IDNF: u8 = 0x10;
const ERR_UNC: u8 = 0x40;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_READ_SECTORS_NO_RETRY: u8 = 0x21;
const CMD_IDENTIFY: u8 = 0xEC;

/// CHS translation geometry reported in IDENTIFY.
const HEADS: u64 = 16;
const SECTORS_PER_TRACK: u64 = 63;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Status: u8 {
        const BSY = 0x80;
        const DRDY = 0x40;
        const DRQ = 0x08;
        const ERR = 0x01;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeState {
    Idle,
    /// A command byte was written; it runs on the next tick.
    CommandPending,
    /// PIO data phase, including the wait for each sector's bytes.
    DataTransfer,
}

impl IdeState {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(IdeState::Idle),
            1 => Some(IdeState::CommandPending),
            2 => Some(IdeState::DataTransfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Drive {
    image: ImageHandle,
    total_sectors: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TaskFile {
    features: u8,
    sector_count: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,
}

impl TaskFile {
    fn read_reg(&self, reg: u16) -> u8 {
        match reg {
            REG_SECTOR_COUNT => self.sector_count,
            REG_LBA0 => self.lba0,
            REG_LBA1 => self.lba1,
            REG_LBA2 => self.lba2,
            REG_DEVICE => self.device | 0xA0,
            _ => 0,
        }
    }

    fn write_reg(&mut self, reg: u16, val: u8) {
        match reg {
            REG_ERROR_FEATURES => self.features = val,
            REG_SECTOR_COUNT => self.sector_count = val,
            REG_LBA0 => self.lba0 = val,
            REG_LBA1 => self.lba1 = val,
            REG_LBA2 => self.lba2 = val,
            REG_DEVICE => self.device = val,
            _ => {}
        }
    }

    /// Starting sector of a 28-bit command. CHS addresses are translated with the IDENTIFY
    /// geometry; sector 0 is not addressable in CHS mode.
    fn lba28(&self) -> Option<u64> {
        let head = u64::from(self.device & 0x0F);
        if (self.device & 0x40) != 0 {
            let lba = (head << 24)
                | (u64::from(self.lba2) << 16)
                | (u64::from(self.lba1) << 8)
                | u64::from(self.lba0);
            return Some(lba);
        }
        let cylinder = u64::from(u16::from_le_bytes([self.lba1, self.lba2]));
        let sector = u64::from(self.lba0);
        if sector == 0 {
            return None;
        }
        Some((cylinder * HEADS + head) * SECTORS_PER_TRACK + sector - 1)
    }

    fn sector_count28(&self) -> u32 {
        match self.sector_count {
            0 => 256,
            n => u32::from(n),
        }
    }

    fn is_master(&self) -> bool {
        (self.device & 0x10) == 0
    }
}

/// Primary ATA channel with a single master drive backed by a streamed disk image.
///
/// Commands are latched on the command port and executed on the next tick. Sector data comes
/// from the block device adapter; while a sector is not resident the controller stays busy and
/// yields instead of blocking the scheduler.
pub struct IdeController {
    events: EventBus,
    drive: Option<Drive>,
    tf: TaskFile,
    status: Status,
    error: u8,
    control: u8,
    state: IdeState,
    command: u8,

    /// Read in progress: next sector to transfer and sectors left, including the current one.
    reading: bool,
    lba: u64,
    remaining: u32,
    needs_sector: bool,
    request: Option<ChunkRequest>,

    buffer: Vec<u8>,
    index: usize,
    irq_pending: bool,
}

impl IdeController {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            drive: None,
            tf: TaskFile::default(),
            status: Status::empty(),
            error: 0,
            control: 0,
            state: IdeState::Idle,
            command: 0,
            reading: false,
            lba: 0,
            remaining: 0,
            needs_sector: false,
            request: None,
            buffer: Vec::new(),
            index: 0,
            irq_pending: false,
        }
    }

    /// Attach the master drive.
    pub fn attach(&mut self, image: ImageHandle, total_sectors: u64) {
        self.drive = Some(Drive {
            image,
            total_sectors,
        });
        self.status = Status::DRDY;
    }

    pub fn attached_image(&self) -> Option<ImageHandle> {
        self.drive.map(|d| d.image)
    }

    pub fn state(&self) -> IdeState {
        self.state
    }

    pub fn status(&self) -> u8 {
        self.status.bits()
    }

    pub fn error(&self) -> u8 {
        self.error
    }

    /// True between `IdeReadStart` and `IdeReadEnd`.
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// True while a sector request is outstanding with the adapter.
    pub fn is_waiting_for_data(&self) -> bool {
        self.request.is_some()
    }

    fn set_irq(&mut self) {
        if (self.control & CTRL_NIEN) == 0 {
            self.irq_pending = true;
        }
    }

    fn drive_selected(&self) -> Option<Drive> {
        self.drive.filter(|_| self.tf.is_master())
    }

    fn end_read(&mut self) {
        if std::mem::take(&mut self.reading) {
            self.events.publish(MachineEvent::IdeReadEnd);
        }
        self.request = None;
        self.needs_sector = false;
        self.remaining = 0;
    }

    fn reset(&mut self) {
        debug!("ide: software reset");
        self.end_read();
        self.tf = TaskFile::default();
        self.status = if self.drive.is_some() {
            Status::DRDY
        } else {
            Status::empty()
        };
        self.error = 0;
        self.state = IdeState::Idle;
        self.buffer.clear();
        self.index = 0;
        self.irq_pending = false;
    }

    fn abort_command(&mut self, err: u8) {
        self.end_read();
        self.buffer.clear();
        self.index = 0;
        self.error = err;
        self.status = Status::DRDY | Status::ERR;
        self.state = IdeState::Idle;
        self.set_irq();
    }

    fn complete_non_data_command(&mut self) {
        self.error = 0;
        self.status = Status::DRDY;
        self.state = IdeState::Idle;
        self.set_irq();
    }

    fn begin_pio_in(&mut self, data: Vec<u8>) {
        self.buffer = data;
        self.index = 0;
        self.error = 0;
        self.status = Status::DRDY | Status::DRQ;
        self.state = IdeState::DataTransfer;
        self.set_irq();
    }

    fn write_command(&mut self, cmd: u8) {
        if self.reading {
            debug!(cmd, "ide: command overrides read in progress");
            self.end_read();
        }
        self.buffer.clear();
        self.index = 0;
        self.command = cmd;
        self.status = Status::BSY;
        self.irq_pending = false;
        self.state = IdeState::CommandPending;
    }

    fn execute(&mut self) {
        let cmd = self.command;
        let Some(drive) = self.drive_selected() else {
            self.abort_command(ERR_ABRT);
            return;
        };
        match cmd {
            CMD_IDENTIFY => self.begin_pio_in(identify_data(drive.total_sectors)),
            CMD_READ_SECTORS | CMD_READ_SECTORS_NO_RETRY => {
                let count = self.tf.sector_count28();
                let in_bounds = self.tf.lba28().filter(|lba| {
                    lba.checked_add(u64::from(count))
                        .is_some_and(|end| end <= drive.total_sectors)
                });
                let Some(lba) = in_bounds else {
                    debug!(count, "ide: read outside the disk");
                    self.abort_command(ERR_IDNF);
                    return;
                };
                debug!(lba, count, "ide: read sectors");
                self.events.publish(MachineEvent::IdeReadStart);
                self.reading = true;
                self.lba = lba;
                self.remaining = count;
                self.needs_sector = true;
                self.error = 0;
                self.status = Status::BSY | Status::DRDY;
                self.state = IdeState::DataTransfer;
            }
            // Recalibrate, seek, set parameters, flush cache, set features: nothing to do.
            0x10..=0x1F | 0x70 | 0x91 | 0xE7 | 0xEF => self.complete_non_data_command(),
            _ => {
                debug!(cmd, "ide: unsupported command");
                self.abort_command(ERR_ABRT);
            }
        }
    }

    /// Advance the read state machine: issue the next sector request and collect its bytes.
    fn service_read(&mut self, ctx: &mut DeviceContext<'_>) -> TickOutcome {
        if self.needs_sector {
            let Some(drive) = self.drive else {
                self.abort_command(ERR_ABRT);
                return TickOutcome::Progressed;
            };
            self.needs_sector = false;
            self.request = Some(ctx.disk.request_chunk(
                drive.image,
                self.lba * SECTOR_BYTES,
                SECTOR_BYTES,
            ));
        }

        let Some(request) = self.request.as_mut() else {
            // Guest is draining the PIO buffer.
            return TickOutcome::Idle;
        };
        match request.try_take() {
            None => TickOutcome::Yielded,
            Some(Ok(bytes)) => {
                self.request = None;
                self.begin_pio_in(bytes);
                TickOutcome::Progressed
            }
            Some(Err(err)) => {
                self.request = None;
                warn!(lba = self.lba, error = %err, "ide: sector read failed");
                let code = match err {
                    DiskIoError::Cancelled | DiskIoError::UnknownImage(_) => ERR_ABRT,
                    DiskIoError::OutOfBounds { .. } => ERR_IDNF,
                    _ => ERR_UNC | ERR_ABRT,
                };
                self.abort_command(code);
                TickOutcome::Progressed
            }
        }
    }

    fn finish_buffer(&mut self) {
        self.buffer.clear();
        self.index = 0;
        if !self.reading {
            self.status = Status::DRDY;
            self.state = IdeState::Idle;
            return;
        }
        self.lba += 1;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.end_read();
            self.status = Status::DRDY;
            self.state = IdeState::Idle;
        } else {
            self.needs_sector = true;
            self.status = Status::BSY | Status::DRDY;
        }
    }

    fn data_in_u16(&mut self) -> u16 {
        if self.state != IdeState::DataTransfer || !self.status.contains(Status::DRQ) {
            return 0;
        }
        let lo = self.buffer.get(self.index).copied().unwrap_or(0);
        let hi = self.buffer.get(self.index + 1).copied().unwrap_or(0);
        self.index += 2;
        if self.index >= self.buffer.len() {
            self.finish_buffer();
        }
        u16::from_le_bytes([lo, hi])
    }

    fn read_reg(&mut self, port: u16, size: u8) -> u32 {
        if port == IDE_CTRL_PORT {
            return u32::from(self.status.bits());
        }
        match port.wrapping_sub(IDE_CMD_BASE) {
            REG_DATA => match size {
                2 => u32::from(self.data_in_u16()),
                4 => {
                    let lo = u32::from(self.data_in_u16());
                    let hi = u32::from(self.data_in_u16());
                    lo | (hi << 16)
                }
                _ => 0,
            },
            REG_ERROR_FEATURES => u32::from(self.error),
            REG_STATUS_COMMAND => {
                self.irq_pending = false;
                u32::from(self.status.bits())
            }
            reg => u32::from(self.tf.read_reg(reg)),
        }
    }

    fn write_reg(&mut self, port: u16, value: u32) {
        if port == IDE_CTRL_PORT {
            let val = value as u8;
            let prev = self.control;
            self.control = val;
            if (prev & CTRL_SRST) == 0 && (val & CTRL_SRST) != 0 {
                self.reset();
            }
            return;
        }
        match port.wrapping_sub(IDE_CMD_BASE) {
            // PIO writes are not supported; the data port ignores host data.
            REG_DATA => {}
            REG_STATUS_COMMAND => self.write_command(value as u8),
            reg => self.tf.write_reg(reg, value as u8),
        }
    }
}

impl Device for IdeController {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Ide
    }

    fn claims_port(&self, port: u16) -> bool {
        (IDE_CMD_BASE..IDE_CMD_BASE + 8).contains(&port) || port == IDE_CTRL_PORT
    }

    fn port_read(&mut self, port: u16, size: u8) -> u32 {
        if size == 0 {
            return 0;
        }
        self.read_reg(port, size)
    }

    fn port_write(&mut self, port: u16, size: u8, value: u32) {
        if size == 0 {
            return;
        }
        self.write_reg(port, value);
    }

    fn tick(&mut self, ctx: &mut DeviceContext<'_>) -> TickOutcome {
        match self.state {
            IdeState::Idle => TickOutcome::Idle,
            IdeState::CommandPending => {
                self.execute();
                if self.state == IdeState::DataTransfer && self.reading {
                    self.service_read(ctx);
                }
                TickOutcome::Progressed
            }
            IdeState::DataTransfer => self.service_read(ctx),
        }
    }

    fn irq_line(&self) -> Option<u8> {
        Some(IRQ_IDE)
    }

    fn take_interrupt_request(&mut self) -> bool {
        std::mem::take(&mut self.irq_pending)
    }

    fn is_quiescent(&self) -> bool {
        self.request.is_none()
    }

    fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();
        w.bool(self.drive.is_some())
            .u32(self.drive.map_or(0, |d| d.image.0))
            .u64(self.drive.map_or(0, |d| d.total_sectors))
            .u8(self.tf.features)
            .u8(self.tf.sector_count)
            .u8(self.tf.lba0)
            .u8(self.tf.lba1)
            .u8(self.tf.lba2)
            .u8(self.tf.device)
            .u8(self.status.bits())
            .u8(self.error)
            .u8(self.control)
            .u8(self.state as u8)
            .u8(self.command)
            .bool(self.reading)
            .u64(self.lba)
            .u32(self.remaining)
            // An outstanding request is re-issued after restore.
            .bool(self.needs_sector || self.request.is_some())
            .bytes(&self.buffer)
            .u32(self.index as u32)
            .bool(self.irq_pending);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let invalid = |reason| DeviceError::InvalidState {
            device: "ide",
            reason,
        };
        let mut r = StateReader::new(bytes);
        let has_drive = r.bool()?;
        let image = ImageHandle(r.u32()?);
        let total_sectors = r.u64()?;
        let drive = has_drive.then_some(Drive {
            image,
            total_sectors,
        });
        if drive != self.drive {
            return Err(invalid("attached drive differs"));
        }
        let tf = TaskFile {
            features: r.u8()?,
            sector_count: r.u8()?,
            lba0: r.u8()?,
            lba1: r.u8()?,
            lba2: r.u8()?,
            device: r.u8()?,
        };
        let status = Status::from_bits_retain(r.u8()?);
        let error = r.u8()?;
        let control = r.u8()?;
        let state = IdeState::from_u8(r.u8()?).ok_or_else(|| invalid("unknown state"))?;
        let command = r.u8()?;
        let reading = r.bool()?;
        let lba = r.u64()?;
        let remaining = r.u32()?;
        let needs_sector = r.bool()?;
        let buffer = r.bytes(SECTOR)?;
        let index = r.u32()? as usize;
        let irq_pending = r.bool()?;
        if index > buffer.len() {
            return Err(invalid("PIO index past buffer"));
        }
        if reading && (state != IdeState::DataTransfer || remaining == 0) {
            return Err(invalid("read without a data phase"));
        }

        self.tf = tf;
        self.status = status;
        self.error = error;
        self.control = control;
        self.state = state;
        self.command = command;
        self.reading = reading;
        self.lba = lba;
        self.remaining = remaining;
        self.needs_sector = needs_sector;
        self.request = None;
        self.buffer = buffer;
        self.index = index;
        self.irq_pending = irq_pending;
        Ok(())
    }
}

fn write_ata_string(dst_words: &mut [u16], src: &str) {
    let mut bytes = vec![b' '; dst_words.len() * 2];
    let len = src.len().min(bytes.len());
    bytes[..len].copy_from_slice(&src.as_bytes()[..len]);
    for (word, pair) in dst_words.iter_mut().zip(bytes.chunks_exact(2)) {
        *word = u16::from_be_bytes([pair[0], pair[1]]);
    }
}

fn identify_data(total_sectors: u64) -> Vec<u8> {
    let mut words = [0u16; 256];
    let lba28 = total_sectors.min(0x0FFF_FFFF) as u32;
    let cylinders = (total_sectors / (HEADS * SECTORS_PER_TRACK)).clamp(1, 16_383) as u16;

    words[0] = 0x0040;
    words[1] = cylinders;
    words[3] = HEADS as u16;
    words[6] = SECTORS_PER_TRACK as u16;
    write_ata_string(&mut words[10..20], "EMBER0001");
    write_ata_string(&mut words[23..27], "1.0");
    write_ata_string(&mut words[27..47], "EMBER STREAMING DISK");
    words[47] = 0x8001;
    words[49] = 1 << 9;
    words[53] = 0x0001;
    words[54] = cylinders;
    words[55] = HEADS as u16;
    words[56] = SECTORS_PER_TRACK as u16;
    words[60] = (lba28 & 0xFFFF) as u16;
    words[61] = (lba28 >> 16) as u16;

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_identify(ide: &mut IdeController) -> Vec<u16> {
        ide.execute();
        (0..256)
            .map(|_| ide.port_read(IDE_CMD_BASE, 2) as u16)
            .collect()
    }

    #[test]
    fn lba_and_chs_addressing() {
        let mut tf = TaskFile {
            device: 0xE1,
            lba2: 0x02,
            lba1: 0x03,
            lba0: 0x04,
            ..TaskFile::default()
        };
        assert_eq!(tf.lba28(), Some(0x0102_0304));

        tf.device = 0xA0 | 1;
        tf.lba1 = 2;
        tf.lba2 = 0;
        tf.lba0 = 5;
        assert_eq!(tf.lba28(), Some((2 * 16 + 1) * 63 + 4));
        tf.lba0 = 0;
        assert_eq!(tf.lba28(), None);

        tf.sector_count = 0;
        assert_eq!(tf.sector_count28(), 256);
    }

    #[test]
    fn identify_reports_lba_capacity_and_model() {
        let mut ide = IdeController::new(EventBus::new());
        ide.attach(ImageHandle(0), 20_000);
        ide.port_write(IDE_CMD_BASE + 7, 1, u32::from(CMD_IDENTIFY));
        assert_eq!(ide.state(), IdeState::CommandPending);
        assert_eq!(ide.status(), Status::BSY.bits());

        let words = read_identify(&mut ide);
        assert_eq!(words[0], 0x0040);
        assert_ne!(words[49] & (1 << 9), 0);
        assert_eq!(u32::from(words[60]) | (u32::from(words[61]) << 16), 20_000);
        let model: Vec<u8> = words[27..47].iter().flat_map(|w| w.to_be_bytes()).collect();
        assert!(String::from_utf8_lossy(&model).starts_with("EMBER STREAMING DISK"));

        assert_eq!(ide.state(), IdeState::Idle);
        assert_eq!(ide.status(), Status::DRDY.bits());
        assert!(ide.take_interrupt_request());
    }

    #[test]
    fn commands_without_a_drive_abort() {
        let mut ide = IdeController::new(EventBus::new());
        assert_eq!(ide.port_read(IDE_CMD_BASE + 7, 1), 0);
        ide.port_write(IDE_CMD_BASE + 7, 1, u32::from(CMD_IDENTIFY));
        ide.execute();
        assert_eq!(ide.status(), (Status::DRDY | Status::ERR).bits());
        assert_eq!(ide.error(), ERR_ABRT);
    }

    #[test]
    fn out_of_range_read_sets_idnf_without_events() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut ide = IdeController::new(events);
        ide.attach(ImageHandle(0), 100);
        ide.port_write(IDE_CMD_BASE + 2, 1, 2);
        ide.port_write(IDE_CMD_BASE + 3, 1, 99);
        ide.port_write(IDE_CMD_BASE + 6, 1, 0xE0);
        ide.port_write(IDE_CMD_BASE + 7, 1, u32::from(CMD_READ_SECTORS));
        ide.execute();

        assert_eq!(ide.error(), ERR_IDNF);
        assert_eq!(ide.state(), IdeState::Idle);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn srst_and_nien() {
        let mut ide = IdeController::new(EventBus::new());
        ide.attach(ImageHandle(0), 100);
        ide.port_write(IDE_CTRL_PORT, 1, u32::from(CTRL_NIEN));
        ide.port_write(IDE_CMD_BASE + 7, 1, 0xEF);
        ide.execute();
        assert!(!ide.take_interrupt_request());

        ide.port_write(IDE_CMD_BASE + 7, 1, 0x30);
        ide.port_write(IDE_CTRL_PORT, 1, u32::from(CTRL_SRST | CTRL_NIEN));
        ide.port_write(IDE_CTRL_PORT, 1, 0);
        assert_eq!(ide.state(), IdeState::Idle);
        assert_eq!(ide.status(), Status::DRDY.bits());
    }

    #[test]
    fn state_round_trip_mid_identify() {
        let mut ide = IdeController::new(EventBus::new());
        ide.attach(ImageHandle(3), 4096);
        ide.port_write(IDE_CMD_BASE + 7, 1, u32::from(CMD_IDENTIFY));
        ide.execute();
        let first = ide.port_read(IDE_CMD_BASE, 2);
        assert_eq!(first, 0x0040);

        let bytes = ide.save_state();
        let mut restored = IdeController::new(EventBus::new());
        restored.attach(ImageHandle(3), 4096);
        restored.load_state(&bytes).unwrap();
        assert_eq!(restored.state(), IdeState::DataTransfer);
        assert_eq!(restored.port_read(IDE_CMD_BASE, 2), 4);

        let mut other = IdeController::new(EventBus::new());
        other.attach(ImageHandle(4), 4096);
        assert!(matches!(
            other.load_state(&bytes),
            Err(DeviceError::InvalidState { .. })
        ));
    }
}
