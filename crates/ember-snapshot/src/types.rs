use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};
use crate::format::DeviceId;
use crate::io::{ReadLeExt, WriteLeExt};

const MAX_LABEL_LEN: usize = 4 * 1024;
const MAX_FILE_NAME_LEN: usize = 4 * 1024;
const MAX_DISKS: u32 = 64;
const MAX_RESIDENT_RANGES: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotMeta {
    pub snapshot_id: u64,
    pub parent_snapshot_id: Option<u64>,
    pub created_unix_ms: u64,
    pub label: Option<String>,
}

impl SnapshotMeta {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.snapshot_id)?;
        match self.parent_snapshot_id {
            Some(parent) => {
                w.write_u8(1)?;
                w.write_u64_le(parent)?;
            }
            None => w.write_u8(0)?,
        }
        w.write_u64_le(self.created_unix_ms)?;
        match &self.label {
            Some(label) => {
                w.write_u8(1)?;
                w.write_string_u32(label)?;
            }
            None => w.write_u8(0)?,
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let snapshot_id = r.read_u64_le()?;
        let parent_snapshot_id = match r.read_u8()? {
            0 => None,
            1 => Some(r.read_u64_le()?),
            _ => return Err(SnapshotError::Corrupt("invalid parent tag")),
        };
        let created_unix_ms = r.read_u64_le()?;
        let label = match r.read_u8()? {
            0 => None,
            1 => Some(r.read_string_u32(MAX_LABEL_LEN)?),
            _ => return Err(SnapshotError::Corrupt("invalid label tag")),
        };
        Ok(Self {
            snapshot_id,
            parent_snapshot_id,
            created_unix_ms,
            label,
        })
    }
}

/// Architectural CPU state as stored in the CPU section.
///
/// `mode` is the run mode byte (`0` running, `1` halted, `2` shutdown); the machine crate owns
/// its interpretation and rejects unknown values on restore.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub vector_base: u32,
    pub vector_limit: u16,
    pub mode: u8,
    pub interrupt_shadow: bool,
    pub instructions_retired: u64,
}

impl CpuState {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        for reg in self.gpr {
            w.write_u32_le(reg)?;
        }
        w.write_u32_le(self.eip)?;
        w.write_u32_le(self.eflags)?;
        w.write_u32_le(self.vector_base)?;
        w.write_u16_le(self.vector_limit)?;
        w.write_u8(self.mode)?;
        w.write_bool(self.interrupt_shadow)?;
        w.write_u64_le(self.instructions_retired)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut gpr = [0u32; 8];
        for reg in gpr.iter_mut() {
            *reg = r.read_u32_le()?;
        }
        Ok(Self {
            gpr,
            eip: r.read_u32_le()?,
            eflags: r.read_u32_le()?,
            vector_base: r.read_u32_le()?,
            vector_limit: r.read_u16_le()?,
            mode: r.read_u8()?,
            interrupt_shadow: r.read_bool()?,
            instructions_retired: r.read_u64_le()?,
        })
    }
}

/// Opaque, versioned payload of one device. Devices own their own encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub id: DeviceId,
    pub version: u16,
    pub flags: u16,
    pub data: Vec<u8>,
}

impl DeviceState {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.id.0)?;
        w.write_u16_le(self.version)?;
        w.write_u16_le(self.flags)?;
        let len: u64 = self.data.len() as u64;
        w.write_u64_le(len)?;
        w.write_bytes(&self.data)
    }

    pub fn decode<R: Read>(r: &mut R, max_len: u64) -> Result<Self> {
        let id = DeviceId(r.read_u32_le()?);
        let version = r.read_u16_le()?;
        let flags = r.read_u16_le()?;
        let len = r.read_u64_le()?;
        if len > max_len {
            return Err(SnapshotError::Corrupt("device entry too large"));
        }
        let len: usize = len
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("device entry too large"))?;
        let data = r.read_exact_vec(len)?;
        Ok(Self {
            id,
            version,
            flags,
            data,
        })
    }
}

/// Which byte ranges of a streamed disk image were resident when the snapshot was taken. Image
/// contents are never stored; the ranges only tell the restoring side what to prefetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskChunkTable {
    pub image: u32,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    /// Sorted, non-overlapping half-open byte ranges.
    pub resident: Vec<(u64, u64)>,
}

impl DiskChunkTable {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.image)?;
        w.write_string_u32(&self.file_name)?;
        w.write_u64_le(self.total_size)?;
        w.write_u32_le(self.chunk_size)?;
        let count: u32 = self
            .resident
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many resident ranges"))?;
        w.write_u32_le(count)?;
        for &(start, end) in &self.resident {
            w.write_u64_le(start)?;
            w.write_u64_le(end)?;
        }
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let image = r.read_u32_le()?;
        let file_name = r.read_string_u32(MAX_FILE_NAME_LEN)?;
        let total_size = r.read_u64_le()?;
        let chunk_size = r.read_u32_le()?;
        let count = r.read_u32_le()?;
        if count > MAX_RESIDENT_RANGES {
            return Err(SnapshotError::Corrupt("too many resident ranges"));
        }
        let mut resident = Vec::with_capacity(count.min(1024) as usize);
        let mut prev_end = 0u64;
        for _ in 0..count {
            let start = r.read_u64_le()?;
            let end = r.read_u64_le()?;
            if start >= end || start < prev_end || end > total_size {
                return Err(SnapshotError::Corrupt("invalid resident range"));
            }
            prev_end = end;
            resident.push((start, end));
        }
        Ok(Self {
            image,
            file_name,
            total_size,
            chunk_size,
            resident,
        })
    }
}

pub(crate) fn encode_disk_tables<W: Write>(w: &mut W, tables: &[DiskChunkTable]) -> Result<()> {
    let count: u32 = tables
        .len()
        .try_into()
        .map_err(|_| SnapshotError::Corrupt("too many disks"))?;
    w.write_u32_le(count)?;
    for table in tables {
        table.encode(w)?;
    }
    Ok(())
}

pub(crate) fn decode_disk_tables<R: Read>(r: &mut R) -> Result<Vec<DiskChunkTable>> {
    let count = r.read_u32_le()?;
    if count > MAX_DISKS {
        return Err(SnapshotError::Corrupt("too many disks"));
    }
    let mut tables = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tables.push(DiskChunkTable::decode(r)?);
    }
    Ok(tables)
}
