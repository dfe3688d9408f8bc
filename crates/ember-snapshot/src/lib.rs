//! Versioned, self-describing machine snapshot container.
//!
//! A blob is a fixed header followed by tagged, length-prefixed sections and a trailing
//! `INTEGRITY` section holding a SHA-256 digest of every preceding byte. Readers skip sections
//! they do not recognise.

mod error;
mod format;
pub mod io;
mod ram;
mod types;

pub use crate::error::{Result, SnapshotError};
pub use crate::format::{
    DeviceId, SectionId, DIGEST_LEN, HEADER_LEN, SECTION_HEADER_LEN, SNAPSHOT_ENDIANNESS_LITTLE,
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION_CURRENT, SNAPSHOT_VERSION_V1,
};
pub use crate::ram::{Compression, RamMode, RamWriteOptions};
pub use crate::types::{CpuState, DeviceState, DiskChunkTable, SnapshotMeta};

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

use crate::io::{ReadLeExt, WriteLeExt};

const MAX_DEVICES_SECTION_LEN: u64 = 256 * 1024 * 1024;
const MAX_DEVICE_COUNT: usize = 4096;
const MAX_DEVICE_ENTRY_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    pub ram: RamWriteOptions,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Id of the snapshot the target currently reflects. An incremental (dirty RAM) blob is
    /// rejected unless its parent id equals this; full blobs ignore it.
    pub expected_parent_snapshot_id: Option<u64>,
}

pub trait SnapshotSource {
    fn snapshot_meta(&mut self) -> SnapshotMeta;
    fn cpu_state(&self) -> CpuState;
    fn device_states(&self) -> Vec<DeviceState>;
    fn disk_chunk_tables(&self) -> Vec<DiskChunkTable>;

    fn ram_len(&self) -> usize;
    fn read_ram(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Return and clear the pages written since the last snapshot, as `offset / page_size`.
    fn take_dirty_pages(&mut self) -> Option<Vec<u64>>;

    /// Video memory length; zero omits the `VRAM` section.
    fn vram_len(&self) -> usize {
        0
    }
    fn read_vram(&self, _offset: u64, _buf: &mut [u8]) -> Result<()> {
        Err(SnapshotError::Corrupt("source has no video memory"))
    }
}

/// Receiver of decoded sections. Every hook may reject its input; `restore_snapshot` stops at
/// the first error, so a target that stages state can discard it untouched.
pub trait SnapshotTarget {
    fn restore_meta(&mut self, _meta: SnapshotMeta) -> Result<()> {
        Ok(())
    }
    fn restore_cpu_state(&mut self, state: CpuState) -> Result<()>;
    fn restore_device_states(&mut self, states: Vec<DeviceState>) -> Result<()>;
    fn restore_disk_chunk_tables(&mut self, tables: Vec<DiskChunkTable>) -> Result<()>;

    fn ram_len(&self) -> usize;
    fn write_ram(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Video memory length; a non-zero value makes the `VRAM` section mandatory.
    fn vram_len(&self) -> usize {
        0
    }
    fn write_vram(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        Err(SnapshotError::Corrupt("unexpected VRAM section"))
    }

    fn post_restore(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn save_snapshot<S: SnapshotSource>(source: &mut S, options: SaveOptions) -> Result<Vec<u8>> {
    let mut w = Cursor::new(Vec::new());
    write_file_header(&mut w)?;

    write_section(&mut w, SectionId::META, 1, 0, |w| {
        source.snapshot_meta().encode(w)
    })?;

    write_section(&mut w, SectionId::CPU, 1, 0, |w| source.cpu_state().encode(w))?;

    write_section(&mut w, SectionId::DEVICES, 1, 0, |w| {
        let mut devices = source.device_states();
        devices.sort_by_key(|device| (device.id, device.version, device.flags));
        let count: u32 = devices
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many devices"))?;
        w.write_u32_le(count)?;
        for device in &devices {
            device.encode(w)?;
        }
        Ok(())
    })?;

    write_section(&mut w, SectionId::DISKS, 1, 0, |w| {
        let mut disks = source.disk_chunk_tables();
        disks.sort_by_key(|disk| disk.image);
        types::encode_disk_tables(w, &disks)
    })?;

    write_section(&mut w, SectionId::RAM, 1, 0, |w| {
        let total_len = source.ram_len() as u64;
        let dirty_pages = match options.ram.mode {
            RamMode::Full => {
                // A full image resets the incremental baseline.
                let _ = source.take_dirty_pages();
                None
            }
            RamMode::Dirty => {
                let mut pages = source
                    .take_dirty_pages()
                    .ok_or(SnapshotError::Corrupt("dirty-page tracking not available"))?;
                pages.sort_unstable();
                pages.dedup();
                Some(pages)
            }
        };
        ram::encode_ram_section(
            w,
            total_len,
            options.ram,
            dirty_pages.as_deref(),
            |offset, buf| source.read_ram(offset, buf),
        )
    })?;

    let vram_len = source.vram_len() as u64;
    if vram_len != 0 {
        write_section(&mut w, SectionId::VRAM, 1, 0, |w| {
            let opts = RamWriteOptions {
                mode: RamMode::Full,
                ..options.ram
            };
            ram::encode_ram_section(w, vram_len, opts, None, |offset, buf| {
                source.read_vram(offset, buf)
            })
        })?;
    }

    let mut bytes = w.into_inner();
    let digest = Sha256::digest(&bytes);
    bytes.write_u32_le(SectionId::INTEGRITY.0)?;
    bytes.write_u16_le(1)?;
    bytes.write_u16_le(0)?;
    bytes.write_u64_le(DIGEST_LEN as u64)?;
    bytes.write_bytes(&digest)?;
    Ok(bytes)
}

/// Validate and decode `bytes` into `target`.
///
/// Checks run header first (magic, version, endianness), then the integrity trailer, then each
/// section in order. Nothing is handed to `target` until the digest matches.
///
/// Incremental blobs are applied without checking their parent; see [`restore_snapshot_checked`].
pub fn restore_snapshot<T: SnapshotTarget>(bytes: &[u8], target: &mut T) -> Result<()> {
    restore_snapshot_impl(bytes, target, None)
}

/// [`restore_snapshot`], additionally rejecting an incremental blob whose parent is not
/// `options.expected_parent_snapshot_id`. The check runs before any RAM is written.
pub fn restore_snapshot_checked<T: SnapshotTarget>(
    bytes: &[u8],
    target: &mut T,
    options: RestoreOptions,
) -> Result<()> {
    restore_snapshot_impl(bytes, target, Some(options))
}

fn restore_snapshot_impl<T: SnapshotTarget>(
    bytes: &[u8],
    target: &mut T,
    options: Option<RestoreOptions>,
) -> Result<()> {
    let mut r = Cursor::new(bytes);
    read_file_header(&mut r)?;

    let body = verify_integrity(bytes)?;
    let mut r = Cursor::new(&body[HEADER_LEN..]);

    let mut seen_cpu = false;
    let mut seen_ram = false;
    let mut seen_vram = false;
    let mut parent_id = None;

    while let Some(header) = read_section_header(&mut r)? {
        if header.id == SectionId::INTEGRITY {
            return Err(SnapshotError::Corrupt("integrity section not at end"));
        }
        if header.id == SectionId::DEVICES && header.len > MAX_DEVICES_SECTION_LEN {
            return Err(SnapshotError::Corrupt("devices section too large"));
        }

        let mut section = (&mut r).take(header.len);
        match header.id {
            SectionId::META if header.version == 1 => {
                let meta = SnapshotMeta::decode(&mut section)?;
                parent_id = meta.parent_snapshot_id;
                target.restore_meta(meta)?;
            }
            SectionId::CPU if header.version == 1 => {
                target.restore_cpu_state(CpuState::decode(&mut section)?)?;
                seen_cpu = true;
            }
            SectionId::DEVICES if header.version == 1 => {
                let count = section.read_u32_le()? as usize;
                if count > MAX_DEVICE_COUNT {
                    return Err(SnapshotError::Corrupt("too many devices"));
                }
                let mut devices = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    devices.push(DeviceState::decode(&mut section, MAX_DEVICE_ENTRY_LEN)?);
                }
                target.restore_device_states(devices)?;
            }
            SectionId::DISKS if header.version == 1 => {
                target.restore_disk_chunk_tables(types::decode_disk_tables(&mut section)?)?;
            }
            SectionId::RAM if header.version == 1 => {
                let expected_len = target.ram_len() as u64;
                let check_parent = |mode: RamMode| match (mode, options) {
                    (RamMode::Dirty, Some(options))
                        if options.expected_parent_snapshot_id.is_none()
                            || parent_id != options.expected_parent_snapshot_id =>
                    {
                        Err(SnapshotError::ParentMismatch {
                            expected: options.expected_parent_snapshot_id,
                            found: parent_id,
                        })
                    }
                    _ => Ok(()),
                };
                ram::decode_ram_section_checked(
                    &mut section,
                    expected_len,
                    check_parent,
                    |offset, data| target.write_ram(offset, data),
                )?;
                seen_ram = true;
            }
            SectionId::VRAM if header.version == 1 => {
                let expected_len = target.vram_len() as u64;
                let full_only = |mode: RamMode| match mode {
                    RamMode::Full => Ok(()),
                    RamMode::Dirty => Err(SnapshotError::Corrupt("VRAM section must be full")),
                };
                ram::decode_ram_section_checked(
                    &mut section,
                    expected_len,
                    full_only,
                    |offset, data| target.write_vram(offset, data),
                )
                .map_err(|err| match err {
                    SnapshotError::RamLenMismatch { expected, found } => {
                        SnapshotError::VramLenMismatch { expected, found }
                    }
                    err => err,
                })?;
                seen_vram = true;
            }
            _ => {}
        }

        // Skip unknown sections and trailing bytes inside known ones.
        std::io::copy(&mut section, &mut std::io::sink())?;
        if section.limit() != 0 {
            return Err(SnapshotError::Corrupt("truncated section payload"));
        }
    }

    if !seen_cpu {
        return Err(SnapshotError::Corrupt("missing CPU section"));
    }
    if !seen_ram {
        return Err(SnapshotError::Corrupt("missing RAM section"));
    }
    if !seen_vram && target.vram_len() != 0 {
        return Err(SnapshotError::Corrupt("missing VRAM section"));
    }
    target.post_restore()
}

#[derive(Debug, Clone, Copy)]
struct SectionHeader {
    id: SectionId,
    version: u16,
    len: u64,
}

fn write_file_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_bytes(SNAPSHOT_MAGIC)?;
    w.write_u16_le(SNAPSHOT_VERSION_CURRENT)?;
    w.write_u8(SNAPSHOT_ENDIANNESS_LITTLE)?;
    w.write_u8(0)?; // reserved
    w.write_u32_le(0)?; // flags
    Ok(())
}

fn read_file_header<R: Read>(r: &mut R) -> Result<()> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|_| SnapshotError::Corrupt("truncated header"))?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let version = r
        .read_u16_le()
        .map_err(|_| SnapshotError::Corrupt("truncated header"))?;
    if version == 0 {
        return Err(SnapshotError::Corrupt("invalid version"));
    }
    if version > SNAPSHOT_VERSION_CURRENT {
        return Err(SnapshotError::IncompatibleVersion {
            found: version,
            supported: SNAPSHOT_VERSION_CURRENT,
        });
    }
    let endianness = r
        .read_u8()
        .map_err(|_| SnapshotError::Corrupt("truncated header"))?;
    if endianness != SNAPSHOT_ENDIANNESS_LITTLE {
        return Err(SnapshotError::InvalidEndianness(endianness));
    }
    Ok(())
}

/// Check the trailing digest and return the covered prefix (header plus sections).
fn verify_integrity(bytes: &[u8]) -> Result<&[u8]> {
    let trailer_len = SECTION_HEADER_LEN + DIGEST_LEN;
    if bytes.len() < HEADER_LEN + trailer_len {
        return Err(SnapshotError::Corrupt("missing integrity section"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - trailer_len);

    let mut r = Cursor::new(trailer);
    let header = read_section_header(&mut r)?
        .ok_or(SnapshotError::Corrupt("missing integrity section"))?;
    if header.id != SectionId::INTEGRITY || header.len != DIGEST_LEN as u64 {
        return Err(SnapshotError::Corrupt("missing integrity section"));
    }

    let expected = &trailer[SECTION_HEADER_LEN..];
    if Sha256::digest(body).as_slice() != expected {
        return Err(SnapshotError::IntegrityMismatch);
    }
    Ok(body)
}

fn write_section<W: Write + Seek>(
    w: &mut W,
    id: SectionId,
    version: u16,
    flags: u16,
    f: impl FnOnce(&mut W) -> Result<()>,
) -> Result<()> {
    let header_pos = w.stream_position()?;
    w.write_u32_le(id.0)?;
    w.write_u16_le(version)?;
    w.write_u16_le(flags)?;
    w.write_u64_le(0)?; // patched below

    let payload_start = w.stream_position()?;
    f(w)?;
    let payload_end = w.stream_position()?;

    let len = payload_end
        .checked_sub(payload_start)
        .ok_or(SnapshotError::Corrupt("stream position underflow"))?;

    w.seek(SeekFrom::Start(header_pos + 8))?;
    w.write_u64_le(len)?;
    w.seek(SeekFrom::Start(payload_end))?;
    Ok(())
}

fn read_section_header<R: Read>(r: &mut R) -> Result<Option<SectionHeader>> {
    let mut first = [0u8; 1];
    if r.read(&mut first)? == 0 {
        return Ok(None);
    }
    let mut tag_bytes = [0u8; 4];
    tag_bytes[0] = first[0];
    r.read_exact(&mut tag_bytes[1..])?;
    let id = SectionId(u32::from_le_bytes(tag_bytes));
    let version = r.read_u16_le()?;
    let _flags = r.read_u16_le()?;
    let len = r.read_u64_le()?;
    Ok(Some(SectionHeader { id, version, len }))
}
