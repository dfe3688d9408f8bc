use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};
use crate::io::{ReadLeExt, WriteLeExt};

const MAX_PAGE_SIZE: u32 = 2 * 1024 * 1024;
const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RamMode {
    /// Every byte of guest RAM, in fixed-size chunks.
    Full = 0,
    /// Only pages written since the previous snapshot; applied over existing RAM.
    Dirty = 1,
}

impl RamMode {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RamMode::Full),
            1 => Ok(RamMode::Dirty),
            _ => Err(SnapshotError::Corrupt("invalid ram mode")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl Compression {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(SnapshotError::Corrupt("invalid compression kind")),
        }
    }

    fn compress(self, input: &[u8]) -> Vec<u8> {
        match self {
            Compression::None => input.to_vec(),
            Compression::Lz4 => lz4_flex::block::compress(input),
        }
    }

    fn decompress(self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        match self {
            Compression::None => {
                if compressed.len() != expected_len {
                    return Err(SnapshotError::Corrupt("uncompressed block length mismatch"));
                }
                Ok(compressed.to_vec())
            }
            Compression::Lz4 => {
                let out = lz4_flex::block::decompress(compressed, expected_len)?;
                if out.len() != expected_len {
                    return Err(SnapshotError::Corrupt("lz4 block length mismatch"));
                }
                Ok(out)
            }
        }
    }

    /// Upper bound on the encoded size of a block, used to reject absurd length prefixes before
    /// allocating.
    fn max_encoded_len(self, uncompressed_len: u32) -> u32 {
        match self {
            Compression::None => uncompressed_len,
            // LZ4 worst case: n + n/255 + 16.
            Compression::Lz4 => uncompressed_len
                .saturating_add(uncompressed_len / 255)
                .saturating_add(16),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamWriteOptions {
    pub mode: RamMode,
    pub compression: Compression,
    pub page_size: u32,
    pub chunk_size: u32,
}

impl Default for RamWriteOptions {
    fn default() -> Self {
        Self {
            mode: RamMode::Full,
            compression: Compression::Lz4,
            page_size: 4096,
            chunk_size: 1024 * 1024,
        }
    }
}

/// Section layout:
///
/// ```text
/// u64 total_len | u32 page_size | u8 mode | u8 compression | u16 reserved
/// Full:  u32 chunk_size, then per chunk: u32 raw_len | u32 enc_len | bytes
/// Dirty: u64 count, then per page:   u64 page_idx | u32 raw_len | u32 enc_len | bytes
/// ```
pub(crate) fn encode_ram_section<W: Write>(
    w: &mut W,
    total_len: u64,
    opts: RamWriteOptions,
    dirty_pages: Option<&[u64]>,
    mut read_ram: impl FnMut(u64, &mut [u8]) -> Result<()>,
) -> Result<()> {
    if opts.page_size == 0 || opts.page_size > MAX_PAGE_SIZE {
        return Err(SnapshotError::Corrupt("invalid page size"));
    }
    if opts.chunk_size == 0 || opts.chunk_size > MAX_CHUNK_SIZE {
        return Err(SnapshotError::Corrupt("invalid chunk size"));
    }

    w.write_u64_le(total_len)?;
    w.write_u32_le(opts.page_size)?;
    w.write_u8(opts.mode as u8)?;
    w.write_u8(opts.compression as u8)?;
    w.write_u16_le(0)?;

    match opts.mode {
        RamMode::Full => {
            w.write_u32_le(opts.chunk_size)?;
            let step = u64::from(opts.chunk_size);
            let mut buf = vec![0u8; opts.chunk_size as usize];
            let mut offset = 0u64;
            while offset < total_len {
                let len = (total_len - offset).min(step) as usize;
                read_ram(offset, &mut buf[..len])?;
                write_block(w, opts.compression, &buf[..len])?;
                offset += len as u64;
            }
        }
        RamMode::Dirty => {
            let pages = dirty_pages.ok_or(SnapshotError::Corrupt(
                "dirty ram mode requires dirty page list",
            ))?;
            w.write_u64_le(pages.len() as u64)?;
            let page_size = u64::from(opts.page_size);
            let mut buf = vec![0u8; opts.page_size as usize];
            for &page in pages {
                let offset = page
                    .checked_mul(page_size)
                    .filter(|&o| o < total_len)
                    .ok_or(SnapshotError::Corrupt("dirty page out of range"))?;
                let len = (total_len - offset).min(page_size) as usize;
                read_ram(offset, &mut buf[..len])?;
                w.write_u64_le(page)?;
                write_block(w, opts.compression, &buf[..len])?;
            }
        }
    }
    Ok(())
}

fn write_block<W: Write>(w: &mut W, compression: Compression, raw: &[u8]) -> Result<()> {
    let encoded = compression.compress(raw);
    w.write_u32_le(raw.len() as u32)?;
    w.write_u32_le(
        encoded
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("encoded block too large"))?,
    )?;
    w.write_bytes(&encoded)
}

fn read_block<R: Read>(r: &mut R, compression: Compression, expected_len: u32) -> Result<Vec<u8>> {
    let raw_len = r.read_u32_le()?;
    if raw_len != expected_len {
        return Err(SnapshotError::Corrupt("ram block length mismatch"));
    }
    let enc_len = r.read_u32_le()?;
    if enc_len > compression.max_encoded_len(raw_len) {
        return Err(SnapshotError::Corrupt("ram block encoded length too large"));
    }
    let encoded = r.read_exact_vec(enc_len as usize)?;
    compression.decompress(&encoded, raw_len as usize)
}

#[cfg(test)]
pub(crate) fn decode_ram_section_into<R: Read>(
    r: &mut R,
    expected_total_len: u64,
    write_ram: impl FnMut(u64, &[u8]) -> Result<()>,
) -> Result<()> {
    decode_ram_section_checked(r, expected_total_len, |_| Ok(()), write_ram)
}

/// Like `decode_ram_section_into`, but `check_mode` sees the section mode before any
/// `write_ram` call and may reject it.
pub(crate) fn decode_ram_section_checked<R: Read>(
    r: &mut R,
    expected_total_len: u64,
    check_mode: impl FnOnce(RamMode) -> Result<()>,
    mut write_ram: impl FnMut(u64, &[u8]) -> Result<()>,
) -> Result<()> {
    let total_len = r.read_u64_le()?;
    if total_len != expected_total_len {
        return Err(SnapshotError::RamLenMismatch {
            expected: expected_total_len,
            found: total_len,
        });
    }
    let page_size = r.read_u32_le()?;
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(SnapshotError::Corrupt("invalid page size"));
    }
    let mode = RamMode::from_u8(r.read_u8()?)?;
    let compression = Compression::from_u8(r.read_u8()?)?;
    let _reserved = r.read_u16_le()?;
    check_mode(mode)?;

    match mode {
        RamMode::Full => {
            let chunk_size = r.read_u32_le()?;
            if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                return Err(SnapshotError::Corrupt("invalid chunk size"));
            }
            let mut offset = 0u64;
            while offset < total_len {
                let expected = (total_len - offset).min(u64::from(chunk_size)) as u32;
                let data = read_block(r, compression, expected)?;
                write_ram(offset, &data)?;
                offset += u64::from(expected);
            }
        }
        RamMode::Dirty => {
            let count = r.read_u64_le()?;
            let page_size = u64::from(page_size);
            let max_pages = total_len.div_ceil(page_size);
            if count > max_pages {
                return Err(SnapshotError::Corrupt("too many dirty pages"));
            }
            for _ in 0..count {
                let page = r.read_u64_le()?;
                let offset = page
                    .checked_mul(page_size)
                    .filter(|&o| o < total_len)
                    .ok_or(SnapshotError::Corrupt("dirty page out of range"))?;
                let expected = (total_len - offset).min(page_size) as u32;
                let data = read_block(r, compression, expected)?;
                write_ram(offset, &data)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(ram: &[u8], opts: RamWriteOptions, dirty: Option<&[u64]>) -> Vec<u8> {
        let mut out = Vec::new();
        encode_ram_section(&mut out, ram.len() as u64, opts, dirty, |off, buf| {
            let off = off as usize;
            buf.copy_from_slice(&ram[off..off + buf.len()]);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn full_mode_with_partial_last_chunk() {
        let ram: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let opts = RamWriteOptions {
            chunk_size: 4096,
            ..RamWriteOptions::default()
        };
        let bytes = encode(&ram, opts, None);

        let mut restored = vec![0u8; ram.len()];
        decode_ram_section_into(&mut Cursor::new(&bytes), ram.len() as u64, |off, data| {
            let off = off as usize;
            restored[off..off + data.len()].copy_from_slice(data);
            Ok(())
        })
        .unwrap();
        assert_eq!(restored, ram);
    }

    #[test]
    fn dirty_mode_only_touches_listed_pages() {
        let ram = vec![0x5Au8; 3 * 4096];
        let opts = RamWriteOptions {
            mode: RamMode::Dirty,
            compression: Compression::None,
            ..RamWriteOptions::default()
        };
        let bytes = encode(&ram, opts, Some(&[1]));

        let mut touched = Vec::new();
        decode_ram_section_into(&mut Cursor::new(&bytes), ram.len() as u64, |off, data| {
            touched.push((off, data.len()));
            Ok(())
        })
        .unwrap();
        assert_eq!(touched, vec![(4096, 4096)]);
    }

    #[test]
    fn ram_length_mismatch_is_reported() {
        let bytes = encode(&[0u8; 64], RamWriteOptions::default(), None);
        let err = decode_ram_section_into(&mut Cursor::new(&bytes), 128, |_, _| Ok(())).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::RamLenMismatch {
                expected: 128,
                found: 64
            }
        ));
    }

    #[test]
    fn rejected_mode_writes_nothing() {
        let ram = vec![0x11u8; 2 * 4096];
        let opts = RamWriteOptions {
            mode: RamMode::Dirty,
            ..RamWriteOptions::default()
        };
        let bytes = encode(&ram, opts, Some(&[0, 1]));

        let mut writes = 0;
        let err = decode_ram_section_checked(
            &mut Cursor::new(&bytes),
            ram.len() as u64,
            |mode| match mode {
                RamMode::Dirty => Err(SnapshotError::Corrupt("dirty not allowed")),
                RamMode::Full => Ok(()),
            },
            |_, _| {
                writes += 1;
                Ok(())
            },
        )
        .unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt("dirty not allowed")));
        assert_eq!(writes, 0);
    }
}
