use thiserror::Error;

/// Granularity of dirty tracking (and of incremental RAM snapshots).
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    pub fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory fault: {width:?} access at {addr:#x}")]
pub struct MemoryFault {
    pub addr: u64,
    pub width: AccessWidth,
}

/// A read-only window `[start, end)` inside guest memory (BIOS / option ROM images).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomRange {
    pub start: u64,
    pub end: u64,
}

impl RomRange {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

#[derive(Debug, Clone)]
pub struct GuestMemory {
    data: Vec<u8>,
    roms: Vec<RomRange>,
    dirty: DirtyBitmap,
}

impl GuestMemory {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            roms: Vec::new(),
            dirty: DirtyBitmap::new(len, PAGE_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn rom_ranges(&self) -> &[RomRange] {
        &self.roms
    }

    fn span(&self, addr: u64, len: usize, width: AccessWidth) -> Result<usize, MemoryFault> {
        let fault = MemoryFault { addr, width };
        let start = usize::try_from(addr).map_err(|_| fault)?;
        let end = start.checked_add(len).ok_or(fault)?;
        if end > self.data.len() {
            return Err(fault);
        }
        Ok(start)
    }

    pub fn read(&self, addr: u64, width: AccessWidth) -> Result<u32, MemoryFault> {
        let start = self.span(addr, width.bytes(), width)?;
        let mut bytes = [0u8; 4];
        bytes[..width.bytes()].copy_from_slice(&self.data[start..start + width.bytes()]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Guest-visible store. Bytes landing in a ROM range are dropped, matching PC chipsets that
    /// ignore writes to shadowed BIOS areas.
    pub fn write(&mut self, addr: u64, width: AccessWidth, value: u32) -> Result<(), MemoryFault> {
        let start = self.span(addr, width.bytes(), width)?;
        let bytes = value.to_le_bytes();
        for (i, byte) in bytes.iter().take(width.bytes()).enumerate() {
            let a = addr + i as u64;
            if self.is_rom(a) {
                continue;
            }
            self.data[start + i] = *byte;
            self.dirty.mark_addr(start + i);
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryFault> {
        Ok(self.read(addr, AccessWidth::Byte)? as u8)
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryFault> {
        Ok(self.read(addr, AccessWidth::Word)? as u16)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryFault> {
        self.read(addr, AccessWidth::Dword)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), MemoryFault> {
        self.write(addr, AccessWidth::Byte, u32::from(value))
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MemoryFault> {
        self.write(addr, AccessWidth::Word, u32::from(value))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryFault> {
        self.write(addr, AccessWidth::Dword, value)
    }

    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryFault> {
        let start = self.span(addr, dst.len(), AccessWidth::Byte)?;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        Ok(())
    }

    /// Device-initiated bulk store (DMA-style). Honors ROM ranges and dirty tracking.
    pub fn write_bytes(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        let start = self.span(addr, src.len(), AccessWidth::Byte)?;
        for (i, byte) in src.iter().enumerate() {
            if self.is_rom(addr + i as u64) {
                continue;
            }
            self.data[start + i] = *byte;
            self.dirty.mark_addr(start + i);
        }
        Ok(())
    }

    /// Copy a firmware image to `base` and mark it read-only.
    pub fn load_rom(&mut self, base: u64, image: &[u8]) -> Result<(), MemoryFault> {
        let start = self.span(base, image.len(), AccessWidth::Byte)?;
        self.data[start..start + image.len()].copy_from_slice(image);
        self.add_rom_range(RomRange {
            start: base,
            end: base + image.len() as u64,
        })
    }

    /// Re-establish a ROM window without touching contents (snapshot restore).
    pub fn add_rom_range(&mut self, range: RomRange) -> Result<(), MemoryFault> {
        if range.start > range.end {
            return Err(MemoryFault {
                addr: range.start,
                width: AccessWidth::Byte,
            });
        }
        self.span(
            range.start,
            (range.end - range.start) as usize,
            AccessWidth::Byte,
        )?;
        if !range_is_empty(range) && !self.roms.contains(&range) {
            self.roms.push(range);
            self.roms.sort_by_key(|r| (r.start, r.end));
        }
        Ok(())
    }

    pub fn clear_rom_ranges(&mut self) {
        self.roms.clear();
    }

    /// Snapshot restore path: ignores ROM protection and does not dirty pages.
    pub fn restore_bytes(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryFault> {
        let start = self.span(addr, src.len(), AccessWidth::Byte)?;
        self.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn take_dirty_pages(&mut self) -> Vec<u64> {
        self.dirty.take()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    fn is_rom(&self, addr: u64) -> bool {
        self.roms.iter().any(|r| r.contains(addr))
    }
}

fn range_is_empty(range: RomRange) -> bool {
    range.start >= range.end
}

#[derive(Debug, Clone)]
struct DirtyBitmap {
    bits: Vec<u64>,
    pages: usize,
    page_size: usize,
}

impl DirtyBitmap {
    fn new(mem_len: usize, page_size: usize) -> Self {
        let pages = mem_len.div_ceil(page_size);
        Self {
            bits: vec![0u64; pages.div_ceil(64)],
            pages,
            page_size,
        }
    }

    fn mark_addr(&mut self, addr: usize) {
        let page = addr / self.page_size;
        if page < self.pages {
            self.bits[page / 64] |= 1u64 << (page % 64);
        }
    }

    fn take(&mut self) -> Vec<u64> {
        let mut pages = Vec::new();
        for (word_idx, word) in self.bits.iter_mut().enumerate() {
            let mut w = std::mem::take(word);
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                pages.push((word_idx * 64 + bit) as u64);
                w &= w - 1;
            }
        }
        pages
    }

    fn clear(&mut self) {
        self.bits.fill(0);
    }
}
