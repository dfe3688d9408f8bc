//! Device payload encoding. Payloads are versioned by the container entry, not inline.

use std::io::Cursor;

use ember_snapshot::io::ReadLeExt;

use crate::DeviceError;

/// Infallible little-endian encoder for device payloads.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(u8::from(v))
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// `u32` length followed by the bytes.
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Decoder over a device payload. Every read fails cleanly on truncation.
pub struct StateReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> StateReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn u8(&mut self) -> Result<u8, DeviceError> {
        Ok(self.cursor.read_u8()?)
    }

    pub fn bool(&mut self) -> Result<bool, DeviceError> {
        Ok(self.cursor.read_bool()?)
    }

    pub fn u16(&mut self) -> Result<u16, DeviceError> {
        Ok(self.cursor.read_u16_le()?)
    }

    pub fn u32(&mut self) -> Result<u32, DeviceError> {
        Ok(self.cursor.read_u32_le()?)
    }

    pub fn u64(&mut self) -> Result<u64, DeviceError> {
        Ok(self.cursor.read_u64_le()?)
    }

    pub fn bytes(&mut self, max: usize) -> Result<Vec<u8>, DeviceError> {
        Ok(self.cursor.read_len_prefixed_bytes_u32(max)?)
    }
}
