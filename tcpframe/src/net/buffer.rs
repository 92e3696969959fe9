use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::error::{Error, Result};

const MINIMUM_SIZE: usize = 32;

/// A growable byte buffer with a single read/write cursor and a high-water mark.
///
/// Writes always happen at `cursor` and advance it; `farthest_write` tracks the
/// furthest point ever written to, and reads past it fail with `Error::ReadPastEnd`
/// rather than returning uninitialized bytes. The allocation is always a power of
/// two no smaller than `MINIMUM_SIZE`, doubling whenever a write would not fit.
pub struct ByteBuffer {
    data: Vec<u8>,
    cursor: usize,
    farthest_write: usize,
}

impl ByteBuffer {
    pub fn new() -> ByteBuffer {
        ByteBuffer {
            data: vec![0u8; MINIMUM_SIZE],
            cursor: 0,
            farthest_write: 0,
        }
    }

    /// Number of bytes written so far (the high-water mark).
    #[inline]
    pub fn len(&self) -> usize {
        self.farthest_write
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.farthest_write == 0
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The written portion of the buffer, `[0, len())`.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.farthest_write]
    }

    /// Take ownership of an externally built buffer. The adopted data is immediately
    /// readable in full: `farthest_write` is set to `length`, not zero.
    pub fn adopt(&mut self, buffer: Vec<u8>) {
        let length = buffer.len();
        self.data = buffer;
        self.cursor = 0;
        self.farthest_write = length;
    }

    /// Reset the cursor and high-water mark without releasing the allocation.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.farthest_write = 0;
    }

    /// Shrink the allocation back to `MINIMUM_SIZE`. Used by long-lived response
    /// buffers so one oversized response doesn't keep every later one inflated.
    pub fn clear_to_min(&mut self) {
        self.reset();
        if self.data.len() > MINIMUM_SIZE {
            self.data = vec![0u8; MINIMUM_SIZE];
        }
    }

    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.farthest_write {
            return Err(Error::ReadPastEnd);
        }
        self.cursor = position;
        Ok(())
    }

    fn resize(&mut self, newsize: usize) {
        let mut actual_size = MINIMUM_SIZE;
        while actual_size < newsize {
            actual_size *= 2;
        }
        if actual_size != self.data.len() {
            self.data.resize(actual_size, 0);
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let count = bytes.len();
        if self.cursor + count >= self.data.len() {
            self.resize(self.cursor + count + 1);
        }
        self.data[self.cursor..self.cursor + count].copy_from_slice(bytes);
        self.cursor += count;
        if self.cursor > self.farthest_write {
            self.farthest_write = self.cursor;
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write(&buf);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(&buf);
    }

    pub fn write_u16_be(&mut self, value: u16) {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.write(&buf);
    }

    /// Write a 16-bit little-endian length prefix followed by the raw bytes.
    pub fn write_string(&mut self, value: &[u8]) {
        self.write_u16(value.len() as u16);
        self.write(value);
    }

    pub fn read(&mut self, count: usize) -> Result<&[u8]> {
        if count + self.cursor > self.farthest_write {
            return Err(Error::ReadPastEnd);
        }
        let start = self.cursor;
        self.cursor += count;
        Ok(&self.data[start..self.cursor])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.read(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.read(4)?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.read(2)?))
    }

    /// Inverse of `write_string`. Returns the exact bytes written, with no UTF-8
    /// decoding, so arbitrary (including non-UTF-8) byte strings round-trip. On
    /// failure before completion, the cursor is restored to its pre-call position.
    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        if self.cursor + 2 > self.farthest_write {
            return Err(Error::ReadPastEnd);
        }
        let length = LittleEndian::read_u16(&self.data[self.cursor..self.cursor + 2]) as usize;

        if self.cursor + 2 + length > self.farthest_write {
            return Err(Error::ReadPastEnd);
        }

        self.cursor += 2;
        let bytes = self.read(length)?;
        Ok(bytes.to_vec())
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        ByteBuffer::new()
    }
}
