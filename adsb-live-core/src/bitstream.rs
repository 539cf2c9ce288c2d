//! Bit-level cursor over a byte buffer.
//!
//! Mode S fields rarely sit on byte boundaries (5-bit DF, 3-bit CA, 24-bit
//! address, 56-bit ME), so decoders read them through a `BitStream`:
//! - Fields of 1-64 bits, big-endian, returned right-aligned
//! - Forward and backward seeking by bit count
//! - Byte-aligned whole-byte reads skip the shift loop
//!
//! A stream is not thread-safe. Reuse one instance across frames with
//! `initialise()` instead of building a new one per frame.

use crate::types::{AdsbError, Result};

/// Cursor over a borrowed byte buffer.
#[derive(Debug, Clone, Default)]
pub struct BitStream<'a> {
    buffer: &'a [u8],
    bit_position: usize,
}

impl<'a> BitStream<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        BitStream {
            buffer,
            bit_position: 0,
        }
    }

    /// Point the stream at a new buffer and rewind to bit 0.
    pub fn initialise(&mut self, buffer: &'a [u8]) {
        self.buffer = buffer;
        self.bit_position = 0;
    }

    /// Current cursor position in bits from the start of the buffer.
    pub fn position(&self) -> usize {
        self.bit_position
    }

    /// Total length of the buffer in bits.
    pub fn len_bits(&self) -> usize {
        self.buffer.len() * 8
    }

    /// Bits left between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.len_bits() - self.bit_position
    }

    /// Move the cursor by `count` bits. Negative counts seek backwards.
    ///
    /// The cursor is left untouched when the move would leave the buffer.
    pub fn skip(&mut self, count: isize) -> Result<()> {
        if count >= 0 {
            let count = count as usize;
            if count > self.remaining() {
                return Err(AdsbError::EndOfStream);
            }
            self.bit_position += count;
        } else {
            let back = count.unsigned_abs();
            if back > self.bit_position {
                return Err(AdsbError::StartOfStream);
            }
            self.bit_position -= back;
        }
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        if self.remaining() == 0 {
            return Err(AdsbError::EndOfStream);
        }
        let byte = self.buffer[self.bit_position / 8];
        let bit = (byte >> (7 - (self.bit_position % 8))) & 1;
        self.bit_position += 1;
        Ok(bit == 1)
    }

    /// Read up to 8 bits.
    pub fn read_u8(&mut self, width: u32) -> Result<u8> {
        self.read_raw(width, 8).map(|v| v as u8)
    }

    /// Read up to 16 bits.
    pub fn read_u16(&mut self, width: u32) -> Result<u16> {
        self.read_raw(width, 16).map(|v| v as u16)
    }

    /// Read up to 32 bits.
    pub fn read_u32(&mut self, width: u32) -> Result<u32> {
        self.read_raw(width, 32).map(|v| v as u32)
    }

    /// Read up to 64 bits.
    pub fn read_u64(&mut self, width: u32) -> Result<u64> {
        self.read_raw(width, 64)
    }

    fn read_raw(&mut self, width: u32, max: u32) -> Result<u64> {
        if width == 0 || width > max {
            return Err(AdsbError::InvalidWidth { width, max });
        }
        if width as usize > self.remaining() {
            return Err(AdsbError::EndOfStream);
        }

        if self.bit_position % 8 == 0 && width % 8 == 0 {
            let start = self.bit_position / 8;
            let end = start + (width / 8) as usize;
            let value = self.buffer[start..end]
                .iter()
                .fold(0u64, |acc, &b| (acc << 8) | b as u64);
            self.bit_position += width as usize;
            return Ok(value);
        }

        let mut value = 0u64;
        let mut needed = width;
        while needed > 0 {
            let byte = self.buffer[self.bit_position / 8];
            let available = 8 - (self.bit_position % 8) as u32;
            let take = available.min(needed);
            let mask = ((1u16 << take) - 1) as u8;
            let chunk = (byte >> (available - take)) & mask;
            value = (value << take) | chunk as u64;
            self.bit_position += take as usize;
            needed -= take;
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
