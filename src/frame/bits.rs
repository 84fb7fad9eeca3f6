//! Bit-level reader/writer for packed header fields
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

// Header fields are packed MSB first, fields never wider than 16 bits.

/// Writes explicitly-widthed fields into a byte buffer, MSB first
pub struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Write the lowest `width` bits of `value`
    pub fn write(&mut self, value: u16, width: usize) {
        debug_assert!(width <= 16);

        for i in (0..width).rev() {
            let bit = (value >> i) & 0b1;

            let byte = self.pos / 8;
            let shift = 7 - (self.pos % 8);

            self.buf[byte] &= !(1 << shift);
            self.buf[byte] |= (bit as u8) << shift;

            self.pos += 1;
        }
    }

    /// Number of whole bytes consumed so far
    pub fn byte_len(&self) -> usize {
        (self.pos + 7) / 8
    }
}

/// Reads explicitly-widthed fields from a byte buffer, MSB first
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read a `width`-bit field
    pub fn read(&mut self, width: usize) -> u16 {
        debug_assert!(width <= 16);

        let mut v = 0u16;
        for _ in 0..width {
            let byte = self.pos / 8;
            let shift = 7 - (self.pos % 8);

            v = (v << 1) | ((self.buf[byte] >> shift) & 0b1) as u16;

            self.pos += 1;
        }
        v
    }

    /// Read a single-bit flag
    pub fn flag(&mut self) -> bool {
        self.read(1) != 0
    }
}
