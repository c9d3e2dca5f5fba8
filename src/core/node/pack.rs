//! Little-endian field packing shared by the encode and decode paths

use crate::error::{Result, StorageError};
use crate::key::{Key, KEY_SIZE};

/// Appends little-endian fields to a buffer
#[derive(Debug, Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn with_capacity(capacity: usize) -> Self {
        Packer {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn key(&mut self, key: &Key) -> &mut Self {
        self.buf.extend_from_slice(&key.to_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads little-endian fields, reporting truncation as corruption at the
/// node's position
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
    eu: u32,
    offs: u32,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8], eu: u32, offs: u32) -> Self {
        Unpacker {
            buf,
            pos: 0,
            eu,
            offs,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(StorageError::corrupt(
                self.eu,
                self.offs,
                format!(
                    "node body truncated: need {} bytes at {}, have {}",
                    len,
                    self.pos,
                    self.buf.len()
                ),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(raw))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    pub fn key(&mut self) -> Result<Key> {
        Key::from_bytes(self.take(KEY_SIZE as usize)?)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn corrupt(&self, reason: impl Into<String>) -> StorageError {
        StorageError::corrupt(self.eu, self.offs, reason)
    }
}

/// Packs several narrow fields into one word, lowest field first
#[derive(Debug, Default, Clone, Copy)]
pub struct BitPacker {
    word: u64,
    shift: u32,
}

impl BitPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` using `bits` bits. Values wider than `bits` are masked.
    pub fn push(mut self, value: u64, bits: u32) -> Self {
        debug_assert!(self.shift + bits <= 64);
        debug_assert!(bits == 64 || value < (1u64 << bits));
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.word |= (value & mask) << self.shift;
        self.shift += bits;
        self
    }

    pub fn finish(self) -> u64 {
        self.word
    }
}

/// Reverses [`BitPacker`]; fields must be taken in the order they were pushed
#[derive(Debug, Clone, Copy)]
pub struct BitUnpacker {
    word: u64,
    shift: u32,
}

impl BitUnpacker {
    pub fn new(word: u64) -> Self {
        BitUnpacker { word, shift: 0 }
    }

    pub fn take(&mut self, bits: u32) -> u64 {
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let value = (self.word >> self.shift) & mask;
        self.shift += bits;
        value
    }
}
