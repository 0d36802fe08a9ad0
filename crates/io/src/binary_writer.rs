//! Binary writer mirroring [`crate::binary_reader::BinaryReader`]: the same
//! `netobj` shape, the same explicit [`Endian`] parameter, used to build
//! upcall messages, downcall replies (in tests), and the RPCSEC_GSS
//! credential/verifier blocks.

use crate::binary_reader::Endian;
use bytes::{BufMut, BytesMut};

/// A growable output buffer.
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl Default for BinaryWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_u32(&mut self, value: u32, endian: Endian) {
        let bytes = match endian {
            Endian::Host => value.to_ne_bytes(),
            Endian::Network => value.to_be_bytes(),
        };
        self.buffer.put_slice(&bytes);
    }

    pub fn write_i32(&mut self, value: i32, endian: Endian) {
        let bytes = match endian {
            Endian::Host => value.to_ne_bytes(),
            Endian::Network => value.to_be_bytes(),
        };
        self.buffer.put_slice(&bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    /// Writes a `netobj`: a `u32` length prefix in `endian` order followed by
    /// `bytes`.
    pub fn write_netobj(&mut self, bytes: &[u8], endian: Endian) {
        self.write_u32(bytes.len() as u32, endian);
        self.write_bytes(bytes);
    }

    /// Writes an ASCII line followed by `\n`, as used by the v1 upcall
    /// encoding.
    pub fn write_line(&mut self, line: &str) {
        self.write_bytes(line.as_bytes());
        self.write_u8(b'\n');
    }

    /// Reserves space at the current position, returning the offset so the
    /// caller can come back and overwrite it once the real value is known
    /// (used for the integrity/privacy wrap length placeholders in
    /// `wrap_req`).
    pub fn reserve_u32_placeholder(&mut self) -> usize {
        let offset = self.buffer.len();
        self.write_u32(0, Endian::Network);
        offset
    }

    /// Back-fills a `u32` placeholder reserved earlier with its real value.
    pub fn backfill_u32(&mut self, offset: usize, value: u32, endian: Endian) {
        let bytes = match endian {
            Endian::Host => value.to_ne_bytes(),
            Endian::Network => value.to_be_bytes(),
        };
        self.buffer[offset..offset + 4].copy_from_slice(&bytes);
    }

    /// Pads the buffer with zero bytes up to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let rem = self.buffer.len() % align;
        if rem != 0 {
            for _ in 0..(align - rem) {
                self.write_u8(0);
            }
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}
