//! Binary reader for the fixed wire layouts this workspace speaks: the
//! upcall/downcall pipe protocol (host byte order, because the pipe is a
//! local IPC channel) and the RPCSEC_GSS credential/verifier on the RPC
//! wire (network byte order). Both share the same `netobj` shape
//! (`u32` length prefix + bytes), so [`Endian`] is a parameter rather than
//! two copies of the reader.

use crate::error::{IoError, Result};
use bytes::Bytes;

/// Byte order a field is encoded in.
///
/// The pipe carrying upcall/downcall messages to the daemon is local IPC and
/// uses the host's native order; the RPCSEC_GSS credential and verifier that
/// travel over the actual RPC wire use network byte order. Mixing the two up
/// is a real bug class in this protocol, so callers name the one they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Host,
    Network,
}

/// A cursor over an immutable byte buffer.
pub struct BinaryReader {
    data: Bytes,
    position: usize,
}

impl BinaryReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.is_eof() {
            return Err(IoError::end_of_stream(1, "u8"));
        }
        let byte = self.data[self.position];
        self.position += 1;
        Ok(byte)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_array4(&mut self, context: &'static str) -> Result<[u8; 4]> {
        if self.remaining() < 4 {
            return Err(IoError::end_of_stream(4 - self.remaining(), context));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.position..self.position + 4]);
        self.position += 4;
        Ok(buf)
    }

    /// Reads a 32-bit unsigned integer in the given byte order.
    pub fn read_u32(&mut self, endian: Endian) -> Result<u32> {
        let buf = self.read_array4("u32")?;
        Ok(match endian {
            Endian::Host => u32::from_ne_bytes(buf),
            Endian::Network => u32::from_be_bytes(buf),
        })
    }

    /// Reads a 32-bit signed integer (used for errno fields) in the given
    /// byte order.
    pub fn read_i32(&mut self, endian: Endian) -> Result<i32> {
        let buf = self.read_array4("i32")?;
        Ok(match endian {
            Endian::Host => i32::from_ne_bytes(buf),
            Endian::Network => i32::from_be_bytes(buf),
        })
    }

    /// Reads a fixed-length byte array.
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        if self.remaining() < length {
            return Err(IoError::end_of_stream(length - self.remaining(), "bytes"));
        }
        let bytes = self.data.slice(self.position..self.position + length);
        self.position += length;
        Ok(bytes.to_vec())
    }

    /// Reads a `netobj`: a `u32` length prefix (in `endian` byte order)
    /// followed by that many bytes. `max_len` bounds the claimed length
    /// against a protocol-defined ceiling (e.g. `downcall_max_bytes`) so a
    /// corrupt or hostile length prefix can't drive an unbounded allocation.
    pub fn read_netobj(
        &mut self,
        endian: Endian,
        max_len: usize,
        context: &'static str,
    ) -> Result<Vec<u8>> {
        let len = self.read_u32(endian)? as usize;
        if len > max_len {
            return Err(IoError::length_overrun(len, max_len, context));
        }
        self.read_bytes(len)
    }

    /// Reads an ASCII line up to (not including) the next `\n`, bounded by
    /// `max_len` bytes. Used for the v1 textual upcall encoding.
    pub fn read_line(&mut self, max_len: usize) -> Result<String> {
        let start = self.position;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| start + i);
        let end = match end {
            Some(e) => e,
            None => self.data.len(),
        };
        let len = end - start;
        if len > max_len {
            return Err(IoError::length_overrun(len, max_len, "upcall line"));
        }
        let bytes = self.read_bytes(len)?;
        if !self.is_eof() && self.data[self.position] == b'\n' {
            self.position += 1;
        }
        String::from_utf8(bytes).map_err(|e| IoError::InvalidUtf8 {
            context: "upcall line",
            reason: e.to_string(),
        })
    }

    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.data.len() {
            return Err(IoError::OutOfBounds {
                position,
                len: self.data.len(),
            });
        }
        self.position = position;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        if self.remaining() < count {
            return Err(IoError::end_of_stream(count - self.remaining(), "skip"));
        }
        self.position += count;
        Ok(())
    }

    /// The unread tail of the buffer, without consuming it.
    pub fn peek_remaining(&self) -> &[u8] {
        &self.data[self.position..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_host_and_network_u32_distinctly() {
        let mut r = BinaryReader::new(vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(r.read_u32(Endian::Network).unwrap(), 0x0100_0000);
        let mut r = BinaryReader::new(vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(r.read_u32(Endian::Host).unwrap(), 1);
    }

    #[test]
    fn netobj_rejects_oversized_length() {
        let mut r = BinaryReader::new(vec![0xff, 0xff, 0xff, 0x7f]);
        let err = r.read_netobj(Endian::Network, 1024, "wire_ctx").unwrap_err();
        assert!(matches!(err, IoError::LengthOverrun { .. }));
    }

    #[test]
    fn reads_line_up_to_newline() {
        let mut r = BinaryReader::new(b"mech=krb5 uid=1000\nleftover".to_vec());
        let line = r.read_line(128).unwrap();
        assert_eq!(line, "mech=krb5 uid=1000");
        assert_eq!(r.peek_remaining(), b"leftover");
    }
}
