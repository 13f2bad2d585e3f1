//! Binary buffer helpers for the replication wire protocol
//!
//! Thin safe wrappers over the `bytes` crate for reading backend messages
//! and writing frontend frames in network byte order.

use crate::error::{CdcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Reader for parsing binary protocol messages
pub struct BufferReader {
    data: Bytes,
}

impl BufferReader {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        Self { data }
    }

    /// Bytes left in the buffer
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn ensure_bytes(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(CdcError::protocol(format!(
                "not enough bytes remaining: need {}, have {}",
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure_bytes(2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure_bytes(4)?;
        Ok(self.data.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_u64())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure_bytes(4)?;
        Ok(self.data.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_i64())
    }

    /// Read a null-terminated UTF-8 string
    pub fn read_cstring(&mut self) -> Result<String> {
        let chunk = self.data.chunk();
        let terminator = chunk
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CdcError::protocol("unterminated string in buffer"))?;

        let raw = self.data.copy_to_bytes(terminator);
        let value = String::from_utf8(raw.to_vec())
            .map_err(|e| CdcError::protocol(format!("invalid UTF-8 in string: {}", e)))?;
        self.data.advance(1);
        Ok(value)
    }

    /// Read `length` raw bytes
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        self.ensure_bytes(length)?;
        Ok(self.data.copy_to_bytes(length).to_vec())
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.chunk()[0])
    }
}

/// Writer for building frontend protocol frames
pub struct BufferWriter {
    data: BytesMut,
}

impl BufferWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.put_i32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.put_i64(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_integers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = BufferReader::new(&data);

        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_u32().unwrap(), 0x0405_0607);
        assert_eq!(reader.remaining(), 0);
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_reader_cstring() {
        let mut reader = BufferReader::new(b"public\x00users\x00");
        assert_eq!(reader.read_cstring().unwrap(), "public");
        assert_eq!(reader.read_cstring().unwrap(), "users");
    }

    #[test]
    fn test_reader_unterminated_cstring() {
        let mut reader = BufferReader::new(b"oops");
        assert!(reader.read_cstring().is_err());
    }

    #[test]
    fn test_reader_peek_does_not_consume() {
        let mut reader = BufferReader::new(&[0xAB, 0xCD]);
        assert_eq!(reader.peek_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
    }

    #[test]
    fn test_writer_round_trip() {
        let mut writer = BufferWriter::with_capacity(16);
        writer.write_u8(b'r');
        writer.write_u64(0x1122_3344_5566_7788);
        writer.write_i64(-1);
        writer.write_u8(0);

        let frozen = writer.freeze();
        let mut reader = BufferReader::from_bytes(frozen);
        assert_eq!(reader.read_u8().unwrap(), b'r');
        assert_eq!(reader.read_u64().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(reader.read_i64().unwrap(), -1);
        assert_eq!(reader.read_u8().unwrap(), 0);
    }
}
