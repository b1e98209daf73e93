// Wire-format serialization primitives

use crate::core::Hash256;
use crate::error::DecodeError;

/// Scripts above this size are rejected by the codec and the interpreter.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Upper bound on the transaction count of a single block.
pub const MAX_BLOCK_TXS: u64 = 100_000;

/// Cursor over a byte slice. Every read checks bounds and fails with
/// [`DecodeError::Truncated`] instead of panicking.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consume exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_le(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(self.u64_le()? as i64)
    }

    pub fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn hash(&mut self) -> Result<Hash256, DecodeError> {
        Hash256::from_slice(self.take(32)?)
    }

    /// Variable-length integer. First byte b: if b < 0xfd the value is b;
    /// 0xfd/0xfe/0xff prefix a 2/4/8-byte little-endian integer.
    pub fn varint(&mut self) -> Result<u64, DecodeError> {
        let first = self.u8().map_err(|_| DecodeError::MalformedVarInt)?;
        match first {
            0x00..=0xfc => Ok(first as u64),
            0xfd => self.u16_le().map(u64::from).map_err(|_| DecodeError::MalformedVarInt),
            0xfe => self.u32_le().map(u64::from).map_err(|_| DecodeError::MalformedVarInt),
            0xff => self.u64_le().map_err(|_| DecodeError::MalformedVarInt),
        }
    }

    /// Varint length prefix followed by that many bytes.
    pub fn var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// var_bytes with an upper bound on the length.
    pub fn var_bytes_limited(&mut self, max: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.varint()? as usize;
        if len > max {
            return Err(DecodeError::ScriptTooLarge(len));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Varint length prefix followed by an ASCII string of that length.
    pub fn var_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::BadPayload("string"))
    }
}

/// Write a variable-length integer using the shortest form.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Write bytes prefixed with their varint length.
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Write an ASCII string prefixed with its varint length.
pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

/// Types with a canonical wire encoding.
pub trait Serializable: Sized {
    fn serialize_into(&self, buf: &mut Vec<u8>);

    fn deserialize(r: &mut Reader) -> Result<Self, DecodeError>;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Decode from a complete byte slice. Trailing bytes are an error.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let value = Self::deserialize(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::BadPayload("trailing bytes"));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_small() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100);
        assert_eq!(buf, vec![100]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.varint().unwrap(), 100);
    }

    #[test]
    fn test_varint_medium() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 1000);
        assert_eq!(buf.len(), 3); // 0xfd + 2 bytes

        let mut r = Reader::new(&buf);
        assert_eq!(r.varint().unwrap(), 1000);
    }

    #[test]
    fn test_varint_large() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100_000);
        assert_eq!(buf.len(), 5); // 0xfe + 4 bytes

        let mut r = Reader::new(&buf);
        assert_eq!(r.varint().unwrap(), 100_000);
    }

    #[test]
    fn test_varint_u64() {
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 9); // 0xff + 8 bytes

        let mut r = Reader::new(&buf);
        assert_eq!(r.varint().unwrap(), u64::MAX);
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0xfcu64, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut r = Reader::new(&buf);
            assert_eq!(r.varint().unwrap(), value);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn test_varint_truncated() {
        // 0xfd announces two more bytes but only one follows
        let mut r = Reader::new(&[0xfd, 0x01]);
        assert_eq!(r.varint(), Err(DecodeError::MalformedVarInt));
    }

    #[test]
    fn test_var_bytes_round_trip() {
        let data = b"hello world";
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, data);

        let mut r = Reader::new(&buf);
        assert_eq!(r.var_bytes().unwrap(), data);
    }

    #[test]
    fn test_var_bytes_truncated() {
        // Length says 5, only 2 bytes present
        let mut r = Reader::new(&[0x05, 0xaa, 0xbb]);
        assert_eq!(r.var_bytes(), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_reader_take_bounds() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.take(2).unwrap(), &[1, 2]);
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.take(2), Err(DecodeError::Truncated));
    }
}
