//! Binary codec.
//!
//! `ByteStream` is a growable byte buffer with a cursor. Writes insert at the
//! cursor (shifting whatever follows) and advance it; reads consume bytes at
//! the cursor. All multi-byte values are little-endian.
//!
//! Strings are a `u16` length followed by one `u16` UTF-16 code unit per
//! character.

use bytes::Bytes;

use crate::error::CodecError;

/// Longest string the codec will write, in UTF-16 code units.
pub const MAX_STRING_LEN: usize = 32767;

/// Seekable byte buffer used for one encode or decode pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteStream {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Wraps received bytes for decoding; the cursor starts at 0.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: data.to_vec(),
            pos: 0,
        }
    }

    /// Total number of bytes held.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when at least one byte can be read.
    pub fn is_available(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Moves the cursor, clamped to the buffer size.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Moves the cursor past the last byte so further writes append.
    pub fn seek_end(&mut self) {
        self.pos = self.buf.len();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.pos == self.buf.len() {
            self.buf.extend_from_slice(bytes);
        } else {
            self.buf.splice(self.pos..self.pos, bytes.iter().copied());
        }
        self.pos += bytes.len();
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    /// Writes a length-prefixed string.
    pub fn write_string(&mut self, s: &str) -> Result<(), CodecError> {
        let units: Vec<u16> = s.encode_utf16().collect();
        if units.len() > MAX_STRING_LEN {
            return Err(CodecError::ValueTooLarge {
                len: units.len(),
                max: MAX_STRING_LEN,
            });
        }
        let mut raw = Vec::with_capacity(2 + units.len() * 2);
        raw.extend_from_slice(&(units.len() as u16).to_le_bytes());
        for unit in units {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        self.write_bytes(&raw);
        Ok(())
    }

    /// Consumes `len` bytes at the cursor.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::EndOfStream {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..self.pos])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Any non-zero byte reads as `true`.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a length-prefixed string, rejecting declared lengths above `max_len`.
    pub fn read_string(&mut self, max_len: usize) -> Result<String, CodecError> {
        let len = usize::from(self.read_u16()?);
        if len > max_len {
            return Err(CodecError::LengthExceeded { len, max: max_len });
        }
        let raw = self.read_bytes(len * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| CodecError::InvalidString)
    }
}

impl From<Bytes> for ByteStream {
    fn from(b: Bytes) -> Self {
        Self::from_slice(&b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian() {
        let mut s = ByteStream::new();
        s.write_u16(0x0102);
        s.write_i32(-2);
        assert_eq!(s.as_slice(), &[0x02, 0x01, 0xfe, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn mixed_values_read_back_in_order() {
        let mut s = ByteStream::new();
        s.write_u8(7);
        s.write_i16(-300);
        s.write_u32(4_000_000_000);
        s.write_f32(1.5);
        s.write_f64(-0.25);
        s.write_bool(true);
        s.write_string("héllo").unwrap();

        s.reset();
        assert_eq!(s.read_u8().unwrap(), 7);
        assert_eq!(s.read_i16().unwrap(), -300);
        assert_eq!(s.read_u32().unwrap(), 4_000_000_000);
        assert_eq!(s.read_f32().unwrap(), 1.5);
        assert_eq!(s.read_f64().unwrap(), -0.25);
        assert!(s.read_bool().unwrap());
        assert_eq!(s.read_string(MAX_STRING_LEN).unwrap(), "héllo");
        assert!(!s.is_available());
    }

    #[test]
    fn write_inserts_at_cursor() {
        let mut s = ByteStream::new();
        s.write_u8(1);
        s.write_u8(4);
        s.seek(1);
        s.write_bytes(&[2, 3]);
        assert_eq!(s.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(s.position(), 3);
    }

    #[test]
    fn read_past_end_fails() {
        let mut s = ByteStream::from_slice(&[1, 2, 3]);
        assert_eq!(
            s.read_u32(),
            Err(CodecError::EndOfStream {
                needed: 4,
                remaining: 3
            })
        );
        // A failed read does not consume.
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn string_length_limits() {
        let long = "x".repeat(MAX_STRING_LEN + 1);
        let mut s = ByteStream::new();
        assert!(matches!(
            s.write_string(&long),
            Err(CodecError::ValueTooLarge { .. })
        ));
        assert!(s.is_empty());

        s.write_string("abcdef").unwrap();
        s.reset();
        assert_eq!(
            s.read_string(4),
            Err(CodecError::LengthExceeded { len: 6, max: 4 })
        );
    }

    #[test]
    fn string_uses_one_unit_per_char() {
        let mut s = ByteStream::new();
        s.write_string("ab").unwrap();
        assert_eq!(s.as_slice(), &[2, 0, b'a', 0, b'b', 0]);
    }

    #[test]
    fn truncated_string_is_end_of_stream() {
        let mut s = ByteStream::from_slice(&[3, 0, b'a', 0]);
        assert!(matches!(
            s.read_string(MAX_STRING_LEN),
            Err(CodecError::EndOfStream { .. })
        ));
    }

    #[test]
    fn export_to_bytes() {
        let mut s = ByteStream::with_capacity(4);
        s.write_u32(9);
        assert_eq!(s.size(), 4);
        let b = s.into_bytes();
        assert_eq!(&b[..], &[9, 0, 0, 0]);
    }
}
