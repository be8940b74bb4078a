//! Fixed-width little-endian field access shared by every on-disk record.
//!
//! Records are decoded field by field from a [Decoder] and encoded into an
//! [Encoder], which checks the encoded length against the record's fixed
//! size before the bytes are handed back to the caller.

use bytes::{Buf, BufMut};

#[derive(Debug, thiserror::Error)]
/// An error that prevented a fixed-width record from being decoded.
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    /// The buffer was exhausted before every field was read.
    EndOfBuffer,
    #[error("{0} trailing bytes after record")]
    /// Bytes remain in the buffer after the record was decoded.
    TrailingBytes(usize),
    #[error("non-zero padding in {0}")]
    /// A padding field contained non-zero bytes.
    NonZeroPadding(&'static str),
    #[error("bad magic in {0}")]
    /// The record does not start with its expected magic value.
    BadMagic(&'static str),
    #[error("invalid value for {field}: {value}")]
    /// A field holds a value outside its valid range.
    InvalidValue {
        /// The name of the field.
        field: &'static str,
        /// The value which was read.
        value: u64,
    },
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented a fixed-width record from being encoded.
pub enum EncodeError {
    #[error("encoded {actual} bytes but record is {expected} bytes")]
    /// The encoded output does not match the record's fixed size.
    SizeMismatch {
        /// The fixed size of the record.
        expected: usize,
        /// The number of bytes produced.
        actual: usize,
    },
}

/// A cursor reading fixed-width little-endian fields from a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a new decoder over the given buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    /// Returns the number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    fn ensure(&self, len: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < len {
            Err(DecodeError::EndOfBuffer)
        } else {
            Ok(())
        }
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        self.ensure(size_of::<u16>())?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(size_of::<u32>())?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(size_of::<u64>())?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a fixed-size array of raw bytes.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.ensure(N)?;
        let mut out = [0; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Takes the next `len` bytes without interpreting them.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Skips `len` bytes of padding which must all be zero.
    pub fn padding(&mut self, len: usize, field: &'static str) -> Result<(), DecodeError> {
        let padding = self.take(len)?;
        if padding.iter().any(|b| *b != 0) {
            return Err(DecodeError::NonZeroPadding(field));
        }
        Ok(())
    }

    /// Completes decoding, failing if any bytes remain.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

/// Appends fixed-width little-endian fields to an output buffer.
///
/// Nothing is left behind in the buffer if [Encoder::finish] rejects
/// the record.
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> Encoder<'a> {
    /// Creates a new encoder appending to `buf`.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        Self { buf, start }
    }

    pub fn u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Writes `len` zeroed padding bytes.
    pub fn padding(&mut self, len: usize) {
        self.buf.put_bytes(0, len);
    }

    /// Completes the record, checking it is exactly `expected` bytes.
    pub fn finish(self, expected: usize) -> Result<(), EncodeError> {
        let actual = self.buf.len() - self.start;
        if actual != expected {
            self.buf.truncate(self.start);
            return Err(EncodeError::SizeMismatch { expected, actual });
        }
        Ok(())
    }
}
