//! Binary codec for ledger entities
//!
//! Every entity is laid out with:
//! - little-endian fixed-width scalars
//! - a u32 count before each sequence
//! - a u32 byte length before each byte string and each UTF-8 string
//!
//! Block and transaction ids are hashes of this exact layout, so the
//! encoders below must stay byte-for-byte stable.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Errors produced while decoding a buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("Unknown opcode: {0}")]
    UnknownOpCode(u8),
}

/// Scalars with a fixed little-endian width on the wire
pub trait FixedWidth: Sized {
    const SIZE: usize;

    fn put(self, buf: &mut BytesMut);

    /// Reads the value; the caller guarantees `SIZE` bytes are available
    fn get(src: &mut &[u8]) -> Self;
}

macro_rules! fixed_width {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl FixedWidth for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn put(self, buf: &mut BytesMut) {
                    buf.$put(self);
                }

                fn get(src: &mut &[u8]) -> Self {
                    src.$get()
                }
            }
        )*
    };
}

fixed_width! {
    u8 => put_u8, get_u8;
    u16 => put_u16_le, get_u16_le;
    u32 => put_u32_le, get_u32_le;
    u64 => put_u64_le, get_u64_le;
    i32 => put_i32_le, get_i32_le;
    i64 => put_i64_le, get_i64_le;
}

impl FixedWidth for bool {
    const SIZE: usize = 1;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(self as u8);
    }

    fn get(src: &mut &[u8]) -> Self {
        src.get_u8() != 0
    }
}

/// Growable byte buffer with an independent read cursor
#[derive(Debug, Clone, Default)]
pub struct BinaryBuffer {
    data: BytesMut,
    read_pos: usize,
}

impl BinaryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes for reading
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_pos: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the read cursor and the end of the buffer
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    // =========================================================================
    // Writing
    // =========================================================================

    pub fn write_fixed<T: FixedWidth>(&mut self, value: T) {
        value.put(&mut self.data);
    }

    /// Append bytes with no length prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_size(&mut self, size: usize) {
        debug_assert!(size <= u32::MAX as usize);
        self.write_fixed(size as u32);
    }

    /// Append a u32 length followed by the bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.write_raw(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Append a u32 element count followed by each element
    pub fn write_sized_sequence<T: Encodable>(&mut self, items: &[T]) {
        self.write_size(items.len());
        for item in items {
            item.encode(self);
        }
    }

    // =========================================================================
    // Reading
    // =========================================================================

    fn take(&mut self, needed: usize) -> Result<&[u8], CodecError> {
        let available = self.remaining();
        if available < needed {
            return Err(CodecError::Truncated { needed, available });
        }
        let start = self.read_pos;
        self.read_pos += needed;
        Ok(&self.data[start..start + needed])
    }

    pub fn read_fixed<T: FixedWidth>(&mut self) -> Result<T, CodecError> {
        let mut src = self.take(T::SIZE)?;
        Ok(T::get(&mut src))
    }

    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_size(&mut self) -> Result<usize, CodecError> {
        Ok(self.read_fixed::<u32>()? as usize)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_size()?;
        self.read_raw(len)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.read_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_sized_sequence<T: Decodable>(&mut self) -> Result<Vec<T>, CodecError> {
        let count = self.read_size()?;
        // A hostile count must not drive the allocation.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }
}

/// Types with a canonical binary encoding
pub trait Encodable {
    fn encode(&self, buf: &mut BinaryBuffer);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BinaryBuffer::new();
        self.encode(&mut buf);
        buf.into_vec()
    }

    fn serialized_size(&self) -> usize {
        let mut buf = BinaryBuffer::new();
        self.encode(&mut buf);
        buf.len()
    }
}

/// Types that can be read back from their canonical encoding
pub trait Decodable: Sized {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError>;

    fn decode_from(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = BinaryBuffer::from_bytes(bytes);
        Self::decode(&mut buf)
    }
}

impl Encodable for String {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_str(self);
    }
}

impl Decodable for String {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        buf.read_string()
    }
}
