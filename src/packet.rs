//! The binary wire codec.
//!
//! A [`Packet`] is an append-only byte buffer with a read cursor. All
//! primitives are fixed-width little-endian; byte arrays carry an `i32`
//! length prefix where `-1` encodes null; strings are UTF-8 byte arrays.
//! Every read validates the remaining length first and fails with a
//! [`DecodeError`] instead of panicking, so a malformed datagram unwinds at
//! most one packet.
//!
//! The `f32`/`f64` accessors exist for display-side payloads (HUD layouts,
//! debug channels). They are forbidden in any simulation-touching path;
//! simulation values travel as [`Fixed`] raw bits via
//! [`Packet::write_fixed`]/[`Packet::read_fixed`].

use crate::error::DecodeError;
use crate::fixed::Fixed;
use crate::geometry::Vec2;
use crate::{Frame, PlayerId};

/// An append-only byte buffer with a read cursor.
///
/// Equality compares raw content only; the read cursor does not participate.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    data: Vec<u8>,
    cursor: usize,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Packet {}

impl Packet {
    /// Creates an empty packet.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Packet {
            data: Vec::new(),
            cursor: 0,
        }
    }

    /// Creates an empty packet with pre-allocated capacity.
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Packet {
            data: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    /// Wraps existing bytes; the read cursor starts at the beginning.
    #[inline]
    #[must_use]
    pub const fn from_bytes(data: Vec<u8>) -> Self {
        Packet { data, cursor: 0 }
    }

    /// The full written content, independent of the read cursor.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the packet, returning the written content.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Total written length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the read cursor and the end of the buffer.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Whether at least `count` bytes remain to be read.
    #[inline]
    #[must_use]
    pub fn has_remaining(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Rewinds the read cursor to the start of the buffer.
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Clears both content and cursor, keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }

    fn take(&mut self, count: usize) -> Result<&[u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::Truncated {
                needed: count,
                available: self.remaining(),
            });
        }
        let start = self.cursor;
        self.cursor += count;
        Ok(&self.data[start..start + count])
    }

    fn peek_slice(&self, count: usize) -> Result<&[u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::Truncated {
                needed: count,
                available: self.remaining(),
            });
        }
        Ok(&self.data[self.cursor..self.cursor + count])
    }
}

macro_rules! primitive_codec {
    ($write:ident, $read:ident, $peek:ident, $has:ident, $ty:ty, $size:expr) => {
        impl Packet {
            /// Appends the value in little-endian encoding.
            #[inline]
            pub fn $write(&mut self, value: $ty) {
                self.data.extend_from_slice(&value.to_le_bytes());
            }

            /// Reads the next value, advancing the cursor.
            #[inline]
            pub fn $read(&mut self) -> Result<$ty, DecodeError> {
                let bytes = self.take($size)?;
                let mut buf = [0u8; $size];
                buf.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(buf))
            }

            /// Reads the next value without advancing the cursor.
            #[inline]
            pub fn $peek(&self) -> Result<$ty, DecodeError> {
                let bytes = self.peek_slice($size)?;
                let mut buf = [0u8; $size];
                buf.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(buf))
            }

            /// Whether a full value of this width remains.
            #[inline]
            #[must_use]
            pub fn $has(&self) -> bool {
                self.has_remaining($size)
            }
        }
    };
}

primitive_codec!(write_u8, read_u8, peek_u8, has_u8, u8, 1);
primitive_codec!(write_i8, read_i8, peek_i8, has_i8, i8, 1);
primitive_codec!(write_u16, read_u16, peek_u16, has_u16, u16, 2);
primitive_codec!(write_i16, read_i16, peek_i16, has_i16, i16, 2);
primitive_codec!(write_u32, read_u32, peek_u32, has_u32, u32, 4);
primitive_codec!(write_i32, read_i32, peek_i32, has_i32, i32, 4);
primitive_codec!(write_u64, read_u64, peek_u64, has_u64, u64, 8);
primitive_codec!(write_i64, read_i64, peek_i64, has_i64, i64, 8);
primitive_codec!(write_f32, read_f32, peek_f32, has_f32, f32, 4);
primitive_codec!(write_f64, read_f64, peek_f64, has_f64, f64, 8);

impl Packet {
    /// Appends a boolean as a single byte (`0` or `1`).
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Reads a boolean; any non-zero byte is `true`.
    #[inline]
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a boolean without advancing the cursor.
    #[inline]
    pub fn peek_bool(&self) -> Result<bool, DecodeError> {
        Ok(self.peek_u8()? != 0)
    }

    /// Appends a length-prefixed byte array; `None` is encoded as length `-1`.
    pub fn write_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            None => self.write_i32(-1),
            Some(bytes) => {
                self.write_i32(bytes.len() as i32);
                self.data.extend_from_slice(bytes);
            },
        }
    }

    /// Reads a length-prefixed byte array; a `-1` prefix decodes to `None`
    /// without allocating.
    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let length = self.read_i32()?;
        if length == -1 {
            return Ok(None);
        }
        if length < 0 {
            return Err(DecodeError::BadLength { length });
        }
        Ok(Some(self.take(length as usize)?.to_vec()))
    }

    /// Whether a complete byte array (prefix and payload) remains.
    #[must_use]
    pub fn has_bytes(&self) -> bool {
        match self.peek_i32() {
            Ok(-1) => true,
            Ok(length) if length >= 0 => self.has_remaining(4 + length as usize),
            _ => false,
        }
    }

    /// Appends a string as a UTF-8 byte array.
    #[inline]
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(Some(value.as_bytes()));
    }

    /// Reads a UTF-8 string. A null byte array is not a valid string.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        match self.read_bytes()? {
            None => Err(DecodeError::BadLength { length: -1 }),
            Some(bytes) => String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8),
        }
    }

    /// Consumes and returns everything between the cursor and the end of the
    /// buffer. Used for trailing payloads that occupy the rest of a message.
    #[must_use]
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.data[self.cursor..].to_vec();
        self.cursor = self.data.len();
        rest
    }

    /// Appends raw bytes without a length prefix.
    #[inline]
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends a [`Fixed`] as its raw 64-bit representation.
    #[inline]
    pub fn write_fixed(&mut self, value: Fixed) {
        self.write_i64(value.raw());
    }

    /// Reads a [`Fixed`] from its raw representation.
    #[inline]
    pub fn read_fixed(&mut self) -> Result<Fixed, DecodeError> {
        Ok(Fixed::from_raw(self.read_i64()?))
    }

    /// Appends a [`Vec2`] component-wise.
    #[inline]
    pub fn write_vec2(&mut self, value: Vec2) {
        self.write_fixed(value.x);
        self.write_fixed(value.y);
    }

    /// Reads a [`Vec2`] component-wise.
    #[inline]
    pub fn read_vec2(&mut self) -> Result<Vec2, DecodeError> {
        let x = self.read_fixed()?;
        let y = self.read_fixed()?;
        Ok(Vec2::new(x, y))
    }

    /// Appends a [`Frame`].
    #[inline]
    pub fn write_frame(&mut self, value: Frame) {
        self.write_i64(value.as_i64());
    }

    /// Reads a [`Frame`].
    #[inline]
    pub fn read_frame(&mut self) -> Result<Frame, DecodeError> {
        Ok(Frame::new(self.read_i64()?))
    }

    /// Appends a [`PlayerId`].
    #[inline]
    pub fn write_player_id(&mut self, value: PlayerId) {
        self.write_i32(value.as_i32());
    }

    /// Reads a [`PlayerId`].
    #[inline]
    pub fn read_player_id(&mut self) -> Result<PlayerId, DecodeError> {
        Ok(PlayerId::new(self.read_i32()?))
    }
}

// #########
// # TESTS #
// #########


// =============================================================================
// Property-Based Tests
// =============================================================================
