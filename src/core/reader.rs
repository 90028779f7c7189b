//! # Reader
//!
//! Zero-copy decode cursor over a received frame. Every getter checks the number
//! of available bytes first; reading past the end yields
//! [`ProtocolError::UnexpectedEof`] and the message is treated as malformed.

use super::primitive::Primitive;
use super::serialization::NetDeserialize;
use super::STRING_MAX_BYTES;
use crate::error::{ProtocolError, Result};

/// Decode cursor borrowing the frame it reads from
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Point the reader at a new frame; also resets the position to 0
    pub fn set(&mut self, data: &'a [u8]) {
        self.data = data;
        self.position = 0;
    }

    /// The whole frame, including bytes already consumed
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read
    #[inline]
    pub fn available(&self) -> usize {
        self.data.len() - self.position
    }

    /// Take exactly `count` raw bytes
    #[inline]
    pub fn get_data_segment(&mut self, count: usize) -> Result<&'a [u8]> {
        let available = self.available();
        if available < count {
            return Err(ProtocolError::UnexpectedEof {
                needed: count,
                available,
            });
        }
        let segment = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(segment)
    }

    /// Consume everything up to the end of the frame
    pub fn get_remaining(&mut self) -> &'a [u8] {
        let segment = &self.data[self.position..];
        self.position = self.data.len();
        segment
    }

    #[inline]
    pub fn get_primitive<T: Primitive>(&mut self) -> Result<T> {
        self.get_data_segment(T::SIZE).map(T::read_le)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.get_primitive()
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        self.get_primitive()
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        self.get_primitive()
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        self.get_primitive()
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.get_primitive()
    }

    /// # Errors
    /// Returns `ProtocolError::InvalidChar` for lone surrogate code units
    pub fn get_char(&mut self) -> Result<char> {
        let code = self.get_u16()?;
        char::from_u32(u32::from(code)).ok_or(ProtocolError::InvalidChar(code))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.get_primitive()
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.get_primitive()
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        self.get_primitive()
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.get_primitive()
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.get_primitive()
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.get_primitive()
    }

    /// Read a nullable string without a length limit
    pub fn get_string(&mut self) -> Result<Option<String>> {
        self.get_string_max(0)
    }

    /// Read a nullable string.
    ///
    /// Returns `None` for the null marker and for payloads of [`STRING_MAX_BYTES`]
    /// or more (the bytes are still consumed). When `max_length > 0` and the
    /// decoded string has more chars than that, an empty string is returned.
    pub fn get_string_max(&mut self, max_length: usize) -> Result<Option<String>> {
        let size = self.get_u16()?;
        if size == 0 {
            return Ok(None);
        }

        let size = usize::from(size - 1);
        let bytes = self.get_data_segment(size)?;
        if size >= STRING_MAX_BYTES {
            return Ok(None);
        }

        let value = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        if max_length > 0 && value.chars().count() > max_length {
            return Ok(Some(String::new()));
        }
        Ok(Some(value.to_owned()))
    }

    /// Read a nullable array of fixed-size elements
    pub fn get_array<T: Primitive>(&mut self) -> Result<Option<Vec<T>>> {
        let Some(count) = self.get_array_count()? else {
            return Ok(None);
        };

        let bytes = self.get_data_segment(count * T::SIZE)?;
        Ok(Some(bytes.chunks_exact(T::SIZE).map(T::read_le).collect()))
    }

    /// Read a nullable array of chars
    pub fn get_char_array(&mut self) -> Result<Option<Vec<char>>> {
        let Some(count) = self.get_array_count()? else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.get_char()?);
        }
        Ok(Some(values))
    }

    /// Read a nullable array of nullable strings
    pub fn get_string_array(&mut self) -> Result<Option<Vec<Option<String>>>> {
        let Some(count) = self.get_array_count()? else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.get_string()?);
        }
        Ok(Some(values))
    }

    /// Read a value through its `NetDeserialize` implementation
    pub fn get<T: NetDeserialize>(&mut self) -> Result<T> {
        T::deserialize(self)
    }

    fn get_array_count(&mut self) -> Result<Option<usize>> {
        match self.get_u16()? {
            0 => Ok(None),
            prefix => Ok(Some(usize::from(prefix - 1))),
        }
    }
}
