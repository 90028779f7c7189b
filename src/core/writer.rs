//! # Writer
//!
//! Growable, reusable encode buffer. Every outbound frame is built in a `Writer`
//! owned by the sending side; `set_position(0)` rewinds it for the next frame
//! without releasing the backing allocation.
//!
//! ## Usage
//! ```rust
//! use tickwire::core::{Reader, Writer};
//!
//! let mut writer = Writer::new();
//! writer.put_str("hello");
//! writer.put_i32(-7);
//!
//! let mut reader = Reader::new(writer.data());
//! assert_eq!(reader.get_string().unwrap().as_deref(), Some("hello"));
//! assert_eq!(reader.get_i32().unwrap(), -7);
//! assert_eq!(reader.available(), 0);
//! ```

use bytes::Bytes;

use super::primitive::Primitive;
use super::serialization::NetSerialize;
use super::STRING_MAX_BYTES;
use crate::error::{ProtocolError, Result};

/// Default backing buffer size
const DEFAULT_CAPACITY: usize = 1024;

/// Code unit written for chars outside the basic multilingual plane
const REPLACEMENT_CHAR: u16 = 0xFFFD;

/// Encode buffer with an explicit write position
#[derive(Debug, Clone)]
pub struct Writer {
    data: Vec<u8>,
    position: usize,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
        }
    }

    /// Bytes written so far
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.position]
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Size of the backing buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Move the write position; `set_position(0)` resets the writer for reuse
    #[inline]
    pub fn set_position(&mut self, position: usize) {
        self.ensure_capacity(position);
        self.position = position;
    }

    /// Grow the backing buffer to at least `required` bytes, doubling when possible
    #[inline]
    fn ensure_capacity(&mut self, required: usize) {
        if self.data.len() < required {
            let capacity = required.max(self.data.len() * 2);
            self.data.resize(capacity, 0);
        }
    }

    /// Copy of the written bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Copy of the written bytes as a shareable buffer
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }

    #[inline]
    pub fn put_primitive<T: Primitive>(&mut self, value: T) {
        let end = self.position + T::SIZE;
        self.ensure_capacity(end);
        value.write_le(&mut self.data[self.position..end]);
        self.position = end;
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_primitive(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.put_primitive(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_primitive(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.put_primitive(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_primitive(value);
    }

    /// Chars travel as a single u16 code unit; chars outside the BMP become U+FFFD
    pub fn put_char(&mut self, value: char) {
        let code = u16::try_from(u32::from(value)).unwrap_or(REPLACEMENT_CHAR);
        self.put_u16(code);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_primitive(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_primitive(value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_primitive(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.put_primitive(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_primitive(value);
    }

    pub fn put_f64(&mut self, value: f64) {
        self.put_primitive(value);
    }

    /// Write a non-null string without a length limit
    pub fn put_str(&mut self, value: &str) {
        self.put_string_max(Some(value), 0);
    }

    /// Write a nullable string without a length limit
    pub fn put_string(&mut self, value: Option<&str>) {
        self.put_string_max(value, 0);
    }

    /// Write a nullable string, keeping at most `max_length` chars (0 = unlimited).
    ///
    /// `max_length` limits the number of chars, not the size in bytes. Strings whose
    /// UTF-8 form reaches [`STRING_MAX_BYTES`] are written as null.
    pub fn put_string_max(&mut self, value: Option<&str>, max_length: usize) {
        let Some(value) = value else {
            self.put_u16(0);
            return;
        };

        let value = truncate_chars(value, max_length);
        let bytes = value.as_bytes();

        if bytes.len() >= STRING_MAX_BYTES {
            self.put_u16(0);
            return;
        }

        // +1 leaves 0 free for null
        self.put_u16((bytes.len() + 1) as u16);
        self.put_raw(bytes);
    }

    /// Copy bytes without any framing
    pub fn put_raw(&mut self, data: &[u8]) {
        let end = self.position + data.len();
        self.ensure_capacity(end);
        self.data[self.position..end].copy_from_slice(data);
        self.position = end;
    }

    /// Write a nullable array of fixed-size elements.
    ///
    /// # Errors
    /// Returns `ProtocolError::ArrayTooLong` if the count does not fit the u16 prefix
    pub fn put_array<T: Primitive>(&mut self, values: Option<&[T]>) -> Result<()> {
        let Some(values) = values else {
            self.put_u16(0);
            return Ok(());
        };

        self.put_u16(array_prefix(values.len())?);

        let end = self.position + values.len() * T::SIZE;
        self.ensure_capacity(end);
        for (value, out) in values
            .iter()
            .zip(self.data[self.position..end].chunks_exact_mut(T::SIZE))
        {
            value.write_le(out);
        }
        self.position = end;
        Ok(())
    }

    /// Write a nullable array of chars, each as a u16 code unit like [`put_char`](Self::put_char).
    ///
    /// # Errors
    /// Returns `ProtocolError::ArrayTooLong` if the count does not fit the u16 prefix
    pub fn put_char_array(&mut self, values: Option<&[char]>) -> Result<()> {
        let Some(values) = values else {
            self.put_u16(0);
            return Ok(());
        };

        self.put_u16(array_prefix(values.len())?);
        for &value in values {
            self.put_char(value);
        }
        Ok(())
    }

    /// Write a nullable array of nullable strings.
    ///
    /// # Errors
    /// Returns `ProtocolError::ArrayTooLong` if the count does not fit the u16 prefix
    pub fn put_string_array<S: AsRef<str>>(&mut self, values: Option<&[Option<S>]>) -> Result<()> {
        let Some(values) = values else {
            self.put_u16(0);
            return Ok(());
        };

        self.put_u16(array_prefix(values.len())?);
        for value in values {
            self.put_string(value.as_ref().map(AsRef::as_ref));
        }
        Ok(())
    }

    /// Write a value through its `NetSerialize` implementation
    pub fn put<T: NetSerialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(self)
    }
}

/// `count + 1`, leaving 0 for null and 1 for empty
fn array_prefix(count: usize) -> Result<u16> {
    u16::try_from(count)
        .ok()
        .and_then(|count| count.checked_add(1))
        .ok_or(ProtocolError::ArrayTooLong(count))
}

fn truncate_chars(value: &str, max_length: usize) -> &str {
    if max_length == 0 {
        return value;
    }
    match value.char_indices().nth(max_length) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_doubles_on_overflow() {
        let mut writer = Writer::with_capacity(4);
        writer.put_u32(1);
        assert_eq!(writer.capacity(), 4);

        writer.put_u8(2);
        assert_eq!(writer.capacity(), 8);

        writer.put_raw(&[0u8; 32]);
        assert_eq!(writer.capacity(), 37);
    }

    #[test]
    fn test_set_position_reuses_buffer() {
        let mut writer = Writer::new();
        writer.put_raw(&[0xAA; 2000]);
        let capacity = writer.capacity();

        writer.set_position(0);
        assert!(writer.data().is_empty());
        assert_eq!(writer.capacity(), capacity);

        writer.put_u16(7);
        assert_eq!(writer.data(), &[7, 0]);
    }

    #[test]
    fn test_string_prefix_is_length_plus_one() {
        let mut writer = Writer::new();
        writer.put_str("ab");
        assert_eq!(writer.data(), &[3, 0, b'a', b'b']);

        writer.set_position(0);
        writer.put_str("");
        assert_eq!(writer.data(), &[1, 0]);

        writer.set_position(0);
        writer.put_string(None);
        assert_eq!(writer.data(), &[0, 0]);
    }

    #[test]
    fn test_string_truncation_counts_chars() {
        let mut writer = Writer::new();
        writer.put_string_max(Some("привет"), 2);
        // two Cyrillic chars, two bytes each
        assert_eq!(writer.data(), &[5, 0, 0xD0, 0xBF, 0xD1, 0x80]);
    }

    #[test]
    fn test_oversized_string_written_as_null() {
        let mut writer = Writer::new();
        let big = "x".repeat(STRING_MAX_BYTES);
        writer.put_str(&big);
        assert_eq!(writer.data(), &[0, 0]);

        writer.set_position(0);
        let fits = "x".repeat(STRING_MAX_BYTES - 1);
        writer.put_str(&fits);
        assert_eq!(writer.position(), 2 + STRING_MAX_BYTES - 1);
    }

    #[test]
    fn test_array_prefixes() {
        let mut writer = Writer::new();
        writer.put_array::<u16>(None).unwrap();
        writer.put_array::<u16>(Some(&[])).unwrap();
        writer.put_array(Some(&[0x0102u16])).unwrap();
        assert_eq!(writer.data(), &[0, 0, 1, 0, 2, 0, 0x02, 0x01]);
    }

    #[test]
    fn test_array_too_long() {
        let mut writer = Writer::new();
        let values = vec![0u8; u16::MAX as usize];
        assert!(matches!(
            writer.put_array(Some(&values)),
            Err(ProtocolError::ArrayTooLong(65535))
        ));
    }

    #[test]
    fn test_char_outside_bmp_replaced() {
        let mut writer = Writer::new();
        writer.put_char('😀');
        assert_eq!(writer.data(), &[0xFD, 0xFF]);
    }
}
