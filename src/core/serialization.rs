//! # Message Serialization
//!
//! Typed message bodies are written with [`NetSerialize`] and read back with
//! [`NetDeserialize`]. Hand-written implementations give full control over the
//! wire layout; [`Bincoded`] carries any serde type for cases where layout does
//! not matter.
//!
//! ## Formats
//! - **Hand-written**: direct `Writer`/`Reader` calls, smallest and fastest
//! - **Bincode**: `u32` length prefix followed by bincode bytes
//! - **Empty**: `()` writes nothing and reads nothing
//!
//! ## Usage
//! ```rust
//! use tickwire::core::{NetDeserialize, NetSerialize, Reader, Writer};
//! use tickwire::error::Result;
//!
//! #[derive(Debug, PartialEq)]
//! struct Move {
//!     x: f32,
//!     y: f32,
//! }
//!
//! impl NetSerialize for Move {
//!     fn serialize(&self, writer: &mut Writer) -> Result<()> {
//!         writer.put_f32(self.x);
//!         writer.put_f32(self.y);
//!         Ok(())
//!     }
//! }
//!
//! impl NetDeserialize for Move {
//!     fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
//!         Ok(Move { x: reader.get_f32()?, y: reader.get_f32()? })
//!     }
//! }
//!
//! let mut writer = Writer::new();
//! writer.put(&Move { x: 1.0, y: 2.0 }).unwrap();
//! let mut reader = Reader::new(writer.data());
//! assert_eq!(reader.get::<Move>().unwrap(), Move { x: 1.0, y: 2.0 });
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::reader::Reader;
use super::writer::Writer;
use crate::error::{ProtocolError, Result};

/// A message body that can be written to a [`Writer`]
pub trait NetSerialize {
    fn serialize(&self, writer: &mut Writer) -> Result<()>;
}

/// A message body that can be read from a [`Reader`]
pub trait NetDeserialize: Sized {
    fn deserialize(reader: &mut Reader<'_>) -> Result<Self>;
}

/// The empty message
impl NetSerialize for () {
    fn serialize(&self, _writer: &mut Writer) -> Result<()> {
        Ok(())
    }
}

impl NetDeserialize for () {
    fn deserialize(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_primitive_message {
    ($($t:ty => $put:ident, $get:ident);* $(;)?) => {
        $(
            impl NetSerialize for $t {
                fn serialize(&self, writer: &mut Writer) -> Result<()> {
                    writer.$put(*self);
                    Ok(())
                }
            }

            impl NetDeserialize for $t {
                fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
                    reader.$get()
                }
            }
        )*
    };
}

impl_primitive_message! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    bool => put_bool, get_bool;
    i16 => put_i16, get_i16;
    u16 => put_u16, get_u16;
    i32 => put_i32, get_i32;
    u32 => put_u32, get_u32;
    f32 => put_f32, get_f32;
    i64 => put_i64, get_i64;
    u64 => put_u64, get_u64;
    f64 => put_f64, get_f64;
}

/// Nullable string body
impl NetSerialize for Option<String> {
    fn serialize(&self, writer: &mut Writer) -> Result<()> {
        writer.put_string(self.as_deref());
        Ok(())
    }
}

impl NetDeserialize for Option<String> {
    fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
        reader.get_string()
    }
}

/// Serde value carried as `u32 length + bincode bytes`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bincoded<T>(pub T);

impl<T> Bincoded<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize> NetSerialize for Bincoded<T> {
    fn serialize(&self, writer: &mut Writer) -> Result<()> {
        let bytes = bincode::serialize(&self.0)?;
        let length = u32::try_from(bytes.len()).map_err(|_| {
            ProtocolError::SerializeError(format!(
                "bincode payload too large: {} bytes",
                bytes.len()
            ))
        })?;
        writer.put_u32(length);
        writer.put_raw(&bytes);
        Ok(())
    }
}

impl<T: DeserializeOwned> NetDeserialize for Bincoded<T> {
    fn deserialize(reader: &mut Reader<'_>) -> Result<Self> {
        let length = reader.get_u32()? as usize;
        let bytes = reader.get_data_segment(length)?;
        Ok(Bincoded(bincode::deserialize(bytes)?))
    }
}
