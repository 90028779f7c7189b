//! # Binary Codec
//!
//! Low-level encoding of primitives, strings, arrays and raw byte ranges into a
//! growable buffer, and decoding them back out of a borrowed frame.
//!
//! ## Components
//! - **Writer**: owns a reusable backing buffer that doubles on overflow
//! - **Reader**: zero-copy cursor over a received frame
//! - **Serialization**: `NetSerialize`/`NetDeserialize` traits and a serde bridge
//!
//! ## Wire Format
//! ```text
//! primitives : fixed width, little-endian
//! char       : u16 code unit
//! string     : u16 (byte_len + 1, 0 = null) + UTF-8 bytes
//! array      : u16 (count + 1, 0 = null, 1 = empty) + elements
//! ```
//!
//! ## Safety
//! - Reading past the end of a frame is always an error, never a partial read
//! - Strings whose UTF-8 form reaches 32 KiB are encoded as null

pub mod primitive;
pub mod reader;
pub mod serialization;
pub mod writer;

pub use primitive::Primitive;
pub use reader::Reader;
pub use serialization::{Bincoded, NetDeserialize, NetSerialize};
pub use writer::Writer;

/// Maximum string size in bytes; strings at or above this size are encoded as null
pub const STRING_MAX_BYTES: usize = 32 * 1024;

/// Encoded value of `true`
pub const TRUE: u8 = 1;

/// Encoded value of `false`
pub const FALSE: u8 = 0;
