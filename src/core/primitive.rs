//! Fixed-width values that can be bulk-encoded in arrays.

use super::TRUE;

/// A fixed-size value with an explicit little-endian wire form
pub trait Primitive: Copy + Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write `self` into exactly `SIZE` bytes
    fn write_le(self, out: &mut [u8]);

    /// Read a value from exactly `SIZE` bytes
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($($t:ty),* $(,)?) => {
        $(
            impl Primitive for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, i16, u16, i32, u32, f32, i64, u64, f64);

impl Primitive for bool {
    const SIZE: usize = 1;

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] == TRUE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut out = [0u8; 4];
        0x0102_0304u32.write_le(&mut out);
        assert_eq!(out, [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(u32::read_le(&out), 0x0102_0304);
    }

    #[test]
    fn test_bool_only_one_is_true() {
        assert!(bool::read_le(&[1]));
        assert!(!bool::read_le(&[0]));
        assert!(!bool::read_le(&[2]));
    }
}
