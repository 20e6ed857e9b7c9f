//! Little-endian primitive reads over image and stack bytes.
//!
//! Every structure this crate decodes (function-table entries, unwind blobs, unwind tails,
//! EH tables and saved register slots) is little-endian on all supported targets, so only
//! the little-endian direction is provided. All reads are bounds-checked and fail with
//! [`crate::Error::OutOfBounds`] instead of panicking on truncated data.
//!
//! # Key Components
//!
//! - [`crate::file::io::ImageIO`] - Trait implemented by every primitive that can be read
//! - [`crate::file::io::read_le`] - Read a value from the start of a buffer
//! - [`crate::file::io::read_le_at`] - Read a value at an offset and advance the offset

use crate::Result;

/// Trait for primitive values that can be decoded from little-endian bytes.
///
/// The associated [`ImageIO::Bytes`] array is what [`read_le_at`] slices out of the buffer
/// before conversion.
pub trait ImageIO: Sized {
    /// Byte array representation of this type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    /// Read Self from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_image_io {
    ($($ty:ty),*) => {
        $(
            impl ImageIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_image_io!(u8, i8, u16, i16, u32, i32, u64, i64, u128);

/// Read a little-endian value from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: ImageIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Read a little-endian value at `offset` and advance `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value would extend past the end of `data`;
/// `offset` is left untouched in that case.
pub fn read_le_at<T: ImageIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset
        .checked_add(type_len)
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn read_le_u32() {
        let data = [0x78, 0x56, 0x34, 0x12, 0xFF];
        assert_eq!(read_le::<u32>(&data).unwrap(), 0x1234_5678);
    }

    #[test]
    fn read_le_at_advances() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut offset = 1;
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x0302);
        assert_eq!(offset, 3);
        assert_eq!(read_le_at::<u8>(&data, &mut offset).unwrap(), 0x04);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_le_at_truncated() {
        let data = [0x01, 0x02, 0x03];
        let mut offset = 0;
        assert!(matches!(
            read_le_at::<u32>(&data, &mut offset),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(offset, 0);
    }

    #[test]
    fn read_le_at_offset_overflow() {
        let data = [0x01, 0x02, 0x03];
        let mut offset = usize::MAX;
        assert!(matches!(
            read_le_at::<u8>(&data, &mut offset),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn read_le_u128() {
        let mut data = [0u8; 16];
        data[0] = 0xAA;
        data[15] = 0x55;
        let value = read_le::<u128>(&data).unwrap();
        assert_eq!(value & 0xFF, 0xAA);
        assert_eq!(value >> 120, 0x55);
    }
}
