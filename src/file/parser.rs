//! Cursor-based byte parser for unwind blobs and EH tables.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a bounds-checked cursor over a
//! byte slice. Besides fixed-width little-endian reads it decodes the variable-length unsigned
//! integer format the native compiler uses for exception-handling tables.
//!
//! # Native unsigned encoding
//!
//! The number of low set bits in the first byte selects the width of the value:
//!
//! | First byte    | Bytes | Value bits                                  |
//! |---------------|-------|---------------------------------------------|
//! | `xxxx_xxx0`   | 1     | `b0 >> 1`                                   |
//! | `xxxx_xx01`   | 2     | `b0 >> 2 \| b1 << 6`                        |
//! | `xxxx_x011`   | 3     | `b0 >> 3 \| b1 << 5 \| b2 << 13`            |
//! | `xxxx_0111`   | 4     | `b0 >> 4 \| b1 << 4 \| b2 << 12 \| b3 << 20` |
//! | `xxx0_1111`   | 5     | little-endian `u32` in the next four bytes  |
//!
//! A first byte with the five low bits set is malformed.
//!
//! # Usage Examples
//!
//! ```rust
//! use nativescope::Parser;
//!
//! let data = [0x08, 0x05, 0x02, 0x78, 0x56, 0x34, 0x12];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_native_unsigned()?, 4);
//! assert_eq!(parser.read_native_unsigned()?, 0x81);
//! assert_eq!(parser.read_le::<u32>()?, 0x1234_5678);
//! # Ok::<(), nativescope::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, ImageIO},
    Result,
};

/// A bounds-checked cursor over a byte slice.
///
/// The parser never reads past the end of its slice: every read either succeeds and advances
/// the cursor or fails with [`crate::Error::OutOfBounds`] / [`crate::Error::Malformed`] without
/// touching it.
///
/// # Examples
///
/// ```rust
/// use nativescope::Parser;
///
/// let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
/// let mut parser = Parser::new(&data);
///
/// let first = parser.read_le::<u32>()?;
/// assert_eq!(first, 0x04030201);
///
/// parser.seek(6)?;
/// assert_eq!(parser.read_le::<u16>()?, 0x0807);
/// # Ok::<(), nativescope::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Number of bytes between the cursor and the end of the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the current position to the specified index.
    ///
    /// Seeking to exactly the end of the buffer is allowed; the next read will fail.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is beyond the data length.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by the specified number of bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing by step would exceed the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        match self.position.checked_add(step) {
            Some(end) if end <= self.data.len() => {
                self.position = end;
                Ok(())
            }
            _ => Err(out_of_bounds_error!()),
        }
    }

    /// Advance the cursor to the next multiple of `alignment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the aligned position lies past the end.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.advance_by(padding)
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Get access to the whole underlying data buffer.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Peek at the byte under the cursor without advancing.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the buffer.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data
            .get(self.position)
            .copied()
            .ok_or(out_of_bounds_error!())
    }

    /// Read a little-endian value and advance past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough data remains.
    pub fn read_le<T: ImageIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Borrow the next `length` bytes and advance past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if not enough data remains.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let start = self.position;
        self.advance_by(length)?;
        Ok(&self.data[start..self.position])
    }

    /// Read one variable-length unsigned integer in the native compiler's encoding.
    ///
    /// See the module documentation for the encoding table.
    ///
    /// # Errors
    /// - [`crate::Error::OutOfBounds`] if the encoded value is truncated
    /// - [`crate::Error::Malformed`] if the first byte selects no valid width
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nativescope::Parser;
    ///
    /// let mut parser = Parser::new(&[0x0F, 0xEF, 0xBE, 0xAD, 0xDE]);
    /// assert_eq!(parser.read_native_unsigned()?, 0xDEAD_BEEF);
    /// # Ok::<(), nativescope::Error>(())
    /// ```
    pub fn read_native_unsigned(&mut self) -> Result<u32> {
        let b0 = u32::from(self.peek_byte()?);
        let width = (b0.trailing_ones() + 1) as usize;
        if width > 5 {
            return Err(malformed_error!(
                "Invalid native unsigned prefix {:#04x} at offset {}",
                b0,
                self.position
            ));
        }

        let bytes = self.read_bytes(width)?;
        let value = match width {
            1 => b0 >> 1,
            2 => (b0 >> 2) | (u32::from(bytes[1]) << 6),
            3 => (b0 >> 3) | (u32::from(bytes[1]) << 5) | (u32::from(bytes[2]) << 13),
            4 => {
                (b0 >> 4)
                    | (u32::from(bytes[1]) << 4)
                    | (u32::from(bytes[2]) << 12)
                    | (u32::from(bytes[3]) << 20)
            }
            _ => u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        };

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn native_unsigned_widths() {
        let cases: &[(&[u8], u32)] = &[
            (&[0x00], 0),
            (&[0xFE], 0x7F),
            (&[0x01, 0x01], 0x40),
            (&[0xFD, 0xFF], 0x3FFF),
            (&[0x03, 0x00, 0x01], 0x2000),
            (&[0xFB, 0xFF, 0xFF], 0x1F_FFFF),
            (&[0x07, 0x00, 0x00, 0x01], 0x10_0000),
            (&[0xF7, 0xFF, 0xFF, 0xFF], 0x0FFF_FFFF),
            (&[0x0F, 0x78, 0x56, 0x34, 0x12], 0x1234_5678),
        ];

        for (bytes, expected) in cases {
            let mut parser = Parser::new(bytes);
            assert_eq!(
                parser.read_native_unsigned().unwrap(),
                *expected,
                "encoding {:02x?}",
                bytes
            );
            assert!(!parser.has_more_data(), "encoding {:02x?}", bytes);
        }
    }

    #[test]
    fn native_unsigned_sequence() {
        // 5, 300, 70000
        let data = [0x0A, 0xB1, 0x04, 0x83, 0x8B, 0x08];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_native_unsigned().unwrap(), 5);
        assert_eq!(parser.read_native_unsigned().unwrap(), 300);
        assert_eq!(parser.read_native_unsigned().unwrap(), 70000);
        assert_eq!(parser.pos(), data.len());
    }

    #[test]
    fn native_unsigned_invalid_prefix() {
        let mut parser = Parser::new(&[0x1F, 0, 0, 0, 0, 0]);
        assert!(matches!(
            parser.read_native_unsigned(),
            Err(Error::Malformed { .. })
        ));
        assert_eq!(parser.pos(), 0);
    }

    #[test]
    fn native_unsigned_truncated() {
        let mut parser = Parser::new(&[0x07, 0x00]);
        assert!(matches!(
            parser.read_native_unsigned(),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(parser.pos(), 0);
    }

    #[test]
    fn seek_and_align() {
        let data = [0u8; 10];
        let mut parser = Parser::new(&data);
        parser.advance_by(5).unwrap();
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 8);
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 8);
        assert!(parser.align(16).is_err());
        parser.seek(10).unwrap();
        assert!(!parser.has_more_data());
        assert!(parser.seek(11).is_err());
    }

    #[test]
    fn read_bytes_borrows() {
        let data = [1, 2, 3, 4];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(parser.remaining(), 1);
        assert!(parser.read_bytes(2).is_err());
    }
}
