//! Access to the stack memory of the thread being walked.
//!
//! Unwinding reads saved registers, return addresses and transition-frame pointers out of
//! the walked thread's stack. The code manager never dereferences raw addresses itself; all
//! such reads go through a [`MemoryReader`], which the stack-walk driver implements over
//! whatever view of the thread it has (live process, minidump, test buffer).
//!
//! [`MemoryRegion`] is the slice-backed implementation used for self-contained snapshots.

use crate::{Error, Result};

/// Read access to target memory by absolute address.
///
/// Only [`MemoryReader::read`] needs to be provided; the typed accessors decode
/// little-endian values on top of it.
pub trait MemoryReader {
    /// Fill `buffer` with the bytes at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnreadableMemory`] if any byte of the range is unavailable.
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<()>;

    /// Read a little-endian `u32`.
    ///
    /// # Errors
    /// Propagates the failure of [`MemoryReader::read`].
    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut bytes = [0_u8; 4];
        self.read(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a little-endian `u64`.
    ///
    /// # Errors
    /// Propagates the failure of [`MemoryReader::read`].
    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut bytes = [0_u8; 8];
        self.read(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a little-endian 128-bit vector register image.
    ///
    /// # Errors
    /// Propagates the failure of [`MemoryReader::read`].
    fn read_u128(&self, address: u64) -> Result<u128> {
        let mut bytes = [0_u8; 16];
        self.read(address, &mut bytes)?;
        Ok(u128::from_le_bytes(bytes))
    }

    /// Read a pointer of `pointer_size` bytes (4 or 8), zero-extended to `u64`.
    ///
    /// # Errors
    /// Propagates the failure of [`MemoryReader::read`].
    fn read_pointer(&self, address: u64, pointer_size: u64) -> Result<u64> {
        if pointer_size == 4 {
            Ok(u64::from(self.read_u32(address)?))
        } else {
            self.read_u64(address)
        }
    }
}

/// A contiguous snapshot of target memory starting at `base`.
///
/// # Examples
///
/// ```rust
/// use nativescope::{MemoryReader, MemoryRegion};
///
/// let stack = [0x10, 0x20, 0x30, 0x40, 0, 0, 0, 0];
/// let region = MemoryRegion::new(0x7ff0_0000, &stack);
/// assert_eq!(region.read_u32(0x7ff0_0000)?, 0x4030_2010);
/// assert!(region.read_u64(0x7ff0_0004).is_err());
/// # Ok::<(), nativescope::Error>(())
/// ```
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion<'a> {
    base: u64,
    data: &'a [u8],
}

impl<'a> MemoryRegion<'a> {
    /// Create a region whose first byte lives at `base`.
    #[must_use]
    pub fn new(base: u64, data: &'a [u8]) -> Self {
        MemoryRegion { base, data }
    }

    /// Address of the first byte of the region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if `[address, address + len)` lies fully inside the region.
    #[must_use]
    pub fn contains(&self, address: u64, len: usize) -> bool {
        self.slice(address, len).is_some()
    }

    fn slice(&self, address: u64, len: usize) -> Option<&'a [u8]> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }
}

impl MemoryReader for MemoryRegion<'_> {
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let Some(bytes) = self.slice(address, buffer.len()) else {
            return Err(Error::UnreadableMemory(address));
        };

        buffer.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_reads() {
        let mut data = vec![0xCC_u8; 64];
        data[8..16].copy_from_slice(&0x1122_3344_5566_7788_u64.to_le_bytes());

        let region = MemoryRegion::new(0x1000, &data);
        assert_eq!(region.len(), 64);
        assert_eq!(region.read_u64(0x1008).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(region.read_u32(0x1008).unwrap(), 0x5566_7788);
        assert_eq!(region.read_pointer(0x100C, 4).unwrap(), 0x1122_3344);
        assert_eq!(region.read_pointer(0x1008, 8).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn region_bounds() {
        let data = [0_u8; 16];
        let region = MemoryRegion::new(0x2000, &data);

        assert!(region.contains(0x2000, 16));
        assert!(!region.contains(0x2000, 17));
        assert!(matches!(
            region.read_u64(0x1FF8),
            Err(Error::UnreadableMemory(0x1FF8))
        ));
        assert!(region.read_u64(0x2009).is_err());
        assert!(region.read_u128(u64::MAX).is_err());
    }

    #[test]
    fn region_empty() {
        let region = MemoryRegion::new(0, &[]);
        assert!(region.is_empty());
        assert!(region.read_u32(0).is_err());
    }
}
