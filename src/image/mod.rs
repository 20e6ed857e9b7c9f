//! Loaded module images as seen by the code manager.
//!
//! A [`ModuleImage`] is a borrowed, immutable view of one loaded native image: its load
//! address, its bytes laid out by RVA (as mapped, not as stored on disk), the address range
//! holding managed code, the location of the function table and the class-library callback
//! table. Loading and relocation are done by someone else; this module only records where
//! things are and hands out bounds-checked slices.
//!
//! # Key Components
//!
//! - [`ModuleImage`] - The registered view queried by [`crate::CodeManager`]
//! - [`ModuleRegistration`] - Builder collecting the registration inputs
//! - [`RegistrationConfig`] - Which table checks run when a code manager is created
//!
//! # Examples
//!
//! ```rust
//! use nativescope::ModuleRegistration;
//!
//! let mapped = vec![0_u8; 0x4000];
//! let classlib = [0x1_4000_2000_u64, 0x1_4000_2100];
//! let image = ModuleRegistration::new(0x1_4000_0000, &mapped)
//!     .managed_code(0x1_4000_1000, 0x1000)
//!     .function_table(0x3000, 0)
//!     .classlib_functions(&classlib)
//!     .build()?;
//!
//! assert!(image.contains(0x1_4000_1800));
//! assert!(!image.contains(0x1_4000_2000));
//! # Ok::<(), nativescope::Error>(())
//! ```

mod config;

pub use config::RegistrationConfig;

use std::ops::Range;

use goblin::pe::header::Header;

use crate::{arch::Architecture, file::io::read_le_at, Parser, Result};

/// Immutable view of one registered module.
#[derive(Clone, Copy, Debug)]
pub struct ModuleImage<'a> {
    base: u64,
    data: &'a [u8],
    managed_start: u64,
    managed_end: u64,
    function_table_rva: u32,
    function_count: u32,
    classlib_functions: &'a [u64],
}

impl<'a> ModuleImage<'a> {
    /// Load address of the module; also its OS module handle.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The mapped bytes, indexed by RVA.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Absolute address range `[start, end)` holding managed code.
    #[must_use]
    pub fn managed_range(&self) -> Range<u64> {
        self.managed_start..self.managed_end
    }

    /// Returns `true` if `pc` lies in this module's managed code.
    #[must_use]
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.managed_start && pc < self.managed_end
    }

    /// RVA of the first function-table entry.
    #[must_use]
    pub fn function_table_rva(&self) -> u32 {
        self.function_table_rva
    }

    /// Number of function-table entries.
    #[must_use]
    pub fn function_count(&self) -> u32 {
        self.function_count
    }

    /// Class-library callback addresses, indexed by id.
    #[must_use]
    pub fn classlib_functions(&self) -> &'a [u64] {
        self.classlib_functions
    }

    /// Convert an absolute address inside the image into an RVA.
    #[must_use]
    pub fn rva_of(&self, address: u64) -> Option<u32> {
        address
            .checked_sub(self.base)
            .and_then(|rva| u32::try_from(rva).ok())
    }

    /// Borrow `len` bytes starting at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range leaves the image.
    pub fn bytes_at(&self, rva: u32, len: usize) -> Result<&'a [u8]> {
        let start = rva as usize;
        let end = start.checked_add(len).ok_or(out_of_bounds_error!())?;
        self.data.get(start..end).ok_or(out_of_bounds_error!())
    }

    /// Create a [`Parser`] over the image positioned at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `rva` lies past the end of the image.
    pub fn parser_at(&self, rva: u32) -> Result<Parser<'a>> {
        let mut parser = Parser::new(self.data);
        parser.seek(rva as usize)?;
        Ok(parser)
    }

    /// Read a little-endian `u32` at `rva`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value leaves the image.
    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let mut offset = rva as usize;
        read_le_at::<u32>(self.data, &mut offset)
    }
}

/// Builder for a [`ModuleImage`], mirroring what the loader hands over at registration.
#[derive(Clone, Debug)]
pub struct ModuleRegistration<'a> {
    base: u64,
    data: &'a [u8],
    managed_code: Option<(u64, u64)>,
    function_table: Option<(u32, u32)>,
    classlib_functions: &'a [u64],
}

impl<'a> ModuleRegistration<'a> {
    /// Start a registration for an image mapped at `base`.
    #[must_use]
    pub fn new(base: u64, data: &'a [u8]) -> Self {
        ModuleRegistration {
            base,
            data,
            managed_code: None,
            function_table: None,
            classlib_functions: &[],
        }
    }

    /// Locate the function table and code range through the PE headers of a mapped image.
    ///
    /// The function table is the exception data directory, with one entry per
    /// `A::FUNCTION_ENTRY_SIZE` bytes. The managed range defaults to the code range
    /// declared in the optional header; call [`ModuleRegistration::managed_code`] afterwards
    /// to narrow it to the managed-code section.
    ///
    /// # Errors
    /// - [`crate::Error::GoblinErr`] if the headers do not parse
    /// - [`crate::Error::Malformed`] if there is no optional header or no exception directory
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use nativescope::{arch::Amd64, ModuleRegistration};
    ///
    /// let mapped = std::fs::read("mapped_image.bin")?;
    /// let image = ModuleRegistration::from_pe_headers::<Amd64>(0x1_4000_0000, &mapped)?
    ///     .build()?;
    /// println!("{} functions", image.function_count());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_pe_headers<A: Architecture>(base: u64, data: &'a [u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        let Some(optional_header) = header.optional_header else {
            return Err(malformed_error!("Image has no optional header"));
        };

        let Some(exceptions) = optional_header.data_directories.get_exception_table() else {
            return Err(malformed_error!("Image has no exception directory"));
        };

        let count = exceptions.size / A::FUNCTION_ENTRY_SIZE as u32;
        let code_start = base + u64::from(optional_header.standard_fields.base_of_code);
        let code_len = u64::from(optional_header.standard_fields.size_of_code);

        Ok(ModuleRegistration::new(base, data)
            .managed_code(code_start, code_len)
            .function_table(exceptions.virtual_address, count))
    }

    /// Absolute start address and length of the managed code.
    #[must_use]
    pub fn managed_code(mut self, start: u64, len: u64) -> Self {
        self.managed_code = Some((start, len));
        self
    }

    /// RVA and entry count of the function table.
    #[must_use]
    pub fn function_table(mut self, rva: u32, count: u32) -> Self {
        self.function_table = Some((rva, count));
        self
    }

    /// Class-library callback table, indexed by id.
    #[must_use]
    pub fn classlib_functions(mut self, functions: &'a [u64]) -> Self {
        self.classlib_functions = functions;
        self
    }

    /// Finish the registration.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the managed range or function table was not
    /// supplied, or the managed range wraps around the address space or starts below the
    /// image base.
    pub fn build(self) -> Result<ModuleImage<'a>> {
        let Some((managed_start, managed_len)) = self.managed_code else {
            return Err(malformed_error!("Module registration without managed code range"));
        };
        let Some((function_table_rva, function_count)) = self.function_table else {
            return Err(malformed_error!("Module registration without function table"));
        };

        let Some(managed_end) = managed_start.checked_add(managed_len) else {
            return Err(malformed_error!(
                "Managed code range {:#x}+{:#x} wraps around",
                managed_start,
                managed_len
            ));
        };
        if managed_start < self.base {
            return Err(malformed_error!(
                "Managed code at {:#x} starts below image base {:#x}",
                managed_start,
                self.base
            ));
        }

        Ok(ModuleImage {
            base: self.base,
            data: self.data,
            managed_start,
            managed_end,
            function_table_rva,
            function_count,
            classlib_functions: self.classlib_functions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::Amd64, Error};

    #[test]
    fn registration_requires_inputs() {
        let data = [0_u8; 16];
        assert!(matches!(
            ModuleRegistration::new(0x1000, &data)
                .function_table(0, 0)
                .build(),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            ModuleRegistration::new(0x1000, &data)
                .managed_code(0x1000, 0x10)
                .build(),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            ModuleRegistration::new(0x1000, &data)
                .managed_code(0x800, 0x10)
                .function_table(0, 0)
                .build(),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            ModuleRegistration::new(0x1000, &data)
                .managed_code(u64::MAX - 1, 0x10)
                .function_table(0, 0)
                .build(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn image_accessors() {
        let mut data = vec![0_u8; 0x100];
        data[0x40..0x44].copy_from_slice(&0xCAFE_F00D_u32.to_le_bytes());
        let classlib = [0x5000_u64];

        let image = ModuleRegistration::new(0x40_0000, &data)
            .managed_code(0x40_0010, 0x20)
            .function_table(0x80, 2)
            .classlib_functions(&classlib)
            .build()
            .unwrap();

        assert_eq!(image.base(), 0x40_0000);
        assert_eq!(image.managed_range(), 0x40_0010..0x40_0030);
        assert!(image.contains(0x40_0010));
        assert!(image.contains(0x40_002F));
        assert!(!image.contains(0x40_0030));
        assert!(!image.contains(0x40_000F));
        assert_eq!(image.function_table_rva(), 0x80);
        assert_eq!(image.function_count(), 2);
        assert_eq!(image.classlib_functions(), &[0x5000]);
        assert_eq!(image.rva_of(0x40_0044), Some(0x44));
        assert_eq!(image.rva_of(0x3F_FFFF), None);
        assert_eq!(image.read_u32(0x40).unwrap(), 0xCAFE_F00D);
        assert!(image.read_u32(0xFE).is_err());
        assert!(image.bytes_at(0xF0, 0x10).is_ok());
        assert!(image.bytes_at(0xF0, 0x11).is_err());
        assert_eq!(image.parser_at(0x40).unwrap().pos(), 0x40);
        assert!(image.parser_at(0x101).is_err());
    }

    #[test]
    fn pe_headers_garbage() {
        let data = [0_u8; 64];
        assert!(ModuleRegistration::from_pe_headers::<Amd64>(0x1000, &data).is_err());
    }
}
