//! The classification tail that follows every unwind blob.
//!
//! The compiler appends a fixed little structure to the architecture-specific unwind data of
//! each function-table entry:
//!
//! ```text
//! +-------+---------------------------+-------------------+------------------+
//! | flags | associated-data RVA (u32) | EH-info RVA (u32) | GC info ...      |
//! | u8    | if HAS_ASSOCIATED_DATA    | if HAS_EHINFO     | (root only)      |
//! +-------+---------------------------+-------------------+------------------+
//! ```
//!
//! The optional fields always appear in that order. [`UnwindTail`] decodes the tail once and
//! exposes the fields through accessors, so no caller repeats the offset arithmetic.

use bitflags::bitflags;
use strum::{EnumCount, EnumIter};

use crate::{image::ModuleImage, Result};

bitflags! {
    /// Classification byte stored directly after an unwind blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnwindBlockFlags: u8 {
        /// Mask of the 2-bit [`FuncKind`] field
        const FUNC_KIND_MASK = 0x03;
        /// An EH-info RVA is present and the method has exception clauses
        const HAS_EHINFO = 0x04;
        /// The method is a reverse-P/Invoke entry point (native-to-managed transition)
        const REVERSE_PINVOKE = 0x08;
        /// An associated-data RVA is present
        const HAS_ASSOCIATED_DATA = 0x10;
    }
}

/// What kind of code region a function-table entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum FuncKind {
    /// The main body of a method
    Root,
    /// A catch / finally / fault funclet
    Handler,
    /// A filter funclet
    Filter,
}

impl FuncKind {
    /// Extract the kind from a classification byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for the unused kind value `3`.
    pub fn from_flags(flags: UnwindBlockFlags) -> Result<Self> {
        match (flags & UnwindBlockFlags::FUNC_KIND_MASK).bits() {
            0 => Ok(FuncKind::Root),
            1 => Ok(FuncKind::Handler),
            2 => Ok(FuncKind::Filter),
            kind => Err(malformed_error!("Invalid function kind {} in unwind tail", kind)),
        }
    }
}

/// Decoded view of one classification tail.
#[derive(Debug, Clone, Copy)]
pub struct UnwindTail<'a> {
    rva: u32,
    flags: UnwindBlockFlags,
    kind: FuncKind,
    associated_data_rva: Option<u32>,
    eh_info_rva: Option<u32>,
    gc_info_rva: u32,
    gc_info: &'a [u8],
}

impl<'a> UnwindTail<'a> {
    /// Decode the tail whose classification byte lives at `rva`.
    ///
    /// # Errors
    /// - [`crate::Error::OutOfBounds`] if the tail is truncated by the end of the image
    /// - [`crate::Error::Malformed`] if the function kind is invalid
    pub fn parse(image: &ModuleImage<'a>, rva: u32) -> Result<Self> {
        let mut parser = image.parser_at(rva)?;

        let flags = UnwindBlockFlags::from_bits_retain(parser.read_le::<u8>()?);
        let kind = FuncKind::from_flags(flags)?;

        let associated_data_rva = if flags.contains(UnwindBlockFlags::HAS_ASSOCIATED_DATA) {
            Some(parser.read_le::<u32>()?)
        } else {
            None
        };

        let eh_info_rva = if flags.contains(UnwindBlockFlags::HAS_EHINFO) {
            Some(parser.read_le::<u32>()?)
        } else {
            None
        };

        let gc_info_start = parser.pos();
        #[allow(clippy::cast_possible_truncation)]
        let gc_info_rva = gc_info_start as u32;

        Ok(UnwindTail {
            rva,
            flags,
            kind,
            associated_data_rva,
            eh_info_rva,
            gc_info_rva,
            gc_info: &image.data()[gc_info_start..],
        })
    }

    /// RVA of the classification byte.
    #[must_use]
    pub fn rva(&self) -> u32 {
        self.rva
    }

    /// The raw classification flags.
    #[must_use]
    pub fn flags(&self) -> UnwindBlockFlags {
        self.flags
    }

    /// Root, handler or filter.
    #[must_use]
    pub fn kind(&self) -> FuncKind {
        self.kind
    }

    /// Any non-root kind.
    #[must_use]
    pub fn is_funclet(&self) -> bool {
        self.kind != FuncKind::Root
    }

    /// Filter funclets only.
    #[must_use]
    pub fn is_filter(&self) -> bool {
        self.kind == FuncKind::Filter
    }

    /// Returns `true` if the entry carries an EH-info RVA.
    #[must_use]
    pub fn has_eh_info(&self) -> bool {
        self.eh_info_rva.is_some()
    }

    /// Returns `true` if the entry is a reverse-P/Invoke method.
    #[must_use]
    pub fn has_reverse_pinvoke(&self) -> bool {
        self.flags.contains(UnwindBlockFlags::REVERSE_PINVOKE)
    }

    /// Returns `true` if the entry carries an associated-data RVA.
    #[must_use]
    pub fn has_associated_data(&self) -> bool {
        self.associated_data_rva.is_some()
    }

    /// Module-relative location of the compiler-attached data blob.
    #[must_use]
    pub fn associated_data_rva(&self) -> Option<u32> {
        self.associated_data_rva
    }

    /// Module-relative location of the EH table.
    #[must_use]
    pub fn eh_info_rva(&self) -> Option<u32> {
        self.eh_info_rva
    }

    /// RVA of the first byte after the tail.
    #[must_use]
    pub fn gc_info_rva(&self) -> u32 {
        self.gc_info_rva
    }

    /// Bytes from the end of the tail to the end of the image.
    ///
    /// Only meaningful for root entries; the length of the GC info is known to the
    /// safe-point decoder alone.
    #[must_use]
    pub fn gc_info(&self) -> &'a [u8] {
        self.gc_info
    }
}
