//! Decoder for the exception-clause table of a root method.
//!
//! The table starts with the clause count, followed by one record per clause. Every field
//! except the type reference is a native unsigned integer (see [`crate::Parser`]):
//!
//! ```text
//! try_start | (try_length << 2) | kind | handler | type RVA (u32, typed) / filter (filter)
//! ```
//!
//! Offsets are relative to the start of the root method; the type reference is relative to
//! the module base.

use crate::{Error, Parser, Result};

/// Kind-specific part of an [`EhClause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EhClauseKind {
    /// A `catch` of one exception type
    Typed {
        /// Absolute address of the caught type
        target_type: u64,
    },
    /// A `fault` or `finally` handler
    Fault,
    /// A filtered `catch`
    Filter {
        /// Absolute address of the filter funclet
        filter_address: u64,
    },
}

impl EhClauseKind {
    const TYPED: u32 = 0;
    const FAULT: u32 = 1;
    const FILTER: u32 = 2;
}

/// One decoded exception clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EhClause {
    /// Start of the protected range, relative to the method start
    pub try_start_offset: u32,
    /// Exclusive end of the protected range, relative to the method start
    pub try_end_offset: u32,
    /// Absolute address of the handler funclet
    pub handler_address: u64,
    /// Clause kind and its data
    pub kind: EhClauseKind,
}

impl EhClause {
    /// Returns `true` if `offset` lies in the protected range.
    #[must_use]
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.try_start_offset && offset < self.try_end_offset
    }
}

/// Iterator over the clauses of one method, in encoded order.
///
/// Created by [`crate::CodeManager::eh_enum_init`]. Decoding errors are yielded once; the
/// iterator is exhausted afterwards.
#[derive(Debug, Clone)]
pub struct EhEnumerator<'a> {
    parser: Parser<'a>,
    module_base: u64,
    method_start: u64,
    remaining: u32,
}

impl<'a> EhEnumerator<'a> {
    /// Start decoding at the clause count at the parser's position.
    ///
    /// # Errors
    /// Returns an error if the clause count cannot be decoded.
    pub fn new(mut parser: Parser<'a>, module_base: u64, method_start: u64) -> Result<Self> {
        let remaining = parser.read_native_unsigned()?;

        Ok(EhEnumerator {
            parser,
            module_base,
            method_start,
            remaining,
        })
    }

    /// Absolute address the clause offsets are relative to.
    #[must_use]
    pub fn method_start_address(&self) -> u64 {
        self.method_start
    }

    /// Number of clauses not yet returned.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    fn handler_address(&mut self) -> Result<u64> {
        let offset = self.parser.read_native_unsigned()?;
        Ok(self.method_start + u64::from(offset))
    }

    fn read_clause(&mut self) -> Result<EhClause> {
        let try_start_offset = self.parser.read_native_unsigned()?;
        let length_and_kind = self.parser.read_native_unsigned()?;
        let try_end_offset = try_start_offset
            .checked_add(length_and_kind >> 2)
            .ok_or_else(|| malformed_error!("EH clause try range overflows"))?;

        let (handler_address, kind) = match length_and_kind & 0x3 {
            EhClauseKind::TYPED => {
                let handler = self.handler_address()?;
                let type_rva = self.parser.read_le::<u32>()?;
                (
                    handler,
                    EhClauseKind::Typed {
                        target_type: self.module_base + u64::from(type_rva),
                    },
                )
            }
            EhClauseKind::FAULT => (self.handler_address()?, EhClauseKind::Fault),
            EhClauseKind::FILTER => {
                let handler = self.handler_address()?;
                let filter_address = self.handler_address()?;
                (handler, EhClauseKind::Filter { filter_address })
            }
            kind => return Err(Error::InvalidClauseKind(kind)),
        };

        Ok(EhClause {
            try_start_offset,
            try_end_offset,
            handler_address,
            kind,
        })
    }
}

impl Iterator for EhEnumerator<'_> {
    type Item = Result<EhClause>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let clause = self.read_clause();
        if clause.is_err() {
            self.remaining = 0;
        }
        Some(clause)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
