//! The sorted function table of a module and PC resolution against it.
//!
//! Entries are ordered by start RVA and do not overlap. [`FunctionTable::lookup`] narrows
//! the candidates with a binary search until at most ten remain, then scans linearly for the
//! boundary. Funclets share the table with their root method and always follow it, so
//! [`FunctionTable::root_of`] finds the owner of a funclet by walking backward to the first
//! root-kind entry.

use std::marker::PhantomData;

use crate::{
    arch::{Architecture, UnwindBlob},
    codeman::tail::UnwindTail,
    file::io::read_le,
    image::ModuleImage,
    Error, Parser, Result,
};

/// Below this many candidates the lookup switches from bisection to a linear scan.
const LINEAR_SCAN_THRESHOLD: usize = 10;

/// One decoded function-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionEntry {
    /// Position in the function table
    pub index: usize,
    /// RVA of the first instruction
    pub begin_rva: u32,
    /// Exclusive end RVA, when the table format stores it
    pub end_rva: Option<u32>,
    /// RVA (or packed word) of the unwind data
    pub unwind_data: u32,
}

/// Read access to a module's function table.
#[derive(Debug, Clone, Copy)]
pub struct FunctionTable<'a, A: Architecture> {
    image: ModuleImage<'a>,
    entries: &'a [u8],
    count: usize,
    _arch: PhantomData<A>,
}

impl<'a, A: Architecture> FunctionTable<'a, A> {
    /// Bind the table registered for `image`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the table does not fit inside the image.
    pub fn new(image: ModuleImage<'a>) -> Result<Self> {
        let count = image.function_count() as usize;
        let len = count
            .checked_mul(A::FUNCTION_ENTRY_SIZE)
            .ok_or(out_of_bounds_error!())?;
        let entries = image.bytes_at(image.function_table_rva(), len)?;

        Ok(FunctionTable {
            image,
            entries,
            count,
            _arch: PhantomData,
        })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The image the table belongs to.
    #[must_use]
    pub fn image(&self) -> &ModuleImage<'a> {
        &self.image
    }

    /// Start RVA of entry `index`; every layout stores it in the first four bytes.
    fn begin_rva(&self, index: usize) -> Result<u32> {
        let start = index * A::FUNCTION_ENTRY_SIZE;
        let bytes = self
            .entries
            .get(start..start + 4)
            .ok_or(out_of_bounds_error!())?;
        read_le::<u32>(bytes)
    }

    /// Decode entry `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `index` is past the end of the table.
    pub fn entry(&self, index: usize) -> Result<FunctionEntry> {
        if index >= self.count {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(self.entries);
        parser.seek(index * A::FUNCTION_ENTRY_SIZE)?;

        Ok(FunctionEntry {
            index,
            ..A::read_function_entry(&mut parser)?
        })
    }

    /// Iterate over all entries in table order.
    pub fn iter(&self) -> impl Iterator<Item = Result<FunctionEntry>> + '_ {
        (0..self.count).map(move |index| self.entry(index))
    }

    /// Find the entry covering the module-relative `rva`.
    ///
    /// The caller guarantees that `rva` lies in the module's managed code range. Padding
    /// between two functions belongs to the preceding entry unless that entry records its
    /// end address.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidCodeAddress`] if no entry starts at or below `rva`, or
    /// the entry that does ends before it.
    pub fn lookup(&self, rva: u32) -> Result<usize> {
        if self.count == 0 {
            return Err(Error::InvalidCodeAddress(self.image.base() + u64::from(rva)));
        }

        let mut low = 0_usize;
        let mut high = self.count - 1;

        while high - low > LINEAR_SCAN_THRESHOLD {
            let mid = low + (high - low) / 2;
            if rva < self.begin_rva(mid)? {
                high = mid - 1;
            } else {
                low = mid;
            }
        }

        for index in low..high {
            if rva < self.begin_rva(index + 1)? {
                high = index;
                break;
            }
        }

        if rva >= self.begin_rva(high)? {
            match self.entry(high)?.end_rva {
                Some(end) if rva >= end => {}
                _ => return Ok(high),
            }
        }

        Err(Error::InvalidCodeAddress(self.image.base() + u64::from(rva)))
    }

    /// Locate the architecture-specific unwind data of `entry`.
    ///
    /// # Errors
    /// See [`Architecture::unwind_blob`].
    pub fn unwind_blob(&self, entry: &FunctionEntry) -> Result<UnwindBlob> {
        A::unwind_blob(&self.image, entry)
    }

    /// Decode the classification tail of `entry`.
    ///
    /// # Errors
    /// Propagates blob-locator failures and malformed tails.
    pub fn tail(&self, entry: &FunctionEntry) -> Result<UnwindTail<'a>> {
        let blob = self.unwind_blob(entry)?;
        UnwindTail::parse(&self.image, blob.tail_rva()?)
    }

    /// Index of the root method owning entry `index` (the entry itself for roots).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the scan reaches the start of the table
    /// without meeting a root entry.
    pub fn root_of(&self, index: usize) -> Result<usize> {
        let mut current = index;
        loop {
            let entry = self.entry(current)?;
            if !self.tail(&entry)?.is_funclet() {
                return Ok(current);
            }

            if current == 0 {
                return Err(malformed_error!(
                    "Funclet entry {} is not preceded by a root method",
                    index
                ));
            }
            current -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{Amd64, Arm64},
        codeman::tail::FuncKind,
        test::{ImageBuilder, MethodSpec},
    };

    fn contiguous_image(count: u32, size: u32) -> crate::test::BuiltImage {
        let mut builder = ImageBuilder::<Amd64>::new();
        for i in 0..count {
            builder.method(MethodSpec::root(0x1000 + i * size, 0x1000 + (i + 1) * size));
        }
        builder.build()
    }

    #[test]
    fn lookup_small_and_large_tables() {
        for count in [1_u32, 2, 5, 11, 12, 37, 100] {
            let built = contiguous_image(count, 0x40);
            let image = built.image();
            let table = FunctionTable::<Amd64>::new(image).unwrap();
            assert_eq!(table.len(), count as usize);

            for i in 0..count {
                let begin = 0x1000 + i * 0x40;
                assert_eq!(table.lookup(begin).unwrap(), i as usize);
                assert_eq!(table.lookup(begin + 0x3F).unwrap(), i as usize);
                assert_eq!(table.lookup(begin + 0x17).unwrap(), i as usize);
            }
        }
    }

    #[test]
    fn lookup_contains_pc() {
        let built = contiguous_image(64, 0x30);
        let image = built.image();
        let table = FunctionTable::<Amd64>::new(image).unwrap();

        for rva in (0x1000..0x1000 + 64 * 0x30).step_by(7) {
            let entry = table.entry(table.lookup(rva).unwrap()).unwrap();
            assert!(entry.begin_rva <= rva);
            assert!(rva < entry.end_rva.unwrap());
        }
    }

    #[test]
    fn lookup_before_first_entry() {
        let built = contiguous_image(20, 0x40);
        let table = FunctionTable::<Amd64>::new(built.image()).unwrap();
        assert!(matches!(
            table.lookup(0xFFF),
            Err(Error::InvalidCodeAddress(_))
        ));
    }

    #[test]
    fn lookup_padding_between_functions() {
        let mut builder = ImageBuilder::<Amd64>::new();
        builder
            .method(MethodSpec::root(0x1000, 0x1020))
            .method(MethodSpec::root(0x1040, 0x1060));
        let built = builder.build();
        let table = FunctionTable::<Amd64>::new(built.image()).unwrap();

        assert_eq!(table.lookup(0x101F).unwrap(), 0);
        assert!(matches!(
            table.lookup(0x1020),
            Err(Error::InvalidCodeAddress(_))
        ));
        assert!(matches!(
            table.lookup(0x103F),
            Err(Error::InvalidCodeAddress(_))
        ));
        assert_eq!(table.lookup(0x1040).unwrap(), 1);

        // without recorded ends the preceding entry owns the padding
        let mut builder = ImageBuilder::<Arm64>::new();
        builder
            .method(MethodSpec::root(0x1000, 0x1020))
            .method(MethodSpec::root(0x1040, 0x1060));
        let built = builder.build();
        let table = FunctionTable::<Arm64>::new(built.image()).unwrap();
        assert_eq!(table.lookup(0x1030).unwrap(), 0);
    }

    #[test]
    fn lookup_empty_table() {
        let built = ImageBuilder::<Amd64>::new().build();
        let table = FunctionTable::<Amd64>::new(built.image()).unwrap();
        assert!(table.is_empty());
        assert!(matches!(
            table.lookup(0x1000),
            Err(Error::InvalidCodeAddress(_))
        ));
    }

    #[test]
    fn root_of_funclets() {
        let mut builder = ImageBuilder::<Amd64>::new();
        builder
            .method(MethodSpec::root(0x1000, 0x1050))
            .method(MethodSpec::funclet(0x1050, 0x1080, FuncKind::Handler))
            .method(MethodSpec::funclet(0x1080, 0x10A0, FuncKind::Filter))
            .method(MethodSpec::root(0x10A0, 0x1100));
        let built = builder.build();
        let table = FunctionTable::<Amd64>::new(built.image()).unwrap();

        assert_eq!(table.root_of(0).unwrap(), 0);
        assert_eq!(table.root_of(1).unwrap(), 0);
        assert_eq!(table.root_of(2).unwrap(), 0);
        assert_eq!(table.root_of(3).unwrap(), 3);

        for index in 0..table.len() {
            let root = table.root_of(index).unwrap();
            let root_entry = table.entry(root).unwrap();
            assert!(!table.tail(&root_entry).unwrap().is_funclet());
            assert!(root_entry.begin_rva <= table.entry(index).unwrap().begin_rva);
        }
    }

    #[test]
    fn root_of_orphan_funclet() {
        let mut builder = ImageBuilder::<Amd64>::new();
        builder.method(MethodSpec::funclet(0x1000, 0x1020, FuncKind::Handler));
        let built = builder.build();
        let table = FunctionTable::<Amd64>::new(built.image()).unwrap();
        assert!(matches!(table.root_of(0), Err(Error::Malformed { .. })));
    }

    #[test]
    fn arm64_entries_without_end() {
        let mut builder = ImageBuilder::<Arm64>::new();
        builder
            .method(MethodSpec::root(0x1000, 0x1040))
            .method(MethodSpec::root(0x1040, 0x1100));
        let built = builder.build();
        let table = FunctionTable::<Arm64>::new(built.image()).unwrap();

        let entry = table.entry(1).unwrap();
        assert_eq!(entry.begin_rva, 0x1040);
        assert_eq!(entry.end_rva, None);
        assert_eq!(table.lookup(0x1050).unwrap(), 1);
        assert_eq!(
            Arm64::function_end_rva(table.image(), &entry).unwrap(),
            0x1100
        );
    }

    #[test]
    fn table_outside_image() {
        let built = contiguous_image(4, 0x40);
        let image = crate::ModuleRegistration::new(built.base(), built.bytes())
            .managed_code(built.base() + 0x1000, 0x100)
            .function_table(built.bytes().len() as u32 - 8, 4)
            .build()
            .unwrap();
        assert!(matches!(
            FunctionTable::<Amd64>::new(image),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn entry_index_out_of_range() {
        let built = contiguous_image(2, 0x40);
        let table = FunctionTable::<Amd64>::new(built.image()).unwrap();
        assert!(table.entry(1).is_ok());
        assert!(matches!(table.entry(2), Err(Error::OutOfBounds)));
        assert_eq!(table.iter().count(), 2);
    }
}
