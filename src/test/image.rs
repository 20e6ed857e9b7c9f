//! Synthetic module images.
//!
//! [`ImageBuilder`] lays out a mapped image the way the compiler would: code at
//! [`CODE_RVA`] (filled with `int3`), the function table after it, then per entry the EH
//! table, associated data, the unwind blob and its classification tail. Root entries carry a
//! one-byte GC info tag for [`crate::test::MockGcDecoder`].

use std::marker::PhantomData;

use crate::{
    arch::{Amd64, Architecture, Arm64, X86},
    codeman::{FuncKind, UnwindBlockFlags},
    image::ModuleImage,
    ModuleRegistration,
};

/// RVA of the first byte of managed code.
pub const CODE_RVA: u32 = 0x1000;

/// Test-image conventions per architecture.
pub trait TestArch: Architecture {
    /// Load address of built images.
    const TEST_BASE: u64;

    /// Encode one function-table entry into `out`.
    fn write_entry(out: &mut [u8], begin: u32, end: u32, unwind: u32);

    /// Unwind data for a frameless function of `length` bytes.
    fn default_unwind(length: u32) -> Vec<u8>;
}

fn write_triple(out: &mut [u8], begin: u32, end: u32, unwind: u32) {
    out[0..4].copy_from_slice(&begin.to_le_bytes());
    out[4..8].copy_from_slice(&end.to_le_bytes());
    out[8..12].copy_from_slice(&unwind.to_le_bytes());
}

impl TestArch for Amd64 {
    const TEST_BASE: u64 = 0x1_4000_0000;

    fn write_entry(out: &mut [u8], begin: u32, end: u32, unwind: u32) {
        write_triple(out, begin, end, unwind);
    }

    fn default_unwind(_length: u32) -> Vec<u8> {
        // version 1, no codes
        vec![1, 0, 0, 0]
    }
}

impl TestArch for Arm64 {
    const TEST_BASE: u64 = 0x1_4000_0000;

    fn write_entry(out: &mut [u8], begin: u32, _end: u32, unwind: u32) {
        out[0..4].copy_from_slice(&begin.to_le_bytes());
        out[4..8].copy_from_slice(&unwind.to_le_bytes());
    }

    fn default_unwind(length: u32) -> Vec<u8> {
        // E bit, epilog at code 0, one code word: end, nop, nop, nop
        let header = length / 4 | (1 << 21) | (1 << 27);
        let mut bytes = header.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xE4, 0xE3, 0xE3, 0xE3]);
        bytes
    }
}

impl TestArch for X86 {
    const TEST_BASE: u64 = 0x40_0000;

    fn write_entry(out: &mut [u8], begin: u32, end: u32, unwind: u32) {
        write_triple(out, begin, end, unwind);
    }

    fn default_unwind(length: u32) -> Vec<u8> {
        length.to_le_bytes().to_vec()
    }
}

/// One function-table entry to lay out.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    begin: u32,
    end: u32,
    kind: FuncKind,
    eh: Option<Vec<u8>>,
    associated_data: Option<Vec<u8>>,
    unwind: Option<Vec<u8>>,
    unwind_rva: Option<u32>,
    gc_info: Vec<u8>,
    code: Vec<(u32, Vec<u8>)>,
    reverse_pinvoke: bool,
}

impl MethodSpec {
    pub fn root(begin: u32, end: u32) -> Self {
        MethodSpec {
            begin,
            end,
            kind: FuncKind::Root,
            eh: None,
            associated_data: None,
            unwind: None,
            unwind_rva: None,
            gc_info: vec![0],
            code: Vec::new(),
            reverse_pinvoke: false,
        }
    }

    pub fn funclet(begin: u32, end: u32, kind: FuncKind) -> Self {
        MethodSpec {
            kind,
            gc_info: Vec::new(),
            ..MethodSpec::root(begin, end)
        }
    }

    pub fn with_eh(mut self, table: Vec<u8>) -> Self {
        self.eh = Some(table);
        self
    }

    pub fn with_associated_data(mut self, data: &[u8]) -> Self {
        self.associated_data = Some(data.to_vec());
        self
    }

    /// Replace the default unwind data; the tail follows `unwind` directly.
    pub fn with_unwind(mut self, unwind: Vec<u8>) -> Self {
        self.unwind = Some(unwind);
        self
    }

    /// Point the entry at a raw unwind RVA; nothing is written for it.
    pub fn with_unwind_rva(mut self, rva: u32) -> Self {
        self.unwind_rva = Some(rva);
        self
    }

    pub fn with_gc_info(mut self, gc_info: &[u8]) -> Self {
        self.gc_info = gc_info.to_vec();
        self
    }

    pub fn with_gc_tag(self, tag: u8) -> Self {
        self.with_gc_info(&[tag])
    }

    /// Place `bytes` at `offset` from the entry start.
    pub fn with_code(mut self, offset: u32, bytes: &[u8]) -> Self {
        self.code.push((offset, bytes.to_vec()));
        self
    }

    pub fn reverse_pinvoke(mut self) -> Self {
        self.reverse_pinvoke = true;
        self
    }

    fn tail_flags(&self) -> UnwindBlockFlags {
        let mut flags = UnwindBlockFlags::from_bits_retain(match self.kind {
            FuncKind::Root => 0,
            FuncKind::Handler => 1,
            FuncKind::Filter => 2,
        });
        flags.set(UnwindBlockFlags::HAS_EHINFO, self.eh.is_some());
        flags.set(UnwindBlockFlags::REVERSE_PINVOKE, self.reverse_pinvoke);
        flags.set(
            UnwindBlockFlags::HAS_ASSOCIATED_DATA,
            self.associated_data.is_some(),
        );
        flags
    }
}

#[derive(Debug)]
pub struct ImageBuilder<A: TestArch = Amd64> {
    methods: Vec<MethodSpec>,
    classlib: Vec<u64>,
    _arch: PhantomData<A>,
}

impl<A: TestArch> ImageBuilder<A> {
    pub fn new() -> Self {
        ImageBuilder {
            methods: Vec::new(),
            classlib: Vec::new(),
            _arch: PhantomData,
        }
    }

    /// Add an entry; entries keep the order they are added in.
    pub fn method(&mut self, spec: MethodSpec) -> &mut Self {
        self.methods.push(spec);
        self
    }

    pub fn classlib(&mut self, functions: &[u64]) -> &mut Self {
        self.classlib = functions.to_vec();
        self
    }

    pub fn build(&self) -> BuiltImage<A> {
        let code_end = self
            .methods
            .iter()
            .map(|method| method.end)
            .max()
            .unwrap_or(CODE_RVA + 0x10)
            .max(CODE_RVA + 0x10);

        let mut bytes = vec![0_u8; code_end as usize];
        bytes[CODE_RVA as usize..].fill(0xCC);
        for method in &self.methods {
            for (offset, code) in &method.code {
                let start = (method.begin + offset) as usize;
                bytes[start..start + code.len()].copy_from_slice(code);
            }
        }

        align(&mut bytes, 16);
        let table_rva = bytes.len() as u32;
        bytes.resize(bytes.len() + self.methods.len() * A::FUNCTION_ENTRY_SIZE, 0);

        let mut layouts = Vec::with_capacity(self.methods.len());
        for (index, method) in self.methods.iter().enumerate() {
            let eh_rva = method.eh.as_ref().map(|table| append(&mut bytes, table));
            let associated_data_rva = method
                .associated_data
                .as_ref()
                .map(|data| append(&mut bytes, data));

            let unwind_rva = match method.unwind_rva {
                Some(rva) => rva,
                None => {
                    let blob = method
                        .unwind
                        .clone()
                        .unwrap_or_else(|| A::default_unwind(method.end - method.begin));
                    let rva = append(&mut bytes, &blob);

                    bytes.push(method.tail_flags().bits());
                    if let Some(rva) = associated_data_rva {
                        bytes.extend_from_slice(&rva.to_le_bytes());
                    }
                    if let Some(rva) = eh_rva {
                        bytes.extend_from_slice(&rva.to_le_bytes());
                    }
                    bytes.extend_from_slice(&method.gc_info);
                    rva
                }
            };

            let entry = table_rva as usize + index * A::FUNCTION_ENTRY_SIZE;
            A::write_entry(
                &mut bytes[entry..entry + A::FUNCTION_ENTRY_SIZE],
                method.begin,
                method.end,
                unwind_rva,
            );

            layouts.push(EntryLayout {
                unwind_rva,
                eh_rva,
                associated_data_rva,
            });
        }

        bytes.resize(bytes.len() + 64, 0);

        BuiltImage {
            bytes,
            code_end,
            table_rva,
            layouts,
            classlib: self.classlib.clone(),
            _arch: PhantomData,
        }
    }
}

fn align(bytes: &mut Vec<u8>, alignment: usize) {
    bytes.resize(bytes.len().next_multiple_of(alignment), 0);
}

/// Append `data` at the next 4-byte boundary and return its RVA.
fn append(bytes: &mut Vec<u8>, data: &[u8]) -> u32 {
    align(bytes, 4);
    let rva = bytes.len() as u32;
    bytes.extend_from_slice(data);
    rva
}

#[derive(Debug, Clone, Copy)]
struct EntryLayout {
    unwind_rva: u32,
    eh_rva: Option<u32>,
    associated_data_rva: Option<u32>,
}

/// A laid-out image; borrow it as a [`ModuleImage`] with [`BuiltImage::image`].
#[derive(Debug)]
pub struct BuiltImage<A: TestArch = Amd64> {
    bytes: Vec<u8>,
    code_end: u32,
    table_rva: u32,
    layouts: Vec<EntryLayout>,
    classlib: Vec<u64>,
    _arch: PhantomData<A>,
}

impl<A: TestArch> BuiltImage<A> {
    pub fn image(&self) -> ModuleImage<'_> {
        ModuleRegistration::new(A::TEST_BASE, &self.bytes)
            .managed_code(
                A::TEST_BASE + u64::from(CODE_RVA),
                u64::from(self.code_end - CODE_RVA),
            )
            .function_table(self.table_rva, self.layouts.len() as u32)
            .classlib_functions(&self.classlib)
            .build()
            .unwrap()
    }

    pub fn base(&self) -> u64 {
        A::TEST_BASE
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Absolute address of `rva`.
    pub fn address(&self, rva: u32) -> u64 {
        A::TEST_BASE + u64::from(rva)
    }

    pub fn unwind_rva(&self, index: usize) -> u32 {
        self.layouts[index].unwind_rva
    }

    pub fn eh_rva(&self, index: usize) -> Option<u32> {
        self.layouts[index].eh_rva
    }

    pub fn associated_data_rva(&self, index: usize) -> Option<u32> {
        self.layouts[index].associated_data_rva
    }
}
