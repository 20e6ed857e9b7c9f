//! ARM64 `.xdata` records and their virtual unwinder.
//!
//! # `.xdata` layout
//!
//! ```text
//! word 0: FunctionLength/4 (bits 0-17) | Vers (18-19) | X (20) | E (21)
//!         | EpilogCount (22-26) | CodeWords (27-31)
//! [word 1, only when EpilogCount and CodeWords are both 0:
//!         EpilogCount (bits 0-15) | CodeWords (16-23)]
//! EpilogCount epilog scopes, unless E is set:
//!         StartOffset/4 (bits 0-17) | StartIndex (bits 22-31)
//! CodeWords * 4 bytes of unwind codes
//! [exception handler RVA, if X is set]
//! ```
//!
//! With `E` set the single epilog sits at the end of the function and the epilog-count field
//! holds the index of its first unwind code instead.
//!
//! Unwind codes describe the prolog in reverse order: running them front to back undoes it.
//! Each code except `end`/`end_c` stands for one instruction, which is how a PC inside a
//! prolog or epilog maps to the number of codes to skip.

use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::{
    arch::{
        stack_above, stack_below, tabular_unwind_frame, Architecture, RegisterId, UnwindBlob,
        VirtualContext, VirtualUnwind,
    },
    codeman::{FrameContext, FunctionEntry, GcInfoDecoder, RegDisplay, UnwindFlags},
    file::memory::MemoryReader,
    image::ModuleImage,
    Error, Parser, Result,
};

/// Windows on ARM64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Arm64;

/// ARM64 general-purpose registers, numbered as in unwind codes and GC info.
#[allow(missing_docs)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, EnumIter, EnumCount,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Arm64Register {
    X0 = 0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    Fp = 29,
    Lr = 30,
}

impl RegisterId for Arm64Register {
    fn index(self) -> usize {
        self as usize
    }

    fn from_number(number: u32) -> Option<Self> {
        u8::try_from(number).ok().and_then(Self::from_repr)
    }

    fn name(self) -> &'static str {
        self.into()
    }
}

/// First register number covered by the integer save codes.
const FIRST_SAVED_REGISTER: u8 = 19;

/// Vector register number of D8.
const FIRST_SAVED_FLOAT_REGISTER: usize = 8;

/// Decoded `.xdata` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct XdataHeader {
    function_length: u32,
    has_exception_data: bool,
    single_epilog: bool,
    epilog_count: u32,
    code_words: u32,
    header_size: u32,
}

impl XdataHeader {
    fn read(parser: &mut Parser<'_>) -> Result<Self> {
        let word = parser.read_le::<u32>()?;
        let mut header = XdataHeader {
            function_length: (word & 0x3FFFF) * 4,
            has_exception_data: word & (1 << 20) != 0,
            single_epilog: word & (1 << 21) != 0,
            epilog_count: (word >> 22) & 0x1F,
            code_words: word >> 27,
            header_size: 4,
        };

        if header.epilog_count == 0 && header.code_words == 0 {
            let extended = parser.read_le::<u32>()?;
            header.epilog_count = extended & 0xFFFF;
            header.code_words = (extended >> 16) & 0xFF;
            header.header_size += 4;
        }

        Ok(header)
    }

    fn parse(image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<Self> {
        if entry.unwind_data & 0x3 != 0 {
            return Err(Error::NotSupported("packed ARM64 unwind data"));
        }
        let mut parser = image.parser_at(entry.unwind_data)?;
        Self::read(&mut parser)
    }

    fn scope_count(&self) -> u32 {
        if self.single_epilog {
            0
        } else {
            self.epilog_count
        }
    }

    fn size(&self) -> u32 {
        let mut size = self.header_size + 4 * self.scope_count() + 4 * self.code_words;
        if self.has_exception_data {
            size += 4;
        }
        size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnwindCode {
    AllocS(u8),
    SaveR19R20X(u8),
    SaveFpLr(u8),
    SaveFpLrX(u8),
    AllocM(u16),
    SaveRegP(u8, u8),
    SaveRegPX(u8, u8),
    SaveReg(u8, u8),
    SaveRegX(u8, u8),
    SaveLrPair(u8, u8),
    SaveFRegP(u8, u8),
    SaveFRegPX(u8, u8),
    SaveFReg(u8, u8),
    SaveFRegX(u8, u8),
    AllocL(u32),
    SetFp,
    AddFp(u8),
    Nop,
    End,
    EndC,
    SaveNext,
    PacSignLr,
}

impl UnwindCode {
    /// Decode the code at the start of `bytes`, returning it with its encoded length.
    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let operand = |index: usize| {
            bytes
                .get(index)
                .copied()
                .ok_or_else(|| malformed_error!("Truncated ARM64 unwind code"))
        };

        let b0 = operand(0)?;
        let code = match b0 {
            0x00..=0x1F => (UnwindCode::AllocS(b0), 1),
            0x20..=0x3F => (UnwindCode::SaveR19R20X(b0 & 0x1F), 1),
            0x40..=0x7F => (UnwindCode::SaveFpLr(b0 & 0x3F), 1),
            0x80..=0xBF => (UnwindCode::SaveFpLrX(b0 & 0x3F), 1),
            0xC0..=0xC7 => {
                let b1 = operand(1)?;
                (UnwindCode::AllocM((u16::from(b0 & 0x7) << 8) | u16::from(b1)), 2)
            }
            0xC8..=0xD3 => {
                let b1 = operand(1)?;
                let x = ((b0 & 0x3) << 2) | (b1 >> 6);
                let z = b1 & 0x3F;
                let code = match b0 & 0xFC {
                    0xC8 => UnwindCode::SaveRegP(x, z),
                    0xCC => UnwindCode::SaveRegPX(x, z),
                    _ => UnwindCode::SaveReg(x, z),
                };
                (code, 2)
            }
            0xD4..=0xD5 => {
                let b1 = operand(1)?;
                (UnwindCode::SaveRegX(((b0 & 0x1) << 3) | (b1 >> 5), b1 & 0x1F), 2)
            }
            0xD6..=0xDD => {
                let b1 = operand(1)?;
                let x = ((b0 & 0x1) << 2) | (b1 >> 6);
                let z = b1 & 0x3F;
                let code = match b0 & 0xFE {
                    0xD6 => UnwindCode::SaveLrPair(x, z),
                    0xD8 => UnwindCode::SaveFRegP(x, z),
                    0xDA => UnwindCode::SaveFRegPX(x, z),
                    _ => UnwindCode::SaveFReg(x, z),
                };
                (code, 2)
            }
            0xDE => {
                let b1 = operand(1)?;
                (UnwindCode::SaveFRegX(b1 >> 5, b1 & 0x1F), 2)
            }
            0xE0 => {
                let size = u32::from(operand(1)?) << 16
                    | u32::from(operand(2)?) << 8
                    | u32::from(operand(3)?);
                (UnwindCode::AllocL(size), 4)
            }
            0xE1 => (UnwindCode::SetFp, 1),
            0xE2 => (UnwindCode::AddFp(operand(1)?), 2),
            0xE3 => (UnwindCode::Nop, 1),
            0xE4 => (UnwindCode::End, 1),
            0xE5 => (UnwindCode::EndC, 1),
            0xE6 => (UnwindCode::SaveNext, 1),
            0xFC => (UnwindCode::PacSignLr, 1),
            0xDF | 0xE7..=0xEF => {
                return Err(Error::NotSupported("ARM64 custom stack or SVE unwind codes"))
            }
            _ => return Err(malformed_error!("Reserved ARM64 unwind code {:#x}", b0)),
        };

        Ok(code)
    }

    fn is_end(self) -> bool {
        matches!(self, UnwindCode::End | UnwindCode::EndC)
    }
}

/// Number of instructions described by the codes starting at `index`, up to the next end.
fn sequence_length(codes: &[u8], mut index: usize) -> Result<u32> {
    let mut length = 0;
    while index < codes.len() {
        let (code, size) = UnwindCode::decode(&codes[index..])?;
        if code.is_end() {
            break;
        }
        length += 1;
        index += size;
    }
    Ok(length)
}

fn integer_register(number: u8) -> Result<Arm64Register> {
    Arm64Register::from_repr(number)
        .filter(|reg| *reg != Arm64Register::Lr)
        .ok_or_else(|| malformed_error!("Invalid ARM64 saved register x{}", number))
}

/// Applies decoded codes to a [`VirtualContext`].
struct CodeInterpreter<'c, 'm, M: MemoryReader + ?Sized> {
    context: &'c mut VirtualContext<Arm64>,
    memory: &'m M,
    pair_length: u8,
}

impl<M: MemoryReader + ?Sized> CodeInterpreter<'_, '_, M> {
    /// Restore `count` consecutive integer registers from `[sp + offset]`, then pop
    /// `writeback` bytes.
    fn restore_integers(&mut self, first: u8, count: u8, offset: u64, writeback: u64) -> Result<()> {
        for i in 0..count {
            let reg = integer_register(first.saturating_add(i))?;
            let address = stack_above(self.context.sp, offset + 8 * u64::from(i))?;
            self.context.restore(reg, address, self.memory)?;
        }
        self.context.sp = stack_above(self.context.sp, writeback)?;
        Ok(())
    }

    fn restore_floats(&mut self, first: u8, count: u8, offset: u64, writeback: u64) -> Result<()> {
        for i in 0..count {
            let index = FIRST_SAVED_FLOAT_REGISTER + usize::from(first) + usize::from(i);
            if index >= FIRST_SAVED_FLOAT_REGISTER + Arm64::PRESERVED_FLOAT_REGISTERS {
                return Err(malformed_error!("Invalid ARM64 saved register d{}", index));
            }
            let address = stack_above(self.context.sp, offset + 8 * u64::from(i))?;
            let value = self.memory.read_u64(address)?;
            self.context.set_vector(index, u128::from(value));
        }
        self.context.sp = stack_above(self.context.sp, writeback)?;
        Ok(())
    }

    fn pop(&mut self, bytes: u64) -> Result<()> {
        self.context.sp = stack_above(self.context.sp, bytes)?;
        Ok(())
    }

    fn take_pair_length(&mut self) -> u8 {
        std::mem::replace(&mut self.pair_length, 2)
    }

    fn apply(&mut self, code: UnwindCode) -> Result<()> {
        match code {
            UnwindCode::AllocS(x) => self.pop(u64::from(x) * 16)?,
            UnwindCode::AllocM(x) => self.pop(u64::from(x) * 16)?,
            UnwindCode::AllocL(x) => self.pop(u64::from(x) * 16)?,
            UnwindCode::SaveR19R20X(z) => {
                let count = self.take_pair_length();
                self.restore_integers(FIRST_SAVED_REGISTER, count, 0, u64::from(z) * 8)?;
            }
            UnwindCode::SaveFpLr(z) => {
                let address = stack_above(self.context.sp, u64::from(z) * 8)?;
                self.context.restore(Arm64Register::Fp, address, self.memory)?;
                self.context.restore(Arm64Register::Lr, stack_above(address, 8)?, self.memory)?;
            }
            UnwindCode::SaveFpLrX(z) => {
                let sp = self.context.sp;
                self.context.restore(Arm64Register::Fp, sp, self.memory)?;
                self.context.restore(Arm64Register::Lr, stack_above(sp, 8)?, self.memory)?;
                self.pop((u64::from(z) + 1) * 8)?;
            }
            UnwindCode::SaveRegP(x, z) => {
                let count = self.take_pair_length();
                self.restore_integers(FIRST_SAVED_REGISTER + x, count, u64::from(z) * 8, 0)?;
            }
            UnwindCode::SaveRegPX(x, z) => {
                let count = self.take_pair_length();
                self.restore_integers(FIRST_SAVED_REGISTER + x, count, 0, (u64::from(z) + 1) * 8)?;
            }
            UnwindCode::SaveReg(x, z) => {
                self.restore_integers(FIRST_SAVED_REGISTER + x, 1, u64::from(z) * 8, 0)?;
            }
            UnwindCode::SaveRegX(x, z) => {
                self.restore_integers(FIRST_SAVED_REGISTER + x, 1, 0, (u64::from(z) + 1) * 8)?;
            }
            UnwindCode::SaveLrPair(x, z) => {
                let address = stack_above(self.context.sp, u64::from(z) * 8)?;
                let reg = integer_register(FIRST_SAVED_REGISTER + 2 * x)?;
                self.context.restore(reg, address, self.memory)?;
                self.context.restore(Arm64Register::Lr, stack_above(address, 8)?, self.memory)?;
            }
            UnwindCode::SaveFRegP(x, z) => {
                let count = self.take_pair_length();
                self.restore_floats(x, count, u64::from(z) * 8, 0)?;
            }
            UnwindCode::SaveFRegPX(x, z) => {
                let count = self.take_pair_length();
                self.restore_floats(x, count, 0, (u64::from(z) + 1) * 8)?;
            }
            UnwindCode::SaveFReg(x, z) => self.restore_floats(x, 1, u64::from(z) * 8, 0)?,
            UnwindCode::SaveFRegX(x, z) => {
                self.restore_floats(x, 1, 0, (u64::from(z) + 1) * 8)?;
            }
            UnwindCode::SetFp => self.context.sp = self.context.value(Arm64Register::Fp),
            UnwindCode::AddFp(x) => {
                self.context.sp = stack_below(self.context.value(Arm64Register::Fp), u64::from(x) * 8)?;
            }
            UnwindCode::SaveNext => self.pair_length = self.pair_length.saturating_add(2),
            UnwindCode::Nop | UnwindCode::PacSignLr | UnwindCode::End | UnwindCode::EndC => {}
        }
        Ok(())
    }
}

impl Architecture for Arm64 {
    type Register = Arm64Register;

    const NAME: &'static str = "arm64";
    const POINTER_SIZE: u64 = 8;
    const FUNCTION_ENTRY_SIZE: usize = 8;
    const FRAME_POINTER: Arm64Register = Arm64Register::Fp;
    const NONVOLATILE: &'static [Arm64Register] = &[
        Arm64Register::X19,
        Arm64Register::X20,
        Arm64Register::X21,
        Arm64Register::X22,
        Arm64Register::X23,
        Arm64Register::X24,
        Arm64Register::X25,
        Arm64Register::X26,
        Arm64Register::X27,
        Arm64Register::X28,
        Arm64Register::Fp,
        Arm64Register::Lr,
    ];
    const PRESERVED_FLOAT_REGISTERS: usize = 8;
    const FIRST_PRESERVED_FLOAT_REGISTER: usize = FIRST_SAVED_FLOAT_REGISTER;

    fn read_function_entry(parser: &mut Parser<'_>) -> Result<FunctionEntry> {
        Ok(FunctionEntry {
            index: 0,
            begin_rva: parser.read_le::<u32>()?,
            end_rva: None,
            unwind_data: parser.read_le::<u32>()?,
        })
    }

    fn unwind_blob(image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<UnwindBlob> {
        let header = XdataHeader::parse(image, entry)?;
        Ok(UnwindBlob {
            rva: entry.unwind_data,
            size: header.size(),
        })
    }

    fn function_end_rva(image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<u32> {
        let header = XdataHeader::parse(image, entry)?;
        entry
            .begin_rva
            .checked_add(header.function_length)
            .ok_or(out_of_bounds_error!())
    }

    fn unwind_frame<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        flags: UnwindFlags,
        regs: &mut RegDisplay<Self>,
        memory: &M,
    ) -> Result<()>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized,
    {
        tabular_unwind_frame(frame.image(), frame.entry(), flags, regs, memory)
    }

    fn outgoing_args_upper_bound<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        regs: &RegDisplay<Self>,
        memory: &M,
    ) -> Result<u64>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized,
    {
        let mut context = VirtualContext::from_frame(regs, memory)?;
        Self::virtual_unwind(frame.image(), frame.entry(), &mut context, memory)?;
        Ok(context.sp)
    }

    fn hijack_location<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        regs: &RegDisplay<Self>,
        memory: &M,
    ) -> Result<Option<u64>>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized,
    {
        if frame.decoder().has_tail_calls(frame.gc_info()) {
            return Ok(None);
        }

        let Some(lr_location) = regs.location(Arm64Register::Lr) else {
            return Err(Error::RegisterUnavailable(Arm64Register::Lr.name()));
        };

        let mut context = VirtualContext::from_frame(regs, memory)?;
        context.restore(Arm64Register::Lr, lr_location, memory)?;
        Self::virtual_unwind(frame.image(), frame.entry(), &mut context, memory)?;

        // LR still in the register it arrived in: the method never spilled it
        match context.location(Arm64Register::Lr) {
            Some(location) if location != lr_location => Ok(Some(location)),
            _ => Ok(None),
        }
    }
}

impl VirtualUnwind for Arm64 {
    fn virtual_unwind<M>(
        image: &ModuleImage<'_>,
        entry: &FunctionEntry,
        context: &mut VirtualContext<Self>,
        memory: &M,
    ) -> Result<()>
    where
        M: MemoryReader + ?Sized,
    {
        if entry.unwind_data & 0x3 != 0 {
            return Err(Error::NotSupported("packed ARM64 unwind data"));
        }
        let mut parser = image.parser_at(entry.unwind_data)?;
        let header = XdataHeader::read(&mut parser)?;

        let scopes = parser.read_bytes(header.scope_count() as usize * 4)?;
        let codes = parser.read_bytes(header.code_words as usize * 4)?;

        let start = image.base() + u64::from(entry.begin_rva);
        let offset = context
            .pc
            .checked_sub(start)
            .map(|bytes| bytes / 4)
            .and_then(|words| u32::try_from(words).ok())
            .ok_or(Error::InvalidCodeAddress(context.pc))?;

        // (first code, instructions already undone)
        let prolog_length = sequence_length(codes, 0)?;
        let (first_code, skip) = if offset < prolog_length {
            (0, prolog_length - offset)
        } else if header.single_epilog {
            let index = header.epilog_count as usize;
            // the epilog's codes plus its ret
            let length = sequence_length(codes, index)? + 1;
            let epilog_start = (header.function_length / 4).saturating_sub(length);
            if offset >= epilog_start {
                (index, offset - epilog_start)
            } else {
                (0, 0)
            }
        } else {
            let mut found = (0, 0);
            for scope in scopes.chunks_exact(4) {
                let scope = u32::from_le_bytes([scope[0], scope[1], scope[2], scope[3]]);
                let (epilog_start, index) = (scope & 0x3FFFF, (scope >> 22) as usize);
                let length = sequence_length(codes, index)? + 1;
                if offset >= epilog_start && offset - epilog_start < length {
                    found = (index, offset - epilog_start);
                    break;
                }
            }
            found
        };

        let mut interpreter = CodeInterpreter {
            context: &mut *context,
            memory,
            pair_length: 2,
        };
        let mut index = first_code;
        let mut skip = skip;
        while index < codes.len() {
            let (code, size) = UnwindCode::decode(&codes[index..])?;
            index += size;
            if code.is_end() {
                break;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            interpreter.apply(code)?;
        }

        context.pc = context.value(Arm64Register::Lr);
        context.return_address_location = context.location(Arm64Register::Lr);
        Ok(())
    }
}
