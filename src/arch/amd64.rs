//! Windows x64 unwind data and its virtual unwinder.
//!
//! # `UNWIND_INFO` layout
//!
//! ```text
//! byte 0: Version (bits 0-2) | Flags (bits 3-7)
//! byte 1: SizeOfProlog
//! byte 2: CountOfUnwindCodes
//! byte 3: FrameRegister (bits 0-3) | FrameOffset (bits 4-7, scaled by 16)
//! CountOfUnwindCodes * u16 unwind code slots
//! [u32 personality routine RVA, 4-byte aligned, if EHANDLER | UHANDLER]
//! ```
//!
//! Each unwind code slot is `CodeOffset: u8, UnwindOp: 4 bits, OpInfo: 4 bits`; some
//! operations take one or two further slots as operands. Codes are stored in reverse prolog
//! order, so applying them front to back undoes the prolog.

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

/// Windows x64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Amd64;

/// AMD64 general-purpose registers, numbered as in unwind codes and GC info.
#[allow(missing_docs)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, EnumIter, EnumCount,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Amd64Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl RegisterId for Amd64Register {
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

const UNW_FLAG_EHANDLER: u8 = 0x1;
const UNW_FLAG_UHANDLER: u8 = 0x2;
const UNW_FLAG_CHAININFO: u8 = 0x4;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_EPILOG: u8 = 6;
const UWOP_SPARE_CODE: u8 = 7;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

/// Decoded `UNWIND_INFO` header plus its code slots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnwindInfo<'a> {
    flags: u8,
    size_of_prolog: u8,
    frame_register: u8,
    frame_offset: u8,
    codes: &'a [u8],
}

impl<'a> UnwindInfo<'a> {
    fn parse(image: &ModuleImage<'a>, rva: u32) -> Result<Self> {
        let mut parser = image.parser_at(rva)?;
        Self::read(&mut parser)
    }

    fn read(parser: &mut Parser<'a>) -> Result<Self> {
        let version_and_flags = parser.read_le::<u8>()?;
        let version = version_and_flags & 0x7;
        if version != 1 && version != 2 {
            return Err(malformed_error!("Unknown UNWIND_INFO version {}", version));
        }

        let size_of_prolog = parser.read_le::<u8>()?;
        let count = parser.read_le::<u8>()?;
        let frame = parser.read_le::<u8>()?;
        let codes = parser.read_bytes(usize::from(count) * 2)?;

        Ok(UnwindInfo {
            flags: version_and_flags >> 3,
            size_of_prolog,
            frame_register: frame & 0xF,
            frame_offset: frame >> 4,
            codes,
        })
    }

    fn count(&self) -> usize {
        self.codes.len() / 2
    }

    fn code(&self, index: usize) -> (u8, u8, u8) {
        let code_offset = self.codes[index * 2];
        let op = self.codes[index * 2 + 1];
        (code_offset, op & 0xF, op >> 4)
    }

    fn slot_u16(&self, index: usize) -> Result<u16> {
        let bytes = self
            .codes
            .get(index * 2..index * 2 + 2)
            .ok_or_else(|| malformed_error!("Unwind code operand {} past the end", index))?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn slot_u32(&self, index: usize) -> Result<u32> {
        let low = u32::from(self.slot_u16(index)?);
        let high = u32::from(self.slot_u16(index + 1)?);
        Ok(low | (high << 16))
    }

    /// The raw 4-bit `FrameOffset` field.
    pub(crate) fn frame_offset(&self) -> u8 {
        self.frame_offset
    }

    /// Returns `true` if the `SET_FPREG` code has executed at `prolog_offset`.
    fn frame_register_established(&self, prolog_offset: u64) -> Result<bool> {
        let mut index = 0;
        while index < self.count() {
            let (code_offset, op, info) = self.code(index);
            if op == UWOP_SET_FPREG {
                return Ok(prolog_offset >= u64::from(code_offset));
            }
            index += slot_count(op, info)?;
        }
        Ok(false)
    }
}

fn slot_count(op: u8, info: u8) -> Result<usize> {
    Ok(match op {
        UWOP_PUSH_NONVOL | UWOP_ALLOC_SMALL | UWOP_SET_FPREG | UWOP_PUSH_MACHFRAME => 1,
        UWOP_ALLOC_LARGE if info == 0 => 2,
        UWOP_ALLOC_LARGE => 3,
        UWOP_SAVE_NONVOL | UWOP_EPILOG | UWOP_SAVE_XMM128 => 2,
        UWOP_SAVE_NONVOL_FAR | UWOP_SPARE_CODE | UWOP_SAVE_XMM128_FAR => 3,
        _ => return Err(malformed_error!("Unknown AMD64 unwind operation {}", op)),
    })
}

fn register(number: u8) -> Result<Amd64Register> {
    Amd64Register::from_repr(number)
        .ok_or_else(|| malformed_error!("Invalid AMD64 register number {}", number))
}

fn register_value(context: &VirtualContext<Amd64>, reg: Amd64Register) -> u64 {
    if reg == Amd64Register::Rsp {
        context.sp
    } else {
        context.value(reg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpilogInstruction {
    AddRsp(i64),
    LeaRsp { base: Amd64Register, displacement: i64 },
    Pop(Amd64Register),
    Ret,
}

#[allow(clippy::cast_possible_wrap)]
fn decode_epilog_instruction(code: &[u8]) -> Option<(EpilogInstruction, usize)> {
    match *code {
        [0x48, 0x83, 0xC4, imm, ..] => Some((EpilogInstruction::AddRsp(i64::from(imm as i8)), 4)),
        [0x48, 0x81, 0xC4, b0, b1, b2, b3, ..] => Some((
            EpilogInstruction::AddRsp(i64::from(i32::from_le_bytes([b0, b1, b2, b3]))),
            7,
        )),
        [rex @ (0x48 | 0x49), 0x8D, modrm, ref rest @ ..]
            if modrm & 0x38 == 0x20 && modrm & 0x7 != 0x4 =>
        {
            let base = Amd64Register::from_repr((modrm & 0x7) | ((rex & 0x1) << 3))?;
            match (modrm >> 6, rest) {
                (1, [disp, ..]) => Some((
                    EpilogInstruction::LeaRsp {
                        base,
                        displacement: i64::from(*disp as i8),
                    },
                    4,
                )),
                (2, [b0, b1, b2, b3, ..]) => Some((
                    EpilogInstruction::LeaRsp {
                        base,
                        displacement: i64::from(i32::from_le_bytes([*b0, *b1, *b2, *b3])),
                    },
                    7,
                )),
                _ => None,
            }
        }
        [op @ 0x58..=0x5F, ..] => Some((EpilogInstruction::Pop(Amd64Register::from_repr(op - 0x58)?), 1)),
        [0x41, op @ 0x58..=0x5F, ..] => Some((
            EpilogInstruction::Pop(Amd64Register::from_repr(op - 0x58 + 8)?),
            2,
        )),
        [0xC3, ..] => Some((EpilogInstruction::Ret, 1)),
        [0xF3, 0xC3, ..] => Some((EpilogInstruction::Ret, 2)),
        _ => None,
    }
}

/// Returns `true` if `code` continues with the canonical epilog shape: at most one stack
/// adjustment, any number of pops, then `ret`.
fn is_epilog(code: &[u8]) -> bool {
    let mut position = 0;
    let mut first = true;

    while let Some((instruction, len)) = decode_epilog_instruction(&code[position..]) {
        match instruction {
            EpilogInstruction::AddRsp(_) | EpilogInstruction::LeaRsp { .. } if !first => {
                return false
            }
            EpilogInstruction::Ret => return true,
            _ => {}
        }
        first = false;
        position += len;
    }

    false
}

fn emulate_epilog<M>(code: &[u8], context: &mut VirtualContext<Amd64>, memory: &M) -> Result<()>
where
    M: MemoryReader + ?Sized,
{
    let mut position = 0;

    while let Some((instruction, len)) = decode_epilog_instruction(&code[position..]) {
        match instruction {
            EpilogInstruction::AddRsp(amount) => {
                context.sp = context.sp.wrapping_add_signed(amount);
            }
            EpilogInstruction::LeaRsp { base, displacement } => {
                context.sp = register_value(context, base).wrapping_add_signed(displacement);
            }
            EpilogInstruction::Pop(reg) => {
                context.restore(reg, context.sp, memory)?;
                context.sp = stack_above(context.sp, 8)?;
            }
            EpilogInstruction::Ret => {
                pop_return_address(context, memory)?;
                return Ok(());
            }
        }
        position += len;
    }

    Err(malformed_error!("Epilog emulation ran off the epilog"))
}

fn pop_return_address<M>(context: &mut VirtualContext<Amd64>, memory: &M) -> Result<()>
where
    M: MemoryReader + ?Sized,
{
    context.return_address_location = Some(context.sp);
    context.pc = memory.read_u64(context.sp)?;
    context.sp = stack_above(context.sp, 8)?;
    Ok(())
}

impl Architecture for Amd64 {
    type Register = Amd64Register;

    const NAME: &'static str = "amd64";
    const POINTER_SIZE: u64 = 8;
    const FUNCTION_ENTRY_SIZE: usize = 12;
    const FRAME_POINTER: Amd64Register = Amd64Register::Rbp;
    const NONVOLATILE: &'static [Amd64Register] = &[
        Amd64Register::Rbx,
        Amd64Register::Rbp,
        Amd64Register::Rsi,
        Amd64Register::Rdi,
        Amd64Register::R12,
        Amd64Register::R13,
        Amd64Register::R14,
        Amd64Register::R15,
    ];
    const PRESERVED_FLOAT_REGISTERS: usize = 10;
    const FIRST_PRESERVED_FLOAT_REGISTER: usize = 6;

    fn read_function_entry(parser: &mut Parser<'_>) -> Result<FunctionEntry> {
        Ok(FunctionEntry {
            index: 0,
            begin_rva: parser.read_le::<u32>()?,
            end_rva: Some(parser.read_le::<u32>()?),
            unwind_data: parser.read_le::<u32>()?,
        })
    }

    fn unwind_blob(image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<UnwindBlob> {
        let info = UnwindInfo::parse(image, entry.unwind_data)?;
        if info.flags & UNW_FLAG_CHAININFO != 0 {
            return Err(Error::NotSupported("chained AMD64 unwind info"));
        }

        let mut size = 4 + 2 * info.count() as u32;
        if info.flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
            size = (size + 3) & !3;
            size += 4;
        }

        Ok(UnwindBlob {
            rva: entry.unwind_data,
            size,
        })
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
        tabular_unwind_frame(frame.image(), frame.entry(), flags, regs, memory)?;

        // the return popped one slot off the shadow stack
        if !flags.contains(UnwindFlags::GC_UNWIND) && regs.ssp != 0 {
            regs.ssp = stack_above(regs.ssp, 8)?;
        }

        Ok(())
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
        let tail = frame.tail();
        if tail.has_eh_info() || tail.is_funclet() {
            // The saved RBP sits above all outgoing arguments; FrameOffset is not scaled.
            let info = UnwindInfo::parse(frame.image(), frame.entry().unwind_data)?;
            let fp = regs.frame_pointer(memory)?;
            return stack_below(fp, u64::from(info.frame_offset()));
        }

        let mut context = VirtualContext::from_frame(regs, memory)?;
        Self::virtual_unwind(frame.image(), frame.entry(), &mut context, memory)?;
        stack_below(context.sp, 8)
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
        let mut context = VirtualContext::from_frame(regs, memory)?;
        Self::virtual_unwind(frame.image(), frame.entry(), &mut context, memory)?;
        Ok(Some(stack_below(context.sp, 8)?))
    }
}

impl VirtualUnwind for Amd64 {
    fn virtual_unwind<M>(
        image: &ModuleImage<'_>,
        entry: &FunctionEntry,
        context: &mut VirtualContext<Self>,
        memory: &M,
    ) -> Result<()>
    where
        M: MemoryReader + ?Sized,
    {
        let info = UnwindInfo::parse(image, entry.unwind_data)?;
        if info.flags & UNW_FLAG_CHAININFO != 0 {
            return Err(Error::NotSupported("chained AMD64 unwind info"));
        }

        let start = image.base() + u64::from(entry.begin_rva);
        let prolog_offset = context
            .pc
            .checked_sub(start)
            .ok_or(Error::InvalidCodeAddress(context.pc))?;
        let in_prolog = prolog_offset < u64::from(info.size_of_prolog);

        let frame_base = if info.frame_register == 0 {
            context.sp
        } else if !in_prolog || info.frame_register_established(prolog_offset)? {
            let frame_register = register(info.frame_register)?;
            stack_below(
                register_value(context, frame_register),
                16 * u64::from(info.frame_offset),
            )?
        } else {
            context.sp
        };

        if !in_prolog {
            let code = image
                .rva_of(context.pc)
                .and_then(|rva| image.data().get(rva as usize..))
                .unwrap_or_default();
            if is_epilog(code) {
                return emulate_epilog(code, context, memory);
            }
        }

        let mut machine_frame = false;
        let mut index = 0;
        while index < info.count() {
            let (code_offset, op, op_info) = info.code(index);
            let slots = slot_count(op, op_info)?;
            if index + slots > info.count() {
                return Err(malformed_error!(
                    "Unwind code {} of function at {:#x} is truncated",
                    index,
                    start
                ));
            }

            if prolog_offset < u64::from(code_offset) {
                index += slots;
                continue;
            }

            match op {
                UWOP_PUSH_NONVOL => {
                    context.restore(register(op_info)?, context.sp, memory)?;
                    context.sp = stack_above(context.sp, 8)?;
                }
                UWOP_ALLOC_LARGE => {
                    let size = if op_info == 0 {
                        u64::from(info.slot_u16(index + 1)?) * 8
                    } else {
                        u64::from(info.slot_u32(index + 1)?)
                    };
                    context.sp = stack_above(context.sp, size)?;
                }
                UWOP_ALLOC_SMALL => {
                    context.sp = stack_above(context.sp, u64::from(op_info) * 8 + 8)?;
                }
                UWOP_SET_FPREG => {
                    let frame_register = register(info.frame_register)?;
                    context.sp = stack_below(
                        register_value(context, frame_register),
                        16 * u64::from(info.frame_offset),
                    )?;
                }
                UWOP_SAVE_NONVOL => {
                    let offset = u64::from(info.slot_u16(index + 1)?) * 8;
                    context.restore(register(op_info)?, stack_above(frame_base, offset)?, memory)?;
                }
                UWOP_SAVE_NONVOL_FAR => {
                    let offset = u64::from(info.slot_u32(index + 1)?);
                    context.restore(register(op_info)?, stack_above(frame_base, offset)?, memory)?;
                }
                UWOP_SAVE_XMM128 => {
                    let offset = u64::from(info.slot_u16(index + 1)?) * 16;
                    let value = memory.read_u128(stack_above(frame_base, offset)?)?;
                    context.set_vector(usize::from(op_info), value);
                }
                UWOP_SAVE_XMM128_FAR => {
                    let offset = u64::from(info.slot_u32(index + 1)?);
                    let value = memory.read_u128(stack_above(frame_base, offset)?)?;
                    context.set_vector(usize::from(op_info), value);
                }
                UWOP_PUSH_MACHFRAME => {
                    // an error code sits below the frame when OpInfo is set
                    let return_address = stack_above(context.sp, u64::from(op_info != 0) * 8)?;
                    let stack_address = stack_above(return_address, 3 * 8)?;
                    context.return_address_location = Some(return_address);
                    context.pc = memory.read_u64(return_address)?;
                    context.sp = memory.read_u64(stack_address)?;
                    machine_frame = true;
                }
                _ => {}
            }

            index += slots;
        }

        if !machine_frame {
            pop_return_address(context, memory)?;
        }

        Ok(())
    }
}
