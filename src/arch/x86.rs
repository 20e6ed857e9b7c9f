//! 32-bit x86, unwound from the GC-info frame header.
//!
//! There is no OS unwind format for x86 managed code. The function table only records
//! `(begin, end, unwind)` triples so the code manager can find methods; the unwind blob is a
//! 4-byte length, immediately followed by the classification tail. Everything needed to walk
//! a frame comes from [`X86FrameHeader`], decoded by the safe-point decoder.
//!
//! Two frame shapes exist:
//!
//! ```text
//! EBP frame                         ESP frame
//!   [ebp + 8 ..]  incoming args       [esp + pushed + fixed + saved ..] return address
//!   [ebp + 4]     return address      [esp + pushed + fixed ..]  ebp, ebx, esi, edi
//!   [ebp]         caller's ebp        [esp + pushed ..]          fixed frame
//!   [ebp - 4 ..]  edi, esi, ebx       [esp ..]                   pushed outgoing args
//!   ...           fixed frame
//! ```

use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};
use tracing::debug;

use crate::{
    arch::{stack_above, stack_below, Architecture, RegisterId, UnwindBlob},
    codeman::{
        FrameContext, FunctionEntry, GcInfoDecoder, RegDisplay, ReturnKind, UnwindFlags,
        X86FrameHeader, X86SavedRegisters,
    },
    file::memory::MemoryReader,
    image::ModuleImage,
    Error, Parser, Result,
};

/// 32-bit x86.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct X86;

/// x86 general-purpose registers, numbered as in GC info.
#[allow(missing_docs)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, EnumIter, EnumCount,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum X86Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl RegisterId for X86Register {
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

const SLOT: u64 = 4;

/// Callee-saved registers in the order an ESP frame pops them.
const ESP_FRAME_POP_ORDER: [(X86SavedRegisters, X86Register); 4] = [
    (X86SavedRegisters::EBP, X86Register::Ebp),
    (X86SavedRegisters::EBX, X86Register::Ebx),
    (X86SavedRegisters::ESI, X86Register::Esi),
    (X86SavedRegisters::EDI, X86Register::Edi),
];

/// Callee-saved registers in the order an EBP frame pushes them below EBP.
const EBP_FRAME_PUSH_ORDER: [(X86SavedRegisters, X86Register); 3] = [
    (X86SavedRegisters::EDI, X86Register::Edi),
    (X86SavedRegisters::ESI, X86Register::Esi),
    (X86SavedRegisters::EBX, X86Register::Ebx),
];

fn frame_header<D: GcInfoDecoder>(
    frame: &FrameContext<'_, '_, X86, D>,
    ip: u64,
) -> Result<X86FrameHeader> {
    frame
        .decoder()
        .x86_frame_header(frame.gc_info(), frame.code_offset(ip)?)
}

/// Walk `regs` to the caller using the frame header; returns the return-address slot.
fn unwind_with_header<M>(
    header: &X86FrameHeader,
    is_funclet: bool,
    regs: &mut RegDisplay<X86>,
    memory: &M,
) -> Result<u64>
where
    M: MemoryReader + ?Sized,
{
    let return_address_slot = match (header.prolog_offset, header.epilog_offset) {
        (Some(0), None) => regs.sp,
        (None, None) if (header.ebp_frame || header.double_align) && !is_funclet => {
            let ebp = regs.frame_pointer(memory)?;
            let mut offset = SLOT;
            for (mask, reg) in EBP_FRAME_PUSH_ORDER {
                if header.saved_registers.contains(mask) {
                    regs.set_location(reg, Some(stack_below(ebp, offset)?));
                    offset += SLOT;
                }
            }
            regs.set_location(X86Register::Ebp, Some(ebp));
            stack_above(ebp, SLOT)?
        }
        (None, None) => {
            let mut esp = stack_above(
                regs.sp,
                u64::from(header.pushed_args_size) + u64::from(header.stack_size),
            )?;
            for (mask, reg) in ESP_FRAME_POP_ORDER {
                if header.saved_registers.contains(mask) {
                    regs.set_location(reg, Some(esp));
                    esp = stack_above(esp, SLOT)?;
                }
            }
            esp
        }
        _ => return Err(Error::NotSupported("x86 unwind inside a prolog or epilog")),
    };

    regs.ip = memory.read_pointer(return_address_slot, SLOT)?;
    regs.sp = stack_above(return_address_slot, SLOT + u64::from(header.args_size))?;
    regs.return_address_location = Some(return_address_slot);
    Ok(return_address_slot)
}

impl Architecture for X86 {
    type Register = X86Register;

    const NAME: &'static str = "x86";
    const POINTER_SIZE: u64 = SLOT;
    const FUNCTION_ENTRY_SIZE: usize = 12;
    const FRAME_POINTER: X86Register = X86Register::Ebp;
    const NONVOLATILE: &'static [X86Register] = &[
        X86Register::Ebx,
        X86Register::Ebp,
        X86Register::Esi,
        X86Register::Edi,
    ];
    const PRESERVED_FLOAT_REGISTERS: usize = 0;
    const FIRST_PRESERVED_FLOAT_REGISTER: usize = 0;

    fn read_function_entry(parser: &mut Parser<'_>) -> Result<FunctionEntry> {
        Ok(FunctionEntry {
            index: 0,
            begin_rva: parser.read_le::<u32>()?,
            end_rva: Some(parser.read_le::<u32>()?),
            unwind_data: parser.read_le::<u32>()?,
        })
    }

    fn unwind_blob(image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<UnwindBlob> {
        // FunctionLength
        image.bytes_at(entry.unwind_data, 4)?;
        Ok(UnwindBlob {
            rva: entry.unwind_data,
            size: 4,
        })
    }

    fn unwind_frame<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        _flags: UnwindFlags,
        regs: &mut RegDisplay<Self>,
        memory: &M,
    ) -> Result<()>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized,
    {
        let header = frame_header(frame, regs.ip)?;
        unwind_with_header(&header, frame.is_funclet(), regs, memory)?;
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
        let header = frame_header(frame, regs.ip)?;
        let mut caller = *regs;
        unwind_with_header(&header, frame.is_funclet(), &mut caller, memory)
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
        let header = frame_header(frame, regs.ip)?;
        if header.return_kind == ReturnKind::Float {
            return Ok(None);
        }

        let mut caller = *regs;
        match unwind_with_header(&header, frame.is_funclet(), &mut caller, memory) {
            Ok(slot) => Ok(Some(slot)),
            Err(error) => {
                debug!(
                    "Not hijacking method at {:#x}: {}",
                    frame.method_start_address(),
                    error
                );
                Ok(None)
            }
        }
    }

    fn reverse_pinvoke_frame_address<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        regs: &RegDisplay<Self>,
        memory: &M,
    ) -> Result<u64>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized,
    {
        // the slot offset is only described by the method's entry header
        let header = frame.decoder().x86_frame_header(frame.gc_info(), 0)?;
        let Some(offset) = header.rev_pinvoke_offset else {
            return Err(malformed_error!(
                "Reverse P/Invoke method at {:#x} without transition frame slot",
                frame.method_start_address()
            ));
        };

        if header.ebp_frame {
            stack_below(regs.frame_pointer(memory)?, u64::from(offset))
        } else {
            stack_above(regs.sp, u64::from(offset))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codeman::FuncKind,
        test::{ImageBuilder, MethodSpec, MockGcDecoder, MockGcInfo, TestStack},
        CodeManager,
    };

    const STACK: u64 = 0x0080_0000;
    const CALLER: u64 = 0x0040_3000;

    fn decoder(header: X86FrameHeader) -> MockGcDecoder {
        MockGcDecoder::new().with_method(
            0,
            MockGcInfo {
                x86_header: Some(header),
                ..MockGcInfo::default()
            },
        )
    }

    fn ebp_header() -> X86FrameHeader {
        X86FrameHeader {
            ebp_frame: true,
            stack_size: 0x20,
            saved_registers: X86SavedRegisters::EDI | X86SavedRegisters::EBX,
            args_size: 8,
            ..X86FrameHeader::default()
        }
    }

    fn esp_header() -> X86FrameHeader {
        X86FrameHeader {
            stack_size: 0x10,
            pushed_args_size: 8,
            saved_registers: X86SavedRegisters::EBP | X86SavedRegisters::ESI,
            args_size: 4,
            ..X86FrameHeader::default()
        }
    }

    fn image() -> crate::test::BuiltImage<X86> {
        let mut builder = ImageBuilder::<X86>::new();
        builder
            .method(MethodSpec::root(0x1000, 0x1040))
            .method(MethodSpec::funclet(0x1040, 0x1060, FuncKind::Handler));
        builder.build()
    }

    #[test]
    fn register_names() {
        assert_eq!(X86Register::Ebp.name(), "ebp");
        assert_eq!(X86Register::from_number(7), Some(X86Register::Edi));
        assert_eq!(X86Register::from_number(8), None);
        assert_eq!(X86Register::COUNT, 8);
    }

    #[test]
    fn unwind_ebp_frame() {
        let built = image();
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(ebp_header())).unwrap();

        let ebp = STACK + 0x40;
        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(STACK + 0x80, ebp as u32);
        stack.write_u32(ebp, 0x0080_0F00);
        stack.write_u32(ebp + 4, CALLER as u32);

        let pc = built.address(0x1010);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let mut regs = RegDisplay::<X86>::new(pc, STACK).with_location(X86Register::Ebp, STACK + 0x80);
        manager
            .unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &stack)
            .unwrap();

        assert_eq!(regs.ip, CALLER);
        assert_eq!(regs.sp, ebp + 8 + 8);
        assert_eq!(regs.return_address_location, Some(ebp + 4));
        assert_eq!(regs.location(X86Register::Ebp), Some(ebp));
        assert_eq!(regs.location(X86Register::Edi), Some(ebp - 4));
        assert_eq!(regs.location(X86Register::Ebx), Some(ebp - 8));
        assert_eq!(regs.location(X86Register::Esi), None);
        assert_eq!(regs.frame_pointer(&stack).unwrap(), 0x0080_0F00);
    }

    #[test]
    fn unwind_esp_frame() {
        let built = image();
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(esp_header())).unwrap();

        let saved = STACK + 8 + 0x10;
        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(saved + 8, CALLER as u32);

        let pc = built.address(0x1010);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let mut regs = RegDisplay::<X86>::new(pc, STACK);
        manager
            .unwind_stack_frame(&method, UnwindFlags::GC_UNWIND, &mut regs, &stack)
            .unwrap();

        assert_eq!(regs.ip, CALLER);
        assert_eq!(regs.location(X86Register::Ebp), Some(saved));
        assert_eq!(regs.location(X86Register::Esi), Some(saved + 4));
        assert_eq!(regs.return_address_location, Some(saved + 8));
        assert_eq!(regs.sp, saved + 12 + 4);
    }

    #[test]
    fn funclets_unwind_as_esp_frames() {
        let built = image();
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(ebp_header())).unwrap();

        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(STACK + 0x20, 0x0040_1000);
        stack.write_u32(STACK + 0x24, 0xEB0);
        stack.write_u32(STACK + 0x28, CALLER as u32);

        let pc = built.address(0x1048);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let mut regs = RegDisplay::<X86>::new(pc, STACK);
        manager
            .unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &stack)
            .unwrap();

        assert_eq!(regs.location(X86Register::Edi), Some(STACK + 0x24));
        assert_eq!(regs.location(X86Register::Ebx), Some(STACK + 0x20));
        assert_eq!(regs.ip, CALLER);
    }

    #[test]
    fn unwind_at_prolog_start_and_inside() {
        let built = image();
        let header = X86FrameHeader {
            prolog_offset: Some(0),
            ..ebp_header()
        };
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(header)).unwrap();

        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(STACK, CALLER as u32);

        let pc = built.address(0x1000);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let mut regs = RegDisplay::<X86>::new(pc, STACK);
        manager
            .unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &stack)
            .unwrap();
        assert_eq!(regs.ip, CALLER);
        assert_eq!(regs.sp, STACK + 4 + 8);

        let header = X86FrameHeader {
            prolog_offset: Some(1),
            ..ebp_header()
        };
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(header)).unwrap();
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let mut regs = RegDisplay::<X86>::new(pc, STACK);
        assert!(matches!(
            manager.unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &stack),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            manager.conservative_upper_bound_for_outgoing_args(&method, &regs, &stack),
            Err(Error::NotSupported(_))
        ));
        // a hijack is simply refused
        assert_eq!(
            manager
                .return_address_hijack_info(&method, &regs, &stack)
                .unwrap(),
            None
        );
    }

    #[test]
    fn unwind_inside_ebp_frame_epilog() {
        let built = image();
        let header = X86FrameHeader {
            epilog_offset: Some(1),
            ..ebp_header()
        };
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(header)).unwrap();

        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(STACK + 0x80, (STACK + 0x40) as u32);

        let pc = built.address(0x1038);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let mut regs = RegDisplay::<X86>::new(pc, STACK).with_location(X86Register::Ebp, STACK + 0x80);
        assert!(matches!(
            manager.unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &stack),
            Err(Error::NotSupported(_))
        ));
        assert_eq!(regs.sp, STACK);
        assert_eq!(regs.ip, pc);
    }

    #[test]
    fn unwind_zero_saved_ebp() {
        let built = image();
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(ebp_header())).unwrap();

        // EDI and EBX would sit below address zero
        let stack = TestStack::new(STACK, 0x100);
        let pc = built.address(0x1010);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let regs = RegDisplay::<X86>::new(pc, STACK).with_location(X86Register::Ebp, STACK + 0x80);

        let mut unwound = regs;
        assert!(matches!(
            manager.unwind_stack_frame(&method, UnwindFlags::empty(), &mut unwound, &stack),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            manager.conservative_upper_bound_for_outgoing_args(&method, &regs, &stack),
            Err(Error::Malformed { .. })
        ));
        assert_eq!(
            manager
                .return_address_hijack_info(&method, &regs, &stack)
                .unwrap(),
            None
        );
    }

    #[test]
    fn upper_bound_and_hijack() {
        let built = image();
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(esp_header())).unwrap();

        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(STACK + 0x20, CALLER as u32);

        let pc = built.address(0x1010);
        let method = manager.find_method_info(pc).unwrap().unwrap();
        let regs = RegDisplay::<X86>::new(pc, STACK);
        assert_eq!(
            manager
                .conservative_upper_bound_for_outgoing_args(&method, &regs, &stack)
                .unwrap(),
            STACK + 0x20
        );
        assert_eq!(
            manager
                .return_address_hijack_info(&method, &regs, &stack)
                .unwrap(),
            Some(STACK + 0x20)
        );

        let float = X86FrameHeader {
            return_kind: ReturnKind::Float,
            ..esp_header()
        };
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(float)).unwrap();
        let method = manager.find_method_info(pc).unwrap().unwrap();
        assert_eq!(
            manager
                .return_address_hijack_info(&method, &regs, &stack)
                .unwrap(),
            None
        );
    }

    #[test]
    fn reverse_pinvoke_slot() {
        let mut builder = ImageBuilder::<X86>::new();
        builder.method(MethodSpec::root(0x1000, 0x1040).reverse_pinvoke());
        let built = builder.build();

        let mut stack = TestStack::new(STACK, 0x100);
        stack.write_u32(STACK + 0x80, (STACK + 0x60) as u32);
        stack.write_u32(STACK + 0x50, 0x00AB_CDE0);
        stack.write_u32(STACK + 0x0C, 0x00FE_DC00);

        let pc = built.address(0x1010);
        let regs = RegDisplay::<X86>::new(pc, STACK).with_location(X86Register::Ebp, STACK + 0x80);

        let header = X86FrameHeader {
            rev_pinvoke_offset: Some(0x10),
            ..ebp_header()
        };
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(header)).unwrap();
        let method = manager.find_method_info(pc).unwrap().unwrap();
        assert_eq!(
            manager
                .conservative_upper_bound_for_outgoing_args(&method, &regs, &stack)
                .unwrap(),
            STACK + 0x50
        );
        let mut unwound = regs;
        let result = manager
            .unwind_stack_frame(
                &method,
                UnwindFlags::STOP_UNWIND_ON_TRANSITION_FRAME,
                &mut unwound,
                &stack,
            )
            .unwrap();
        assert_eq!(result.previous_transition_frame, Some(0x00AB_CDE0));
        assert!(result.stopped_on_transition_frame);
        assert_eq!(unwound, regs);

        let header = X86FrameHeader {
            rev_pinvoke_offset: Some(0x0C),
            ..esp_header()
        };
        let manager = CodeManager::<X86, _>::new(built.image(), decoder(header)).unwrap();
        let method = manager.find_method_info(pc).unwrap().unwrap();
        assert_eq!(
            manager
                .conservative_upper_bound_for_outgoing_args(&method, &regs, &stack)
                .unwrap(),
            STACK + 0x0C
        );

        let manager =
            CodeManager::<X86, _>::new(built.image(), decoder(esp_header())).unwrap();
        let method = manager.find_method_info(pc).unwrap().unwrap();
        assert!(matches!(
            manager.conservative_upper_bound_for_outgoing_args(&method, &regs, &stack),
            Err(Error::Malformed { .. })
        ));
    }
}
