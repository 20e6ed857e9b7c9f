//! Interface to the safe-point / live-slot decoder.
//!
//! The bit-level GC info format belongs to the compiler and its companion decoder. The code
//! manager only locates the GC info blob of a method, computes the code offset of a PC in it,
//! derives the query flags, and hands both to a [`GcInfoDecoder`]. Live slots come back in
//! symbolic form ([`GcSlot`]) and are resolved to addresses against the frame's
//! [`crate::RegDisplay`] before the stack walker sees them ([`LiveSlot`]).

use bitflags::bitflags;
use strum::{EnumCount, EnumIter, FromRepr};

use crate::{Error, Result};

bitflags! {
    /// Flags passed to the decoder when enumerating live slots.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CodeManagerFlags: u32 {
        /// The frame is the innermost frame of the walk; scratch registers are live too
        const ACTIVE_STACK_FRAME = 0x1;
        /// Execution faulted in this frame; report conservatively
        const EXECUTION_ABORTED = 0x2;
        /// The frame is the parent of a funclet frame reported earlier in the walk
        const PARENT_OF_FUNCLET_STACK_FRAME = 0x40;
        /// Do not report untracked slots; they belong to the parent frame of a filter
        const NO_REPORT_UNTRACKED = 0x80;
    }
}

bitflags! {
    /// How a live slot has to be treated by the collector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GcSlotFlags: u32 {
        /// The slot may point into the middle of an object
        const INTERIOR = 0x1;
        /// The referenced object must not move
        const PINNED = 0x2;
        /// The slot is live for the whole method rather than tracked per range
        const UNTRACKED = 0x4;
    }
}

/// Base of a stack slot offset, as encoded in GC info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum StackSlotBase {
    /// Relative to the caller's stack pointer
    CallerSp,
    /// Relative to the frame's stack pointer
    Sp,
    /// Relative to the frame pointer
    FramePointer,
}

/// Where a live slot is, in the decoder's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcSlotKind {
    /// A register, by the compiler's register number
    Register(u32),
    /// A stack slot relative to a frame base
    Stack {
        /// Frame base the offset is applied to
        base: StackSlotBase,
        /// Signed byte offset
        offset: i32,
    },
}

/// One live slot reported by a [`GcInfoDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcSlot {
    /// Location of the slot
    pub kind: GcSlotKind,
    /// Interpretation of the slot
    pub flags: GcSlotFlags,
}

/// Location of a live slot resolved against the frame's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotLocation<R> {
    /// The reference is held in a register
    Register {
        /// The register
        register: R,
        /// Where the register's value is stored, if known
        address: Option<u64>,
    },
    /// The reference is held in a stack slot
    Stack {
        /// Address of the slot
        address: u64,
    },
}

/// One live GC reference location, as handed to the stack walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveSlot<R> {
    /// Where the reference lives
    pub location: SlotLocation<R>,
    /// How the reference is to be treated
    pub flags: GcSlotFlags,
}

/// Kind of value a method returns, as recorded in x86 GC info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr)]
#[repr(u8)]
pub enum ReturnKind {
    /// Integer or no return value
    Scalar = 0,
    /// A GC reference
    Object = 1,
    /// An interior (by-ref) pointer
    ByRef = 2,
    /// A floating-point value on the x87 stack
    Float = 3,
}

bitflags! {
    /// Callee-saved registers pushed by an x86 prolog.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct X86SavedRegisters: u8 {
        /// `edi`
        const EDI = 0x1;
        /// `esi`
        const ESI = 0x2;
        /// `ebx`
        const EBX = 0x4;
        /// `ebp`
        const EBP = 0x8;
    }
}

/// The decoded x86 GC-info header for one code offset.
///
/// x86 has no OS unwind format, so the frame layout needed for unwinding lives in the GC
/// info header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct X86FrameHeader {
    /// The method establishes an EBP frame
    pub ebp_frame: bool,
    /// The method aligns its frame to 8 bytes (implies an EBP frame)
    pub double_align: bool,
    /// The code offset is interruptible
    pub interruptible: bool,
    /// Offset into the prolog, `None` when not in the prolog
    pub prolog_offset: Option<u32>,
    /// Offset into an epilog, `None` when not in an epilog
    pub epilog_offset: Option<u32>,
    /// Size of the fixed frame below the saved registers
    pub stack_size: u32,
    /// Callee-saved registers pushed by the prolog
    pub saved_registers: X86SavedRegisters,
    /// Bytes of incoming arguments popped by the `ret`
    pub args_size: u32,
    /// Bytes of outgoing arguments pushed at the code offset (ESP frames)
    pub pushed_args_size: u32,
    /// Offset of the reverse-P/Invoke frame slot, if the method has one
    pub rev_pinvoke_offset: Option<u32>,
    /// Kind of the return value
    pub return_kind: ReturnKind,
}

impl Default for ReturnKind {
    fn default() -> Self {
        ReturnKind::Scalar
    }
}

/// The safe-point / live-slot decoder owned by the compiler toolchain.
///
/// `gc_info` is the byte range starting at a root method's GC info and running to the end of
/// the image; the decoder knows where the blob ends. `code_offset` is always relative to the
/// root method start, also for funclets.
pub trait GcInfoDecoder {
    /// Returns `true` if every instruction around `code_offset` is interruptible.
    fn is_interruptible(&self, gc_info: &[u8], code_offset: u32) -> bool;

    /// Returns `true` if `code_offset` is a recorded safe point (call return site).
    fn is_safe_point(&self, gc_info: &[u8], code_offset: u32) -> bool;

    /// Report every live slot at `code_offset` through `callback`.
    ///
    /// `report_scratch_slots` is set for the active frame, where volatile registers and
    /// scratch stack slots still hold live references. Returns `false` if the GC info
    /// could not be decoded.
    fn enumerate_live_slots(
        &self,
        gc_info: &[u8],
        code_offset: u32,
        flags: CodeManagerFlags,
        report_scratch_slots: bool,
        callback: &mut dyn FnMut(GcSlot),
    ) -> bool;

    /// Stack slot of the reverse-P/Invoke frame, relative to the stack base.
    fn reverse_pinvoke_frame_slot(&self, gc_info: &[u8]) -> Option<i32>;

    /// Register number stack slots are based on, `None` for SP-based frames.
    fn stack_base_register(&self, gc_info: &[u8]) -> Option<u32>;

    /// Returns `true` if the method contains tail calls.
    fn has_tail_calls(&self, gc_info: &[u8]) -> bool;

    /// Decode the x86 frame header for `code_offset`.
    ///
    /// # Errors
    /// The default implementation returns [`crate::Error::NotSupported`]; only decoders for
    /// x86 GC info provide it.
    fn x86_frame_header(&self, gc_info: &[u8], code_offset: u32) -> Result<X86FrameHeader> {
        let _ = (gc_info, code_offset);
        Err(Error::NotSupported("x86 frame headers"))
    }
}

/// Runtime callbacks registered by the class library, by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr)]
#[repr(u32)]
pub enum ClasslibFunctionId {
    /// Create the managed exception for a runtime failure
    GetRuntimeException = 0,
    /// Terminate the process
    FailFast = 1,
    /// Handle an exception nobody caught
    UnhandledExceptionHandler = 2,
    /// Append a frame to an exception's stack trace
    AppendExceptionStackFrame = 3,
    /// The `EEType` of `System.Array`
    GetSystemArrayEEType = 5,
    /// First-chance exception notification
    OnFirstChanceException = 6,
    /// Unhandled exception notification
    OnUnhandledException = 7,
    /// Objective-C interop: tagged memory lookup
    ObjectiveCMarshalTryGetTaggedMemory = 8,
    /// Objective-C interop: tracked reference callback
    ObjectiveCMarshalGetIsTrackedReferenceCallback = 9,
    /// Objective-C interop: finalizer queue callback
    ObjectiveCMarshalGetOnEnteredFinalizerQueueCallback = 10,
    /// Objective-C interop: unhandled exception propagation
    ObjectiveCMarshalGetUnhandledExceptionPropagationHandler = 11,
}

impl From<ClasslibFunctionId> for u32 {
    fn from(id: ClasslibFunctionId) -> Self {
        id as u32
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn code_manager_flag_bits() {
        assert_eq!(CodeManagerFlags::ACTIVE_STACK_FRAME.bits(), 0x1);
        assert_eq!(CodeManagerFlags::EXECUTION_ABORTED.bits(), 0x2);
        assert_eq!(CodeManagerFlags::PARENT_OF_FUNCLET_STACK_FRAME.bits(), 0x40);
        assert_eq!(CodeManagerFlags::NO_REPORT_UNTRACKED.bits(), 0x80);
    }

    #[test]
    fn return_kind_repr() {
        for kind in ReturnKind::iter() {
            assert_eq!(ReturnKind::from_repr(kind as u8), Some(kind));
        }
        assert_eq!(ReturnKind::from_repr(4), None);
        assert_eq!(ReturnKind::default(), ReturnKind::Scalar);
    }

    #[test]
    fn classlib_ids() {
        assert_eq!(ClasslibFunctionId::COUNT, 11);
        assert_eq!(ClasslibFunctionId::from_repr(4), None);
        assert_eq!(
            ClasslibFunctionId::from_repr(5),
            Some(ClasslibFunctionId::GetSystemArrayEEType)
        );
        assert_eq!(u32::from(ClasslibFunctionId::OnUnhandledException), 7);
    }

    #[test]
    fn default_decoder_has_no_x86_header() {
        struct NoGcInfo;
        impl GcInfoDecoder for NoGcInfo {
            fn is_interruptible(&self, _: &[u8], _: u32) -> bool {
                false
            }
            fn is_safe_point(&self, _: &[u8], _: u32) -> bool {
                false
            }
            fn enumerate_live_slots(
                &self,
                _: &[u8],
                _: u32,
                _: CodeManagerFlags,
                _: bool,
                _: &mut dyn FnMut(GcSlot),
            ) -> bool {
                true
            }
            fn reverse_pinvoke_frame_slot(&self, _: &[u8]) -> Option<i32> {
                None
            }
            fn stack_base_register(&self, _: &[u8]) -> Option<u32> {
                None
            }
            fn has_tail_calls(&self, _: &[u8]) -> bool {
                false
            }
        }

        assert!(matches!(
            NoGcInfo.x86_frame_header(&[], 0),
            Err(Error::NotSupported(_))
        ));
    }
}
