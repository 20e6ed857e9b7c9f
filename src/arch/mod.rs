//! Per-architecture strategies for decoding unwind data and unwinding frames.
//!
//! Every target the native compiler supports stores its function table, unwind blobs and
//! return addresses differently. The [`Architecture`] trait captures the handful of places
//! where that matters; [`crate::CodeManager`] is generic over it and contains no
//! target-specific branches of its own.
//!
//! # Implementations
//!
//! - [`Amd64`] - Windows x64 `UNWIND_INFO`, unwound by emulating unwind codes
//! - [`Arm64`] - ARM64 `.xdata` records, unwound by interpreting unwind codes
//! - [`X86`] - No OS unwind format; frames are unwound from the GC-info frame header
//!
//! [`NativeArchitecture`] names the implementation matching the build target. All three are
//! available on every host for offline analysis.
//!
//! # Tabular unwinding
//!
//! AMD64 and ARM64 implement [`VirtualUnwind`], the in-crate equivalent of the operating
//! system's virtual-unwind service. [`tabular_unwind_frame`] moves the non-volatile registers
//! of a [`RegDisplay`] into a [`VirtualContext`], runs the virtual unwind and copies the
//! caller's values and save locations back.

mod amd64;
mod arm64;
mod x86;

pub use amd64::{Amd64, Amd64Register};
pub use arm64::{Arm64, Arm64Register};
pub use x86::{X86, X86Register};

use std::fmt;

use crate::{
    codeman::{FrameContext, FunctionEntry, GcInfoDecoder, RegDisplay, UnwindFlags},
    file::memory::MemoryReader,
    image::ModuleImage,
    Parser, Result,
};

/// Upper bound on the general-purpose registers tracked for any architecture.
pub const MAX_REGISTERS: usize = 32;

/// Upper bound on the callee-saved vector registers tracked for any architecture.
pub const MAX_PRESERVED_FLOAT_REGISTERS: usize = 10;

/// Number of vector registers in a [`VirtualContext`].
pub const MAX_VECTOR_REGISTERS: usize = 32;

/// The architecture implementation for the build target.
#[cfg(target_arch = "x86_64")]
pub type NativeArchitecture = Amd64;

/// The architecture implementation for the build target.
#[cfg(target_arch = "aarch64")]
pub type NativeArchitecture = Arm64;

/// The architecture implementation for the build target.
#[cfg(target_arch = "x86")]
pub type NativeArchitecture = X86;

/// A general-purpose register of one architecture.
pub trait RegisterId: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Dense index used by [`RegDisplay`] and [`VirtualContext`].
    fn index(self) -> usize;

    /// Convert a register number as encoded by the compiler (GC info, unwind codes).
    fn from_number(number: u32) -> Option<Self>;

    /// Assembly name of the register.
    fn name(self) -> &'static str;
}

/// Location and size of the architecture-specific part of an unwind blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindBlob {
    /// RVA of the first byte of the blob
    pub rva: u32,
    /// Size in bytes; the classification tail starts right after
    pub size: u32,
}

impl UnwindBlob {
    /// RVA of the classification byte following the blob.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the sum overflows the RVA space.
    pub fn tail_rva(&self) -> Result<u32> {
        self.rva
            .checked_add(self.size)
            .ok_or(out_of_bounds_error!())
    }
}

/// Target-specific behaviour of the code manager.
///
/// Implementations are zero-sized markers; all methods are associated functions.
pub trait Architecture:
    Copy + Clone + fmt::Debug + Default + PartialEq + Eq + Send + Sync + 'static
{
    /// General-purpose register identifiers.
    type Register: RegisterId;

    /// Short name used in log output.
    const NAME: &'static str;

    /// Size of a pointer / stack slot in bytes.
    const POINTER_SIZE: u64;

    /// Size of one function-table entry in bytes.
    const FUNCTION_ENTRY_SIZE: usize;

    /// The frame-pointer register.
    const FRAME_POINTER: Self::Register;

    /// Callee-saved registers carried through an unwind.
    const NONVOLATILE: &'static [Self::Register];

    /// Number of callee-saved vector registers preserved across a non-GC unwind.
    const PRESERVED_FLOAT_REGISTERS: usize;

    /// Index of the first preserved vector register in a [`VirtualContext`].
    const FIRST_PRESERVED_FLOAT_REGISTER: usize;

    /// Decode one function-table entry at the parser position.
    ///
    /// The returned entry has index 0; the caller fills in the table position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated tables.
    fn read_function_entry(parser: &mut Parser<'_>) -> Result<FunctionEntry>;

    /// Locate the unwind data of `entry` and compute its size.
    ///
    /// # Errors
    /// - [`crate::Error::OutOfBounds`] if the blob header is outside the image
    /// - [`crate::Error::NotSupported`] for encodings the code manager does not handle
    fn unwind_blob(image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<UnwindBlob>;

    /// Exclusive end RVA of the code described by `entry`.
    ///
    /// # Errors
    /// Propagates failures reading the unwind data when the length lives there.
    fn function_end_rva(_image: &ModuleImage<'_>, entry: &FunctionEntry) -> Result<u32> {
        entry
            .end_rva
            .ok_or_else(|| malformed_error!("Function entry {} has no end address", entry.index))
    }

    /// Advance `regs` from the frame described by `frame` to its caller.
    ///
    /// Reverse-P/Invoke handling has already happened when this is called.
    ///
    /// # Errors
    /// Returns an error if the unwind data cannot be interpreted or stack memory is missing.
    fn unwind_frame<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        flags: UnwindFlags,
        regs: &mut RegDisplay<Self>,
        memory: &M,
    ) -> Result<()>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized;

    /// Highest stack address that cannot hold an outgoing argument of the frame, for
    /// frames without a reverse-P/Invoke transition.
    ///
    /// # Errors
    /// Returns an error if the frame cannot be unwound.
    fn outgoing_args_upper_bound<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        regs: &RegDisplay<Self>,
        memory: &M,
    ) -> Result<u64>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized;

    /// Address of the slot holding the frame's return address, or `None` if it cannot be
    /// hijacked. Funclets and reverse-P/Invoke methods are already filtered out.
    ///
    /// # Errors
    /// Returns an error if the frame cannot be unwound.
    fn hijack_location<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        regs: &RegDisplay<Self>,
        memory: &M,
    ) -> Result<Option<u64>>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized;

    /// Address of the slot holding the previous transition frame of a reverse-P/Invoke
    /// method.
    ///
    /// The GC info names a slot relative to the stack pointer, or to the frame pointer when
    /// the method uses a stack base register.
    ///
    /// # Errors
    /// - [`crate::Error::Malformed`] if the GC info has no reverse-P/Invoke slot
    /// - [`crate::Error::RegisterUnavailable`] if the frame pointer is needed but unknown
    fn reverse_pinvoke_frame_address<D, M>(
        frame: &FrameContext<'_, '_, Self, D>,
        regs: &RegDisplay<Self>,
        memory: &M,
    ) -> Result<u64>
    where
        D: GcInfoDecoder,
        M: MemoryReader + ?Sized,
    {
        let gc_info = frame.gc_info();
        let Some(slot) = frame.decoder().reverse_pinvoke_frame_slot(gc_info) else {
            return Err(malformed_error!(
                "Reverse P/Invoke method at {:#x} without transition frame slot",
                frame.method_start_address()
            ));
        };

        let base = if frame.decoder().stack_base_register(gc_info).is_some() {
            regs.frame_pointer(memory)?
        } else {
            regs.sp
        };

        Ok(base.wrapping_add_signed(i64::from(slot)))
    }
}

/// The in-crate virtual-unwind service for architectures with OS-defined unwind data.
pub trait VirtualUnwind: Architecture {
    /// Unwind `context` through the function described by `entry`.
    ///
    /// On return `context` holds the caller's SP, PC and non-volatile registers; the
    /// location of every register restored from the stack is recorded in the context.
    ///
    /// # Errors
    /// Returns an error if the unwind data is malformed or stack memory is missing.
    fn virtual_unwind<M>(
        image: &ModuleImage<'_>,
        entry: &FunctionEntry,
        context: &mut VirtualContext<Self>,
        memory: &M,
    ) -> Result<()>
    where
        M: MemoryReader + ?Sized;
}

/// Register state consumed and produced by [`VirtualUnwind::virtual_unwind`].
///
/// Holds register values together with the stack address each one was restored from, the
/// equivalent of a `CONTEXT` plus `KNONVOLATILE_CONTEXT_POINTERS` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualContext<A: Architecture> {
    /// Stack pointer
    pub sp: u64,
    /// Program counter
    pub pc: u64,
    /// Stack slot the caller's PC was read from, once known
    pub return_address_location: Option<u64>,
    values: [u64; MAX_REGISTERS],
    locations: [Option<u64>; MAX_REGISTERS],
    vectors: [u128; MAX_VECTOR_REGISTERS],
    _arch: std::marker::PhantomData<A>,
}

impl<A: Architecture> Default for VirtualContext<A> {
    fn default() -> Self {
        VirtualContext {
            sp: 0,
            pc: 0,
            return_address_location: None,
            values: [0; MAX_REGISTERS],
            locations: [None; MAX_REGISTERS],
            vectors: [0; MAX_VECTOR_REGISTERS],
            _arch: std::marker::PhantomData,
        }
    }
}

impl<A: Architecture> VirtualContext<A> {
    /// Build a context holding only SP, PC and (if known) the frame pointer.
    ///
    /// # Errors
    /// Propagates failures reading the frame pointer from memory.
    pub fn from_frame<M>(regs: &RegDisplay<A>, memory: &M) -> Result<Self>
    where
        M: MemoryReader + ?Sized,
    {
        let mut context = VirtualContext {
            sp: regs.sp,
            pc: regs.ip,
            ..VirtualContext::default()
        };
        if let Some(fp) = regs.try_value(A::FRAME_POINTER, memory)? {
            context.set_value(A::FRAME_POINTER, fp);
        }

        Ok(context)
    }

    /// Current value of `reg`.
    #[must_use]
    pub fn value(&self, reg: A::Register) -> u64 {
        self.values[reg.index()]
    }

    /// Overwrite the value of `reg` without touching its location.
    pub fn set_value(&mut self, reg: A::Register, value: u64) {
        self.values[reg.index()] = value;
    }

    /// Stack address `reg` was restored from, if any.
    #[must_use]
    pub fn location(&self, reg: A::Register) -> Option<u64> {
        self.locations[reg.index()]
    }

    /// Overwrite the location of `reg` without touching its value.
    pub fn set_location(&mut self, reg: A::Register, location: Option<u64>) {
        self.locations[reg.index()] = location;
    }

    /// Restore `reg` from the pointer-sized slot at `address`.
    ///
    /// # Errors
    /// Propagates failures reading `address`.
    pub fn restore<M>(&mut self, reg: A::Register, address: u64, memory: &M) -> Result<()>
    where
        M: MemoryReader + ?Sized,
    {
        let value = memory.read_pointer(address, A::POINTER_SIZE)?;
        self.values[reg.index()] = value;
        self.locations[reg.index()] = Some(address);
        Ok(())
    }

    /// Value of vector register `index`.
    #[must_use]
    pub fn vector(&self, index: usize) -> u128 {
        self.vectors[index]
    }

    /// Overwrite vector register `index`.
    pub fn set_vector(&mut self, index: usize, value: u128) {
        self.vectors[index] = value;
    }
}

/// Unwind one frame through [`VirtualUnwind::virtual_unwind`].
///
/// Non-volatile register values are fetched through their [`RegDisplay`] locations, vector
/// registers are carried only when `flags` does not request a GC unwind, and the caller's
/// SP, IP and register locations are written back into `regs`.
///
/// # Errors
/// Propagates failures of the virtual unwind and of stack reads.
pub fn tabular_unwind_frame<A, M>(
    image: &ModuleImage<'_>,
    entry: &FunctionEntry,
    flags: UnwindFlags,
    regs: &mut RegDisplay<A>,
    memory: &M,
) -> Result<()>
where
    A: VirtualUnwind,
    M: MemoryReader + ?Sized,
{
    let preserve_vectors = !flags.contains(UnwindFlags::GC_UNWIND);
    let mut context = VirtualContext::<A>::default();

    for &reg in A::NONVOLATILE {
        let location = regs.location(reg);
        context.set_location(reg, location);
        if let Some(address) = location {
            context.set_value(reg, memory.read_pointer(address, A::POINTER_SIZE)?);
        }
    }

    if preserve_vectors {
        for i in 0..A::PRESERVED_FLOAT_REGISTERS {
            context.set_vector(A::FIRST_PRESERVED_FLOAT_REGISTER + i, regs.float_register(i));
        }
    }

    context.sp = regs.sp;
    context.pc = regs.ip;

    A::virtual_unwind(image, entry, &mut context, memory)?;

    regs.sp = context.sp;
    regs.ip = context.pc;
    regs.return_address_location = context.return_address_location;

    if preserve_vectors {
        for i in 0..A::PRESERVED_FLOAT_REGISTERS {
            regs.set_float_register(i, context.vector(A::FIRST_PRESERVED_FLOAT_REGISTER + i));
        }
    }

    for &reg in A::NONVOLATILE {
        regs.set_location(reg, context.location(reg));
    }

    Ok(())
}

/// `address + delta` for an address taken from registers or thread memory.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the result does not fit the address space.
pub(crate) fn stack_above(address: u64, delta: u64) -> Result<u64> {
    address.checked_add(delta).ok_or_else(|| {
        malformed_error!("Stack address {:#x} + {:#x} overflows", address, delta)
    })
}

/// `address - delta` for an address taken from registers or thread memory.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the result does not fit the address space.
pub(crate) fn stack_below(address: u64, delta: u64) -> Result<u64> {
    address.checked_sub(delta).ok_or_else(|| {
        malformed_error!("Stack address {:#x} - {:#x} underflows", address, delta)
    })
}
