//! Register state of one frame during a stack walk.

use bitflags::bitflags;

use crate::{
    arch::{Architecture, RegisterId, MAX_PRESERVED_FLOAT_REGISTERS, MAX_REGISTERS},
    file::memory::MemoryReader,
    Error, Result,
};

bitflags! {
    /// Options for [`crate::CodeManager::unwind_stack_frame`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnwindFlags: u32 {
        /// Stop right after reading the previous transition frame of a reverse-P/Invoke
        /// method, leaving the register state untouched
        const STOP_UNWIND_ON_TRANSITION_FRAME = 0x1;
        /// The unwind serves a GC stack walk; vector registers need not be preserved
        const GC_UNWIND = 0x2;
    }
}

/// The register display of one frame.
///
/// General-purpose registers are tracked by the stack address their value lives at, not by
/// value: moving to the caller frame replaces the locations of the registers the callee
/// saved, and the runtime can update a register in place (for example when relocating an
/// object reference) by writing to its location. SP, IP and the shadow-stack pointer are
/// tracked by value, as are the callee-saved vector registers.
///
/// # Examples
///
/// ```rust
/// use nativescope::{arch::{Amd64, Amd64Register}, MemoryRegion, RegDisplay};
///
/// let stack = 0x1234_u64.to_le_bytes();
/// let memory = MemoryRegion::new(0x8000, &stack);
///
/// let mut regs = RegDisplay::<Amd64>::new(0x1_4000_1010, 0x8000);
/// regs.set_location(Amd64Register::Rbp, Some(0x8000));
/// assert_eq!(regs.frame_pointer(&memory)?, 0x1234);
/// assert!(regs.value(Amd64Register::Rbx, &memory).is_err());
/// # Ok::<(), nativescope::Error>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegDisplay<A: Architecture> {
    /// Instruction pointer of the frame
    pub ip: u64,
    /// Stack pointer of the frame
    pub sp: u64,
    /// Shadow-stack pointer (CET), zero when shadow stacks are not in use
    pub ssp: u64,
    /// Stack slot the current `ip` was loaded from by the last unwind, if any
    pub return_address_location: Option<u64>,
    locations: [Option<u64>; MAX_REGISTERS],
    float_registers: [u128; MAX_PRESERVED_FLOAT_REGISTERS],
    _arch: std::marker::PhantomData<A>,
}

impl<A: Architecture> RegDisplay<A> {
    /// Create a display for a frame executing at `ip` with stack pointer `sp`.
    #[must_use]
    pub fn new(ip: u64, sp: u64) -> Self {
        RegDisplay {
            ip,
            sp,
            ssp: 0,
            return_address_location: None,
            locations: [None; MAX_REGISTERS],
            float_registers: [0; MAX_PRESERVED_FLOAT_REGISTERS],
            _arch: std::marker::PhantomData,
        }
    }

    /// Stack address holding the value of `reg`.
    #[must_use]
    pub fn location(&self, reg: A::Register) -> Option<u64> {
        self.locations[reg.index()]
    }

    /// Record where the value of `reg` lives.
    pub fn set_location(&mut self, reg: A::Register, location: Option<u64>) {
        self.locations[reg.index()] = location;
    }

    /// Builder-style [`RegDisplay::set_location`].
    #[must_use]
    pub fn with_location(mut self, reg: A::Register, location: u64) -> Self {
        self.set_location(reg, Some(location));
        self
    }

    /// Value of `reg`, if a location is known.
    ///
    /// # Errors
    /// Propagates failures reading the location.
    pub fn try_value<M>(&self, reg: A::Register, memory: &M) -> Result<Option<u64>>
    where
        M: MemoryReader + ?Sized,
    {
        match self.location(reg) {
            Some(address) => Ok(Some(memory.read_pointer(address, A::POINTER_SIZE)?)),
            None => Ok(None),
        }
    }

    /// Value of `reg`.
    ///
    /// # Errors
    /// - [`crate::Error::RegisterUnavailable`] if no location is known
    /// - [`crate::Error::UnreadableMemory`] if the location cannot be read
    pub fn value<M>(&self, reg: A::Register, memory: &M) -> Result<u64>
    where
        M: MemoryReader + ?Sized,
    {
        self.try_value(reg, memory)?
            .ok_or(Error::RegisterUnavailable(reg.name()))
    }

    /// Value of the frame-pointer register.
    ///
    /// # Errors
    /// See [`RegDisplay::value`].
    pub fn frame_pointer<M>(&self, memory: &M) -> Result<u64>
    where
        M: MemoryReader + ?Sized,
    {
        self.value(A::FRAME_POINTER, memory)
    }

    /// Preserved vector register `index` (XMM6-15 on AMD64, D8-15 on ARM64).
    #[must_use]
    pub fn float_register(&self, index: usize) -> u128 {
        self.float_registers[index]
    }

    /// Overwrite preserved vector register `index`.
    pub fn set_float_register(&mut self, index: usize, value: u128) {
        self.float_registers[index] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{Arm64, Arm64Register, X86, X86Register},
        MemoryRegion,
    };

    #[test]
    fn regdisplay_locations() {
        let mut stack = vec![0_u8; 32];
        stack[8..12].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        let memory = MemoryRegion::new(0x100, &stack);

        let regs = RegDisplay::<X86>::new(0x40_1000, 0x100).with_location(X86Register::Ebp, 0x108);
        assert_eq!(regs.frame_pointer(&memory).unwrap(), 0xDEAD_BEEF);
        assert_eq!(regs.try_value(X86Register::Esi, &memory).unwrap(), None);
        assert!(matches!(
            regs.value(X86Register::Esi, &memory),
            Err(Error::RegisterUnavailable("esi"))
        ));
    }

    #[test]
    fn regdisplay_unreadable_location() {
        let memory = MemoryRegion::new(0x100, &[]);
        let mut regs = RegDisplay::<Arm64>::new(0, 0);
        regs.set_location(Arm64Register::Lr, Some(0x200));
        assert!(matches!(
            regs.value(Arm64Register::Lr, &memory),
            Err(Error::UnreadableMemory(0x200))
        ));
    }

    #[test]
    fn regdisplay_float_registers() {
        let mut regs = RegDisplay::<Arm64>::new(0, 0);
        regs.set_float_register(7, 0x55);
        assert_eq!(regs.float_register(7), 0x55);
        assert_eq!(regs.float_register(0), 0);
    }

    #[test]
    fn unwind_flags_bits() {
        assert_eq!(UnwindFlags::STOP_UNWIND_ON_TRANSITION_FRAME.bits(), 1);
        assert_eq!(UnwindFlags::GC_UNWIND.bits(), 2);
        assert!(UnwindFlags::default().is_empty());
    }
}
