//! The code manager of one registered module.
//!
//! A stack walker asks the code manager three kinds of questions about a PC: which method
//! it belongs to, how to get from this frame to the caller's frame, and what the garbage
//! collector and the exception dispatcher need to know about the frame. All answers come
//! from immutable data inside the module image (the function table, the unwind blobs and
//! their classification tails, GC info and EH tables), so every query is a pure decode.
//!
//! # Architecture
//!
//! The module is organized around a per-PC [`MethodInfo`] handle:
//!
//! ```text
//! pc ──► CodeManager::find_method_info ──► MethodInfo { entry, root, aborted }
//!                                               │
//!         ┌─────────────────┬──────────────────┼──────────────────┬───────────────┐
//!         ▼                 ▼                  ▼                  ▼               ▼
//!   unwind_stack_frame  enumerate_gc_refs  eh_enum_init  return_address_    frame_pointer
//!   (Architecture)      (GcInfoDecoder)    (EhEnumerator) hijack_info
//! ```
//!
//! # Key Components
//!
//! - [`CodeManager`] - Query entry point, generic over the target [`Architecture`] and the
//!   safe-point decoder
//! - [`FunctionTable`] - PC lookup and funclet-to-root resolution
//! - [`UnwindTail`] - Decoded classification tail of one entry
//! - [`RegDisplay`] - Register state of a frame, updated in place by unwinding
//! - [`GcInfoDecoder`] - Interface to the compiler's GC info format
//! - [`EhEnumerator`] - Iterator over a method's exception clauses
//!
//! # Thread Safety
//!
//! [`CodeManager`] holds only shared references to immutable image data and is `Send` and
//! `Sync` whenever the decoder is. Method handles and register displays are per-query
//! values owned by the caller.

mod ehenum;
mod frame;
mod functable;
mod gcinfo;
mod method;
mod regdisplay;
mod tail;

pub use ehenum::{EhClause, EhClauseKind, EhEnumerator};
pub use frame::FrameContext;
pub use functable::{FunctionEntry, FunctionTable};
pub use gcinfo::{
    ClasslibFunctionId, CodeManagerFlags, GcInfoDecoder, GcSlot, GcSlotFlags, GcSlotKind,
    LiveSlot, ReturnKind, SlotLocation, StackSlotBase, X86FrameHeader, X86SavedRegisters,
};
pub use method::{MethodInfo, MethodRegion};
pub use regdisplay::{RegDisplay, UnwindFlags};
pub use tail::{FuncKind, UnwindBlockFlags, UnwindTail};

use tracing::{debug, trace, warn};

use crate::{
    arch::{stack_above, stack_below, Architecture, RegisterId, X86},
    file::memory::MemoryReader,
    image::{ModuleImage, RegistrationConfig},
    Error, Result,
};

/// Outcome of [`CodeManager::unwind_stack_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameUnwind {
    /// The transition frame saved by a reverse-P/Invoke method, `None` for ordinary frames
    pub previous_transition_frame: Option<u64>,
    /// `true` if the unwind stopped at the transition frame and left the registers untouched
    pub stopped_on_transition_frame: bool,
}

/// Answers stack-walk, GC and exception-dispatch queries for one module.
///
/// # Examples
///
/// ```rust,no_run
/// use nativescope::prelude::*;
///
/// # fn walk<D: GcInfoDecoder>(image: ModuleImage<'_>, decoder: D, stack: &[u8]) -> nativescope::Result<()> {
/// let manager = CodeManager::<Amd64, _>::new(image, decoder)?;
/// let memory = MemoryRegion::new(0x7ff0_0000, stack);
/// let mut regs = RegDisplay::<Amd64>::new(0x1_4000_1234, 0x7ff0_0100);
///
/// while let Some(method) = manager.find_method_info(regs.ip)? {
///     manager.enumerate_gc_refs(&method, regs.ip, &regs, &memory, false, |slot| {
///         println!("live: {:?}", slot);
///     })?;
///     manager.unwind_stack_frame(&method, UnwindFlags::GC_UNWIND, &mut regs, &memory)?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CodeManager<'a, A: Architecture, D: GcInfoDecoder> {
    image: ModuleImage<'a>,
    table: FunctionTable<'a, A>,
    decoder: D,
}

impl<'a, A: Architecture, D: GcInfoDecoder> CodeManager<'a, A, D> {
    /// Register `image` with the default [`RegistrationConfig`].
    ///
    /// # Errors
    /// See [`CodeManager::with_config`].
    pub fn new(image: ModuleImage<'a>, decoder: D) -> Result<Self> {
        Self::with_config(image, decoder, RegistrationConfig::default())
    }

    /// Register `image`, running the checks enabled in `config`.
    ///
    /// # Errors
    /// - [`crate::Error::OutOfBounds`] if the function table or an unwind blob lies outside
    ///   the image
    /// - [`crate::Error::Malformed`] if an enabled table or tail check fails
    /// - [`crate::Error::NotSupported`] if an entry uses an unwind encoding this crate
    ///   cannot handle
    pub fn with_config(
        image: ModuleImage<'a>,
        decoder: D,
        config: RegistrationConfig,
    ) -> Result<Self> {
        let table = FunctionTable::new(image)?;
        let manager = CodeManager {
            image,
            table,
            decoder,
        };

        if config.walks_entries() {
            if let Err(error) = manager.validate(config) {
                warn!(
                    "Rejecting {} module at {:#x}: {}",
                    A::NAME,
                    image.base(),
                    error
                );
                return Err(error);
            }
        }

        debug!(
            "Registered {} module at {:#x} with {} functions",
            A::NAME,
            image.base(),
            manager.table.len()
        );
        Ok(manager)
    }

    fn validate(&self, config: RegistrationConfig) -> Result<()> {
        let mut previous: Option<FunctionEntry> = None;
        let mut seen_root = false;

        for entry in self.table.iter() {
            let entry = entry?;

            if config.enable_bounds_validation {
                let blob = self.table.unwind_blob(&entry)?;
                self.image.bytes_at(blob.rva, blob.size as usize)?;
            }

            if config.enable_table_order_validation {
                if let Some(previous) = previous {
                    let previous_end = match previous.end_rva {
                        Some(end) => end,
                        None => A::function_end_rva(&self.image, &previous)?,
                    };
                    if entry.begin_rva <= previous.begin_rva || entry.begin_rva < previous_end {
                        return Err(malformed_error!(
                            "Function entry {} at {:#x} overlaps or precedes entry {} ending at {:#x}",
                            entry.index,
                            entry.begin_rva,
                            previous.index,
                            previous_end
                        ));
                    }
                }
            }

            if config.enable_unwind_tail_validation {
                let tail = self.table.tail(&entry)?;
                if tail.is_funclet() && !seen_root {
                    return Err(malformed_error!(
                        "Funclet entry {} is not preceded by a root method",
                        entry.index
                    ));
                }
                if tail.is_funclet() && tail.has_reverse_pinvoke() {
                    return Err(malformed_error!(
                        "Funclet entry {} is marked reverse P/Invoke",
                        entry.index
                    ));
                }
                seen_root |= !tail.is_funclet();
            }

            previous = Some(entry);
        }

        Ok(())
    }

    /// The registered image.
    #[must_use]
    pub fn image(&self) -> &ModuleImage<'a> {
        &self.image
    }

    /// The function table of the image.
    #[must_use]
    pub fn function_table(&self) -> &FunctionTable<'a, A> {
        &self.table
    }

    /// The safe-point decoder.
    #[must_use]
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// The OS handle of the module, which is its load address.
    #[must_use]
    pub fn os_module_handle(&self) -> u64 {
        self.image.base()
    }

    fn frame<'q>(&'q self, method: &'q MethodInfo) -> Result<FrameContext<'q, 'a, A, D>> {
        FrameContext::new(self, method)
    }

    /// Resolve `pc` to its method.
    ///
    /// Returns `Ok(None)` if `pc` is outside this module's managed code; stack walkers ask
    /// every registered module in turn.
    ///
    /// # Errors
    /// - [`crate::Error::InvalidCodeAddress`] if `pc` is in the managed range but no entry
    ///   covers it
    /// - [`crate::Error::Malformed`] if a funclet has no root method in front of it
    pub fn find_method_info(&self, pc: u64) -> Result<Option<MethodInfo>> {
        if !self.image.contains(pc) {
            return Ok(None);
        }

        let rva = self
            .image
            .rva_of(pc)
            .ok_or(Error::InvalidCodeAddress(pc))?;
        let index = match self.table.lookup(rva) {
            Ok(index) => index,
            Err(error) => {
                warn!("No function entry covers managed PC {:#x}", pc);
                return Err(error);
            }
        };

        let entry = self.table.entry(index)?;
        let root_index = self.table.root_of(index)?;
        let region = if root_index == index {
            MethodRegion::Root { entry }
        } else {
            MethodRegion::Funclet {
                funclet: entry,
                root: self.table.entry(root_index)?,
            }
        };

        trace!(
            "Resolved {:#x} to entry {} (root {})",
            pc,
            index,
            root_index
        );
        Ok(Some(MethodInfo::new(region)))
    }

    /// Decode the classification tail of `entry`.
    ///
    /// # Errors
    /// Propagates blob-locator failures and malformed tails.
    pub fn unwind_tail(&self, entry: &FunctionEntry) -> Result<UnwindTail<'a>> {
        self.table.tail(entry)
    }

    /// Returns `true` if the method's PC lies in a funclet.
    ///
    /// # Errors
    /// Propagates tail decoding failures.
    pub fn is_funclet(&self, method: &MethodInfo) -> Result<bool> {
        Ok(self.table.tail(method.entry())?.is_funclet())
    }

    /// Returns `true` if the method's PC lies in a filter funclet.
    ///
    /// # Errors
    /// Propagates tail decoding failures.
    pub fn is_filter(&self, method: &MethodInfo) -> Result<bool> {
        Ok(self.table.tail(method.entry())?.is_filter())
    }

    /// Frame pointer of a frame that has one by contract: methods with EH clauses and
    /// funclets. `None` for every other frame.
    ///
    /// # Errors
    /// Returns [`crate::Error::RegisterUnavailable`] if the frame pointer is required but
    /// `regs` does not know where it lives.
    pub fn frame_pointer<M>(
        &self,
        method: &MethodInfo,
        regs: &RegDisplay<A>,
        memory: &M,
    ) -> Result<Option<u64>>
    where
        M: MemoryReader + ?Sized,
    {
        let tail = self.table.tail(method.entry())?;
        if tail.has_eh_info() || tail.is_funclet() {
            return Ok(Some(regs.frame_pointer(memory)?));
        }

        Ok(None)
    }

    /// Offset of `pc` from the root method start, and the root method's GC info.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidCodeAddress`] if `pc` is not in the method.
    pub fn code_offset(&self, method: &MethodInfo, pc: u64) -> Result<(u32, &'a [u8])> {
        let frame = self.frame(method)?;
        Ok((frame.code_offset(pc)?, frame.gc_info()))
    }

    /// Returns `true` if the GC may suspend a thread stopped at `pc`.
    ///
    /// PCs outside this module are never safe points.
    ///
    /// # Errors
    /// Propagates failures resolving `pc`.
    pub fn is_safe_point(&self, pc: u64) -> Result<bool> {
        let Some(method) = self.find_method_info(pc)? else {
            return Ok(false);
        };

        let frame = self.frame(&method)?;
        let code_offset = frame.code_offset(pc)?;
        let gc_info = frame.gc_info();

        Ok(self.decoder.is_interruptible(gc_info, code_offset)
            || self.decoder.is_safe_point(gc_info, code_offset))
    }

    /// Report every live GC reference of the frame at `pc` through `callback`.
    ///
    /// The decoder is queried with [`CodeManagerFlags::EXECUTION_ABORTED`] after a hardware
    /// fault was remapped into the method, [`CodeManagerFlags::NO_REPORT_UNTRACKED`] for
    /// filter funclets and [`CodeManagerFlags::ACTIVE_STACK_FRAME`] for the innermost frame,
    /// which also reports scratch registers and slots.
    ///
    /// # Errors
    /// - [`crate::Error::LiveSlotEnumeration`] if the decoder cannot decode the GC info
    /// - [`crate::Error::Malformed`] if the decoder reports an unknown register
    /// - Unwinding failures when a slot is relative to the caller's stack pointer
    pub fn enumerate_gc_refs<M, F>(
        &self,
        method: &MethodInfo,
        pc: u64,
        regs: &RegDisplay<A>,
        memory: &M,
        is_active_frame: bool,
        mut callback: F,
    ) -> Result<()>
    where
        M: MemoryReader + ?Sized,
        F: FnMut(LiveSlot<A::Register>),
    {
        let frame = self.frame(method)?;
        let code_offset = frame.code_offset(pc)?;

        let mut flags = CodeManagerFlags::empty();
        if method.is_execution_aborted() {
            flags |= CodeManagerFlags::EXECUTION_ABORTED;
        }
        if frame.tail().is_filter() {
            flags |= CodeManagerFlags::NO_REPORT_UNTRACKED;
        }
        if is_active_frame {
            flags |= CodeManagerFlags::ACTIVE_STACK_FRAME;
        }

        let mut caller_sp = None;
        let mut failure = None;
        let decoded = self.decoder.enumerate_live_slots(
            frame.gc_info(),
            code_offset,
            flags,
            is_active_frame,
            &mut |slot: GcSlot| {
                if failure.is_some() {
                    return;
                }
                match resolve_slot(&frame, slot, regs, memory, &mut caller_sp) {
                    Ok(live) => callback(live),
                    Err(error) => failure = Some(error),
                }
            },
        );

        if !decoded {
            warn!(
                "GC info of method at {:#x} failed to decode at offset {:#x}",
                frame.method_start_address(),
                code_offset
            );
            return Err(Error::LiveSlotEnumeration { code_offset });
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Highest stack address that is guaranteed not to hold an outgoing argument of the
    /// frame; the GC scans the callee's argument area conservatively up to it.
    ///
    /// # Errors
    /// - [`crate::Error::Malformed`] if a funclet is marked reverse P/Invoke
    /// - Unwinding failures of the architecture strategy
    pub fn conservative_upper_bound_for_outgoing_args<M>(
        &self,
        method: &MethodInfo,
        regs: &RegDisplay<A>,
        memory: &M,
    ) -> Result<u64>
    where
        M: MemoryReader + ?Sized,
    {
        let frame = self.frame(method)?;

        if frame.tail().has_reverse_pinvoke() {
            ensure_reverse_pinvoke_root(&frame)?;
            return A::reverse_pinvoke_frame_address(&frame, regs, memory);
        }

        A::outgoing_args_upper_bound(&frame, regs, memory)
    }

    /// Move `regs` from the frame of `method` to its caller.
    ///
    /// For reverse-P/Invoke methods the previous transition frame is read first; with
    /// [`UnwindFlags::STOP_UNWIND_ON_TRANSITION_FRAME`] the unwind stops there and `regs`
    /// is left untouched.
    ///
    /// # Errors
    /// - [`crate::Error::Malformed`] if a funclet is marked reverse P/Invoke
    /// - [`crate::Error::UnreadableMemory`] if the transition-frame slot or a saved register
    ///   cannot be read
    /// - Unwind data decoding failures
    pub fn unwind_stack_frame<M>(
        &self,
        method: &MethodInfo,
        flags: UnwindFlags,
        regs: &mut RegDisplay<A>,
        memory: &M,
    ) -> Result<FrameUnwind>
    where
        M: MemoryReader + ?Sized,
    {
        let frame = self.frame(method)?;
        let mut result = FrameUnwind::default();

        if frame.tail().has_reverse_pinvoke() {
            ensure_reverse_pinvoke_root(&frame)?;

            let slot = A::reverse_pinvoke_frame_address(&frame, regs, memory)?;
            result.previous_transition_frame = Some(memory.read_pointer(slot, A::POINTER_SIZE)?);

            if flags.contains(UnwindFlags::STOP_UNWIND_ON_TRANSITION_FRAME) {
                trace!(
                    "Stopped on transition frame of method at {:#x}",
                    frame.method_start_address()
                );
                result.stopped_on_transition_frame = true;
                return Ok(result);
            }
        }

        let ip = regs.ip;
        A::unwind_frame(&frame, flags, regs, memory)?;
        trace!(
            "Unwound {} frame at {:#x}: caller ip {:#x}, sp {:#x}",
            A::NAME,
            ip,
            regs.ip,
            regs.sp
        );

        Ok(result)
    }

    /// Every managed PC can be unwound; the unwinders cover prologs and epilogs.
    #[must_use]
    pub fn is_unwindable(&self, _pc: u64) -> bool {
        true
    }

    /// Location of the frame's return address, for redirecting the return into a GC
    /// suspension stub.
    ///
    /// Returns `Ok(None)` when hijacking is refused: for funclets, for reverse-P/Invoke
    /// methods, and in the architecture-specific cases of
    /// [`Architecture::hijack_location`].
    ///
    /// # Errors
    /// Unwinding failures of the architecture strategy.
    pub fn return_address_hijack_info<M>(
        &self,
        method: &MethodInfo,
        regs: &RegDisplay<A>,
        memory: &M,
    ) -> Result<Option<u64>>
    where
        M: MemoryReader + ?Sized,
    {
        let frame = self.frame(method)?;

        if frame.is_funclet() {
            debug!(
                "Not hijacking funclet at {:#x}",
                frame.entry_start_address()
            );
            return Ok(None);
        }

        if frame.tail().has_reverse_pinvoke() {
            debug!(
                "Not hijacking reverse P/Invoke method at {:#x}",
                frame.method_start_address()
            );
            return Ok(None);
        }

        A::hijack_location(&frame, regs, memory)
    }

    /// Mark `method` as interrupted by a hardware fault at `pc`.
    ///
    /// Later [`CodeManager::enumerate_gc_refs`] calls with the same handle report the
    /// frame as aborted. Returns `pc` unchanged.
    pub fn remap_hardware_fault_to_gc_safe_point(&self, method: &mut MethodInfo, pc: u64) -> u64 {
        method.mark_execution_aborted();
        pc
    }

    /// Start enumerating the exception clauses of the method's root.
    ///
    /// Returns `Ok(None)` if the method has no EH table.
    ///
    /// # Errors
    /// Returns an error if the EH table lies outside the image or its clause count cannot
    /// be decoded.
    pub fn eh_enum_init(&self, method: &MethodInfo) -> Result<Option<EhEnumerator<'a>>> {
        let frame = self.frame(method)?;
        let start = frame.method_start_address();

        let Some(eh_info_rva) = frame.root_tail().eh_info_rva() else {
            debug!("Method at {:#x} has no EH info", start);
            return Ok(None);
        };

        let parser = self.image.parser_at(eh_info_rva)?;
        Ok(Some(EhEnumerator::new(parser, self.image.base(), start)?))
    }

    /// Absolute start address of the method's root.
    #[must_use]
    pub fn method_start_address(&self, method: &MethodInfo) -> u64 {
        self.image.base() + u64::from(method.root().begin_rva)
    }

    /// Address of the class-library callback `id`, `None` if the table is shorter.
    #[must_use]
    pub fn classlib_function(&self, id: impl Into<u32>) -> Option<u64> {
        let id = id.into() as usize;
        self.image.classlib_functions().get(id).copied()
    }

    /// Compiler-attached data of the entry containing `pc`.
    ///
    /// Returns `Ok(None)` outside this module and for entries without associated data.
    ///
    /// # Errors
    /// Propagates failures resolving `pc` or decoding its tail.
    pub fn associated_data(&self, pc: u64) -> Result<Option<u64>> {
        if !self.image.contains(pc) {
            return Ok(None);
        }

        let rva = self
            .image
            .rva_of(pc)
            .ok_or(Error::InvalidCodeAddress(pc))?;
        let entry = self.table.entry(self.table.lookup(rva)?)?;
        let tail = self.table.tail(&entry)?;

        Ok(tail
            .associated_data_rva()
            .map(|rva| self.image.base() + u64::from(rva)))
    }
}

impl<D: GcInfoDecoder> CodeManager<'_, X86, D> {
    /// Kind of value the method returns, from the GC info header at the frame's IP.
    ///
    /// Returns `Ok(None)` for floating-point returns, which live on the x87 stack and
    /// cannot be preserved across a return-address hijack.
    ///
    /// # Errors
    /// Propagates failures decoding the GC info header.
    pub fn return_value_kind(
        &self,
        method: &MethodInfo,
        regs: &RegDisplay<X86>,
    ) -> Result<Option<ReturnKind>> {
        let frame = self.frame(method)?;
        let header = self
            .decoder
            .x86_frame_header(frame.gc_info(), frame.code_offset(regs.ip)?)?;

        if header.return_kind == ReturnKind::Float {
            debug!(
                "Method at {:#x} returns a float",
                frame.method_start_address()
            );
            return Ok(None);
        }

        Ok(Some(header.return_kind))
    }

    /// Stack pointer to resume at when an exception handler of this frame completes.
    ///
    /// # Errors
    /// - [`crate::Error::NotSupported`] inside a prolog or epilog
    /// - [`crate::Error::RegisterUnavailable`] if an EBP frame's frame pointer is unknown
    /// - [`crate::Error::Malformed`] if the frame pointer is too small for the fixed frame
    pub fn resume_sp<M>(
        &self,
        method: &MethodInfo,
        regs: &RegDisplay<X86>,
        memory: &M,
    ) -> Result<u64>
    where
        M: MemoryReader + ?Sized,
    {
        let frame = self.frame(method)?;
        let header = self
            .decoder
            .x86_frame_header(frame.gc_info(), frame.code_offset(regs.ip)?)?;

        if header.prolog_offset.is_some() || header.epilog_offset.is_some() {
            return Err(Error::NotSupported("resume SP inside a prolog or epilog"));
        }

        let esp_frame = (!header.ebp_frame && !header.double_align) || frame.is_funclet();
        if esp_frame {
            return stack_above(regs.sp, u64::from(header.pushed_args_size));
        }

        let ebp = regs.frame_pointer(memory)?;
        stack_above(stack_below(ebp, u64::from(header.stack_size))?, 4)
    }
}

fn ensure_reverse_pinvoke_root<A: Architecture, D: GcInfoDecoder>(
    frame: &FrameContext<'_, '_, A, D>,
) -> Result<()> {
    if frame.is_funclet() {
        warn!(
            "Funclet at {:#x} is marked reverse P/Invoke",
            frame.entry_start_address()
        );
        return Err(malformed_error!(
            "Reverse P/Invoke marker on funclet entry {}",
            frame.entry().index
        ));
    }

    Ok(())
}

fn resolve_slot<A, D, M>(
    frame: &FrameContext<'_, '_, A, D>,
    slot: GcSlot,
    regs: &RegDisplay<A>,
    memory: &M,
    caller_sp: &mut Option<u64>,
) -> Result<LiveSlot<A::Register>>
where
    A: Architecture,
    D: GcInfoDecoder,
    M: MemoryReader + ?Sized,
{
    let location = match slot.kind {
        GcSlotKind::Register(number) => {
            let Some(register) = A::Register::from_number(number) else {
                return Err(malformed_error!(
                    "GC info names unknown {} register {}",
                    A::NAME,
                    number
                ));
            };
            SlotLocation::Register {
                register,
                address: regs.location(register),
            }
        }
        GcSlotKind::Stack { base, offset } => {
            let base = match base {
                StackSlotBase::Sp => regs.sp,
                StackSlotBase::FramePointer => regs.frame_pointer(memory)?,
                StackSlotBase::CallerSp => match *caller_sp {
                    Some(sp) => sp,
                    None => {
                        let mut caller = *regs;
                        A::unwind_frame(frame, UnwindFlags::GC_UNWIND, &mut caller, memory)?;
                        *caller_sp = Some(caller.sp);
                        caller.sp
                    }
                },
            };
            SlotLocation::Stack {
                address: base.wrapping_add_signed(i64::from(offset)),
            }
        }
    };

    Ok(LiveSlot {
        location,
        flags: slot.flags,
    })
}
