//! Everything an architecture strategy needs to know about one frame.

use crate::{
    arch::Architecture,
    codeman::{
        functable::FunctionEntry, gcinfo::GcInfoDecoder, method::MethodInfo, tail::UnwindTail,
        CodeManager,
    },
    image::ModuleImage,
    Error, Result,
};

/// A resolved method together with its decoded classification tails.
///
/// Built per query by the [`CodeManager`] and handed to the [`Architecture`] hooks, so the
/// strategies never re-read the tail bytes themselves.
#[derive(Debug)]
pub struct FrameContext<'q, 'a, A: Architecture, D: GcInfoDecoder> {
    manager: &'q CodeManager<'a, A, D>,
    method: &'q MethodInfo,
    tail: UnwindTail<'a>,
    root_tail: UnwindTail<'a>,
}

impl<'q, 'a, A: Architecture, D: GcInfoDecoder> FrameContext<'q, 'a, A, D> {
    pub(crate) fn new(manager: &'q CodeManager<'a, A, D>, method: &'q MethodInfo) -> Result<Self> {
        let table = manager.function_table();
        let tail = table.tail(method.entry())?;
        let root_tail = if method.is_funclet_region() {
            table.tail(method.root())?
        } else {
            tail
        };

        Ok(FrameContext {
            manager,
            method,
            tail,
            root_tail,
        })
    }

    /// The module the frame's code lives in.
    #[must_use]
    pub fn image(&self) -> &ModuleImage<'a> {
        self.manager.image()
    }

    /// The safe-point decoder of the code manager.
    #[must_use]
    pub fn decoder(&self) -> &'q D {
        self.manager.decoder()
    }

    /// The method handle the frame was built from.
    #[must_use]
    pub fn method(&self) -> &MethodInfo {
        self.method
    }

    /// The entry the PC lies in.
    #[must_use]
    pub fn entry(&self) -> &FunctionEntry {
        self.method.entry()
    }

    /// The root method's entry.
    #[must_use]
    pub fn root_entry(&self) -> &FunctionEntry {
        self.method.root()
    }

    /// Classification of the entry the PC lies in.
    #[must_use]
    pub fn tail(&self) -> &UnwindTail<'a> {
        &self.tail
    }

    /// Classification of the root method.
    #[must_use]
    pub fn root_tail(&self) -> &UnwindTail<'a> {
        &self.root_tail
    }

    /// Returns `true` if the PC lies in a funclet.
    #[must_use]
    pub fn is_funclet(&self) -> bool {
        self.tail.is_funclet()
    }

    /// The root method's GC info; funclets share it.
    #[must_use]
    pub fn gc_info(&self) -> &'a [u8] {
        self.root_tail.gc_info()
    }

    /// Absolute start address of the root method.
    #[must_use]
    pub fn method_start_address(&self) -> u64 {
        self.image().base() + u64::from(self.root_entry().begin_rva)
    }

    /// Absolute start address of the entry the PC lies in.
    #[must_use]
    pub fn entry_start_address(&self) -> u64 {
        self.image().base() + u64::from(self.entry().begin_rva)
    }

    /// Offset of `pc` from the root method start, as used by GC info.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidCodeAddress`] if `pc` lies before the method or more
    /// than 4 GiB after it.
    pub fn code_offset(&self, pc: u64) -> Result<u32> {
        pc.checked_sub(self.method_start_address())
            .and_then(|offset| u32::try_from(offset).ok())
            .ok_or(Error::InvalidCodeAddress(pc))
    }
}
