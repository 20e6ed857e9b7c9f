//! Per-query method handles.

use crate::codeman::functable::FunctionEntry;

/// Which code region a PC resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodRegion {
    /// The PC is in the main body of a method
    Root {
        /// The method's entry
        entry: FunctionEntry,
    },
    /// The PC is in a funclet of a method
    Funclet {
        /// The funclet's own entry
        funclet: FunctionEntry,
        /// The entry of the owning root method
        root: FunctionEntry,
    },
}

/// Result of resolving a PC: the entry it lies in, its root method, and whether the
/// query comes from a hardware fault.
///
/// Created by [`crate::CodeManager::find_method_info`] for one PC. A handle describes
/// exactly that PC's method; do not reuse it for another PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodInfo {
    region: MethodRegion,
    execution_aborted: bool,
}

impl MethodInfo {
    pub(crate) fn new(region: MethodRegion) -> Self {
        MethodInfo {
            region,
            execution_aborted: false,
        }
    }

    /// The resolved region.
    #[must_use]
    pub fn region(&self) -> &MethodRegion {
        &self.region
    }

    /// The entry containing the PC; a funclet entry for funclets.
    #[must_use]
    pub fn entry(&self) -> &FunctionEntry {
        match &self.region {
            MethodRegion::Root { entry } => entry,
            MethodRegion::Funclet { funclet, .. } => funclet,
        }
    }

    /// The root method's entry; the same as [`MethodInfo::entry`] for roots.
    #[must_use]
    pub fn root(&self) -> &FunctionEntry {
        match &self.region {
            MethodRegion::Root { entry } => entry,
            MethodRegion::Funclet { root, .. } => root,
        }
    }

    /// Returns `true` if the PC resolved into a funclet.
    #[must_use]
    pub fn is_funclet_region(&self) -> bool {
        matches!(self.region, MethodRegion::Funclet { .. })
    }

    /// Returns `true` once a hardware fault has been remapped to this frame.
    #[must_use]
    pub fn is_execution_aborted(&self) -> bool {
        self.execution_aborted
    }

    pub(crate) fn mark_execution_aborted(&mut self) {
        self.execution_aborted = true;
    }
}
