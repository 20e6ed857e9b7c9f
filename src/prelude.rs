//! # nativescope Prelude
//!
//! The types a stack walker needs to register a module and walk its frames, importable
//! with one glob.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all nativescope operations
pub use crate::Error;

/// The result type used throughout nativescope
pub use crate::Result;

/// Checks run when a module is registered
pub use crate::RegistrationConfig;

// ================================================================================================
// Module Registration
// ================================================================================================

/// Registered module view and its builder
pub use crate::{ModuleImage, ModuleRegistration};

/// Thread memory access
pub use crate::{MemoryReader, MemoryRegion};

// ================================================================================================
// Architectures
// ================================================================================================

pub use crate::arch::{
    Amd64, Amd64Register, Architecture, Arm64, Arm64Register, RegisterId, X86, X86Register,
};

// ================================================================================================
// Code Manager
// ================================================================================================

/// Query entry point
pub use crate::CodeManager;

pub use crate::codeman::{
    ClasslibFunctionId, EhClause, EhClauseKind, EhEnumerator, FrameUnwind, FuncKind,
    MethodInfo, RegDisplay, UnwindFlags,
};

// ================================================================================================
// GC Info Interface
// ================================================================================================

pub use crate::codeman::{
    CodeManagerFlags, GcInfoDecoder, GcSlot, GcSlotFlags, GcSlotKind, LiveSlot, ReturnKind,
    SlotLocation, StackSlotBase, X86FrameHeader,
};
