// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # nativescope
//!
//! The code manager of ahead-of-time compiled native images. Given a loaded image and a
//! program counter inside it, `nativescope` answers the questions a stack walker, a garbage
//! collector and an exception dispatcher ask about a managed frame:
//!
//! - **Method lookup** - which function-table entry covers a PC, and which root method a
//!   funclet belongs to
//! - **Unwinding** - the caller's registers, for AMD64 and ARM64 (Windows unwind data) and
//!   x86 (GC-info frame headers)
//! - **GC reporting** - safe points and live references, through a pluggable
//!   [`codeman::GcInfoDecoder`]
//! - **Exception dispatch** - the exception clauses of a method
//! - **Thread suspension** - where a frame's return address can be hijacked
//!
//! Everything is decoded on demand from the image bytes; nothing is cached and nothing is
//! written back, so a [`CodeManager`] can be shared freely between walking threads.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nativescope::prelude::*;
//!
//! # fn walk<D: GcInfoDecoder>(mapped: &[u8], stack: &[u8], decoder: D) -> nativescope::Result<()> {
//! let image = ModuleRegistration::from_pe_headers::<Amd64>(0x1_4000_0000, mapped)?.build()?;
//! let manager = CodeManager::<Amd64, _>::new(image, decoder)?;
//!
//! let memory = MemoryRegion::new(0x7ff0_0000, stack);
//! let mut regs = RegDisplay::<Amd64>::new(0x1_4000_1234, 0x7ff0_0100);
//! while let Some(method) = manager.find_method_info(regs.ip)? {
//!     println!("frame in method at {:#x}", manager.method_start_address(&method));
//!     manager.unwind_stack_frame(&method, UnwindFlags::empty(), &mut regs, &memory)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Registration, rejected images and refused hijacks are reported through [`tracing`];
//! per-frame decoding is logged at `trace` level.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use nativescope::prelude::*;
///
/// let mapped = std::fs::read("mapped_image.bin")?;
/// let image = ModuleRegistration::from_pe_headers::<Amd64>(0x1_4000_0000, &mapped)?.build()?;
/// println!("{} functions", image.function_count());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub mod prelude;

/// Target architectures and their unwinders.
///
/// Every query of the code manager is generic over an [`arch::Architecture`], which knows
/// the function-table entry layout, where an entry's unwind blob ends and how to unwind a
/// frame. AMD64 and ARM64 decode the Windows unwind formats with an in-crate virtual
/// unwinder ([`arch::VirtualUnwind`]); x86 unwinds from the frame header found in GC info.
///
/// # Examples
///
/// ```rust
/// use nativescope::arch::{Amd64, Amd64Register, Architecture, RegisterId};
///
/// assert_eq!(Amd64::NAME, "amd64");
/// assert_eq!(Amd64::FRAME_POINTER, Amd64Register::Rbp);
/// assert_eq!(Amd64Register::from_number(3), Some(Amd64Register::Rbx));
/// ```
pub mod arch;

/// The code manager: method lookup, unwinding, GC reference enumeration and EH clauses.
///
/// # Key Types
///
/// - [`codeman::CodeManager`] - Query entry point for one registered module
/// - [`codeman::MethodInfo`] - Per-PC method handle
/// - [`codeman::RegDisplay`] - Register state of a frame
/// - [`codeman::GcInfoDecoder`] - Interface to the compiler's GC info format
/// - [`codeman::EhEnumerator`] - Iterator over exception clauses
pub mod codeman;

/// Byte-level access to module images and thread memory.
pub mod file;

/// Registered module images and registration-time checks.
pub mod image;

pub use codeman::{CodeManager, RegDisplay};
pub use error::Error;
pub use file::{MemoryReader, MemoryRegion, Parser};
pub use image::{ModuleImage, ModuleRegistration, RegistrationConfig};

/// Result type of every fallible operation in this crate
pub type Result<T> = std::result::Result<T, Error>;
