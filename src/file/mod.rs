//! Byte-level access to module images and thread memory.
//!
//! # Key Components
//!
//! - [`crate::file::parser::Parser`] - Bounds-checked cursor used by every decoder in the crate
//! - [`crate::file::io`] - Little-endian primitive reads
//! - [`crate::file::memory::MemoryReader`] - Reads of the walked thread's stack
//! - [`crate::file::memory::MemoryRegion`] - Slice-backed [`crate::file::memory::MemoryReader`]

pub mod io;
pub mod memory;
pub mod parser;

pub use memory::{MemoryReader, MemoryRegion};
pub use parser::Parser;
