//! Shared fixtures for unit tests: synthetic module images, a scripted safe-point decoder,
//! stack snapshots and EH-table encoding.

mod image;

pub use ehinfo::{encode_native_unsigned, EhClauseSpec, EhTableBuilder};
pub use gcinfo::{EnumerationQuery, MockGcDecoder, MockGcInfo};
pub use image::{BuiltImage, ImageBuilder, MethodSpec, TestArch, CODE_RVA};
pub use stack::TestStack;
