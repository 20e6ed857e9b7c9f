//! Registration-time checks for module images.
//!
//! Queries assume the function table is sorted, that every funclet has a root entry in
//! front of it and that reverse-P/Invoke markers only sit on roots. Those properties come
//! from the compiler and are not re-checked per query. [`RegistrationConfig`] decides how
//! much of that is verified once, when a [`crate::CodeManager`] is created.

/// Configuration for image validation during code-manager registration
///
/// Each check walks the function table once. Skipping them is safe for images produced by a
/// matching compiler; enabling them turns a corrupted table into an error at registration
/// instead of an error (or a wrong answer) during a stack walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct RegistrationConfig {
    /// Check that the function table itself and every entry's unwind blob lie inside the image
    pub enable_bounds_validation: bool,
    /// Check that entries are sorted by start address and do not overlap
    pub enable_table_order_validation: bool,
    /// Read every classification byte: valid kind, funclets preceded by a root, and
    /// reverse-P/Invoke markers on roots only
    pub enable_unwind_tail_validation: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self::minimal()
    }
}

impl RegistrationConfig {
    /// Creates a configuration that performs no checks at registration
    ///
    /// **Warning**: a corrupted table is then only noticed by the queries that touch it.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enable_bounds_validation: false,
            enable_table_order_validation: false,
            enable_unwind_tail_validation: false,
        }
    }

    /// Creates a configuration that only checks the table location
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            enable_bounds_validation: true,
            enable_table_order_validation: false,
            enable_unwind_tail_validation: false,
        }
    }

    /// Creates a configuration with all checks enabled
    #[must_use]
    pub fn strict() -> Self {
        Self {
            enable_bounds_validation: true,
            enable_table_order_validation: true,
            enable_unwind_tail_validation: true,
        }
    }

    /// Returns `true` if registration needs to visit every function-table entry
    #[must_use]
    pub fn walks_entries(&self) -> bool {
        self.enable_bounds_validation
            || self.enable_table_order_validation
            || self.enable_unwind_tail_validation
    }
}
