use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Queries against a module image produce two kinds of outcome. Answers such as "this PC
/// belongs to another module", "this method has no EH table" or "hijacking is refused here"
/// are ordinary values (`Ok(None)`, `Ok(false)`). Everything in this enum signals that the
/// compiled metadata and this decoder disagree about the format, which a stack walker cannot
/// recover from. None of these conditions are retried anywhere in the crate.
///
/// # Error Categories
///
/// ## Image Decoding Errors
/// - [`Error::Malformed`] - Corrupted or inconsistent unwind / EH / table data
/// - [`Error::OutOfBounds`] - Attempted to read beyond the mapped image
/// - [`Error::NotSupported`] - A valid encoding this decoder does not handle
/// - [`Error::InvalidCodeAddress`] - Managed PC without a covering function-table entry
/// - [`Error::InvalidClauseKind`] - Unknown exception clause kind
///
/// ## Stack Walking Errors
/// - [`Error::LiveSlotEnumeration`] - The safe-point decoder failed to report live slots
/// - [`Error::RegisterUnavailable`] - A register needed for unwinding has no known location
/// - [`Error::UnreadableMemory`] - Stack memory required for unwinding could not be read
///
/// ## External Errors
/// - [`Error::GoblinErr`] - PE parsing errors from goblin crate
///
/// # Examples
///
/// ```rust,no_run
/// use nativescope::{arch::Amd64, Error, ModuleRegistration};
///
/// let image_bytes = std::fs::read("mapped_image.bin")?;
/// match ModuleRegistration::from_pe_headers::<Amd64>(0x1_4000_0000, &image_bytes) {
///     Ok(registration) => println!("{:?}", registration),
///     Err(Error::GoblinErr(e)) => eprintln!("Not a PE image: {}", e),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged and could not be decoded.
    ///
    /// The error includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading the image.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The encoding is valid but is not handled by this decoder.
    ///
    /// Raised for chained AMD64 unwind info, packed ARM64 unwind data and x86 frames
    /// interrupted in the middle of a prolog or epilog.
    #[error("Not supported - {0}")]
    NotSupported(&'static str),

    /// A PC inside the managed code range is not covered by any function-table entry.
    ///
    /// The function table is sorted and covers the whole managed range, so this can only
    /// happen with a corrupted or mismatched table.
    #[error("Invalid code address {0:#x}")]
    InvalidCodeAddress(u64),

    /// An exception clause uses a kind value outside of typed / fault / filter.
    #[error("Invalid exception clause kind {0}")]
    InvalidClauseKind(u32),

    /// The safe-point decoder could not enumerate the live slots of a method.
    #[error("Failed to enumerate live GC slots at code offset {code_offset:#x}")]
    LiveSlotEnumeration {
        /// Offset from the start of the root method
        code_offset: u32,
    },

    /// A register value is needed but the register display has no location for it.
    #[error("No location recorded for register {0}")]
    RegisterUnavailable(&'static str),

    /// Stack memory at the given address could not be read.
    #[error("Unable to read memory at {0:#x}")]
    UnreadableMemory(u64),

    /// Wrapper for errors from the goblin crate.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),
}
