//! Error types for the CD1.1 stack.

use thiserror::Error;

/// Result type alias for CD1.1 operations.
pub type Cd11Result<T> = Result<T, Cd11Error>;

/// Error variants for CD1.1 operations.
#[derive(Debug, Error)]
pub enum Cd11Error {
    /// A frame carried a type code this side does not understand.
    #[error("unknown frame type {raw:#06x}")]
    UnknownFrameType {
        /// The raw type code.
        raw: u32,
    },

    /// A frame ended before its declared contents.
    #[error("truncated frame: needed {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required by the declared layout.
        needed: usize,
        /// Bytes actually present.
        got: usize,
    },

    /// A frame declared a payload larger than the protocol allows.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u32,
        /// Maximum allowed payload size.
        max_size: u32,
    },

    /// A textual field exceeds its fixed wire width.
    #[error("field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Fixed wire width.
        max: usize,
    },

    /// An unexpected frame arrived during the connection handshake.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The station processor has been terminated.
    #[error("processor terminated")]
    Terminated,

    /// Ring store failure.
    #[error(transparent)]
    Ring(#[from] seisrelay_ring::RingError),

    /// Core data-structure failure.
    #[error(transparent)]
    Core(#[from] seisrelay_core::CoreError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
