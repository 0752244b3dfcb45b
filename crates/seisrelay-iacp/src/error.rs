//! Error types for the IACP stack.

use thiserror::Error;

/// Result type alias for IACP operations.
pub type IacpResult<T> = Result<T, IacpError>;

/// Error variants for IACP operations.
#[derive(Debug, Error)]
pub enum IacpError {
    /// The frame did not start with the `IACP` signature.
    #[error("bad frame signature {got:02x?}")]
    BadSignature {
        /// The four bytes actually read.
        got: [u8; 4],
    },

    /// A frame or TLV sequence ended before its declared contents.
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

    /// A payload type code outside every defined range.
    #[error("unknown payload type {raw}")]
    UnknownPayloadType {
        /// The raw type code.
        raw: u32,
    },

    /// A TLV field declared a length past the end of the payload.
    #[error("TLV tag {tag} overruns payload: declared {len}, {remaining} left")]
    TlvOverrun {
        /// The offending tag.
        tag: u32,
        /// Declared value length.
        len: u32,
        /// Bytes remaining in the payload.
        remaining: usize,
    },

    /// A TLV value had the wrong size for its tag.
    #[error("TLV tag {tag} has bad value length {len}")]
    BadTlvValue {
        /// The offending tag.
        tag: u32,
        /// Actual value length.
        len: usize,
    },

    /// The server's handshake response was unusable.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The peer sent an alert; the connection is closing.
    #[error("peer alert: {code:?}")]
    PeerAlert {
        /// The alert code received.
        code: crate::frame::AlertCode,
    },

    /// Core collaborator failure.
    #[error(transparent)]
    Core(#[from] seisrelay_core::CoreError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
