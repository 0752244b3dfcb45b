//! Error types shared by the core data structures.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error variants for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An incoming record lies entirely outside the span's buffer window.
    /// The caller must clear the span or advance its window.
    #[error("record out of buffer: offset {offset}, len {len}, capacity {capacity}")]
    OutOfBuffer {
        /// Sample offset of the record relative to the span start.
        offset: i64,
        /// Number of samples in the record.
        len: usize,
        /// Span capacity in samples.
        capacity: usize,
    },

    /// A window was requested starting before the span's buffer start.
    #[error("window starts before buffer start: offset {offset}")]
    BeforeBufferStart {
        /// Negative sample offset of the requested window.
        offset: i64,
    },

    /// A window was requested extending past the span's buffer end.
    #[error("window past buffer end: offset {offset} + count {count} > capacity {capacity}")]
    PastBufferEnd {
        /// Sample offset of the requested window.
        offset: i64,
        /// Number of samples requested.
        count: usize,
        /// Span capacity in samples.
        capacity: usize,
    },

    /// A record's sample rate disagrees with the span it targets.
    #[error("sample rate mismatch on {seed_name}: span {expected} Hz, record {got} Hz")]
    RateMismatch {
        /// Channel the record was addressed to.
        seed_name: String,
        /// The span's sample rate.
        expected: f64,
        /// The record's sample rate.
        got: f64,
    },

    /// The compressed-record codec rejected its input.
    #[error("decode failed: {reason}")]
    DecodeFailed {
        /// Description of the decode failure.
        reason: String,
    },

    /// A malformed seed name or rename-map entry.
    #[error("invalid seed name: {name}")]
    InvalidSeedName {
        /// The offending name.
        name: String,
    },

    /// A station config switch line could not be parsed.
    #[error("invalid config switch {switch}: {reason}")]
    InvalidSwitch {
        /// The switch that failed to parse.
        switch: String,
        /// Description of the failure.
        reason: String,
    },

    /// Serialization of persistent state failed.
    #[error("serialization error: {reason}")]
    SerializationError {
        /// Description of the failure.
        reason: String,
    },

    /// The external gap-fill collaborator declined the request for now.
    #[error("gap fetch deferred: retry not due yet")]
    FetchTooSoon,

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
