//! Error types for the ring store.

use thiserror::Error;

/// Result type alias for ring operations.
pub type RingResult<T> = Result<T, RingError>;

/// Error variants for ring operations.
#[derive(Debug, Error)]
pub enum RingError {
    /// The sequence is too old to fit the ring's retention window. Writing
    /// it would collide with a slot holding a newer outstanding record.
    #[error("sequence {sequence} too old for ring (last_seq_out {last_seq_out}, capacity {max_records})")]
    StaleSequence {
        /// The rejected sequence.
        sequence: i64,
        /// The ring's current watermark.
        last_seq_out: i64,
        /// Ring capacity in records.
        max_records: i32,
    },

    /// The sequence is outside the readable window.
    #[error("sequence {sequence} not in ring (readable window [{low}, {high}])")]
    NotFound {
        /// The requested sequence.
        sequence: i64,
        /// Oldest readable sequence.
        low: i64,
        /// Newest readable sequence.
        high: i64,
    },

    /// A record exceeds the fixed slot size.
    #[error("record of {size} bytes exceeds slot size {slot_size}")]
    RecordTooLarge {
        /// The record size in bytes.
        size: usize,
        /// The slot size in bytes.
        slot_size: usize,
    },

    /// The ring file header is unreadable.
    #[error("invalid ring header: {reason}")]
    InvalidHeader {
        /// Description of the problem.
        reason: String,
    },

    /// Negative sequence numbers are not addressable.
    #[error("negative sequence {sequence}")]
    NegativeSequence {
        /// The offending sequence.
        sequence: i64,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
