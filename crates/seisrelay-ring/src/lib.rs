#![warn(missing_docs)]

//! seisrelay ring store: a fixed-size circular file addressed by
//! `sequence mod capacity`, persisting unacknowledged protocol records
//! across process restarts.

pub mod error;
pub mod ring;

pub use error::{RingError, RingResult};
pub use ring::{RingStore, BLOCK_SIZE, HEADER_SIZE, RING_MAGIC};
