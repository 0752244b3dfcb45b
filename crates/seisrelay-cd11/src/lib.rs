#![warn(missing_docs)]

//! seisrelay CD1.1 stack: frame codec, per-station processor, outbound
//! session, and the gap backfill worker.
//!
//! The station processor turns decoded records into fixed-cadence data
//! frames and writes them to the ring. The session streams ring contents
//! to the collection center and feeds peer ACKNACKs back into the gap
//! list; the backfill worker turns gaps into upstream refetches.

pub mod backfill;
pub mod error;
pub mod frame;
pub mod session;
pub mod station;

pub use backfill::GapFillWorker;
pub use error::{Cd11Error, Cd11Result};
pub use frame::{AckBody, ChannelSubframe, Frame, FrameBody, FrameType};
pub use session::{Cd11Session, ReconnectBackoff, SessionConfig};
pub use station::{ProcessorState, StationProcessor};
