#![warn(missing_docs)]

//! seisrelay core: zero-filled spans, gap lists, record model, station
//! config and operational events shared by the CD1.1 and ISI/IACP stacks.

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod gap;
pub mod record;
pub mod span;

pub use codec::{Codec, FetchOutcome, GapFetcher, LatencySource};
pub use config::StationConfig;
pub use error::{CoreError, CoreResult};
pub use event::{EventSender, LatencyStats, LatencyTracker, OpEvent};
pub use gap::{next_attempt_delay, GapEntry, GapList};
pub use record::{DecodedRecord, RenameMap, SeedName, Timestamp};
pub use span::{ZeroFilledSpan, DEFAULT_FILL_VALUE};
