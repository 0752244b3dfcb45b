//! Collaborator traits: the compressed-record codec, the historical-data
//! fetch service, and the realtime latency source.
//!
//! These are the seams to external systems. MiniSEED/Steim decoding and the
//! upstream query service are consumed through them, never respecified.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::record::DecodedRecord;

/// Decodes one compressed seismic record into channel, time, rate and
/// samples. Internals (Steim et al.) are a black box.
pub trait Codec: Send + Sync {
    /// Decodes `bytes`, or reports why they are undecodable.
    fn decode(&self, bytes: &[u8]) -> CoreResult<DecodedRecord>;
}

/// Outcome of a bounded backfill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The collaborator supplied this many records for the range.
    Sent(u64),
    /// The collaborator declined for now; stop this backfill round.
    TooSoon,
}

/// External query service that re-supplies historical records for a gap.
#[async_trait]
pub trait GapFetcher: Send + Sync {
    /// Requests records for the inclusive sequence range `[low_seq, high_seq]`.
    async fn fetch_gap(&self, low_seq: i64, high_seq: i64) -> CoreResult<FetchOutcome>;
}

/// Source of a station's current realtime delivery latency.
#[async_trait]
pub trait LatencySource: Send + Sync {
    /// Current latency for `station`: how far its newest delivered data lags
    /// wall-clock time.
    async fn latency(&self, station: &str) -> CoreResult<Duration>;
}
