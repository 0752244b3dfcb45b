//! Acknowledgement-gap tracking and the retransmission retry policy.
//!
//! A [`GapList`] holds the ordered, disjoint set of sequence ranges the peer
//! reports as missing, together with the last retransmission attempt per
//! range. The list is rebuilt inside `[low, high]` on every ACKNACK and
//! persisted so gaps survive process restarts.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// Maximum sequences fetched per backfill call, bounding burst size.
pub const FETCH_CHUNK: i64 = 60;

/// Ceiling on the per-gap retry interval.
pub const MAX_ATTEMPT_DELAY: Duration = Duration::from_secs(24 * 3600);

/// Retry interval added per day a gap lies in the past.
pub const DELAY_PER_DAY: Duration = Duration::from_secs(600);

/// One contiguous range of missing sequence numbers, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapEntry {
    /// First missing sequence.
    pub low_seq: i64,
    /// Last missing sequence.
    pub high_seq: i64,
    /// Wall-clock time of the last retransmission attempt, if any.
    pub last_attempt: Option<SystemTime>,
}

impl GapEntry {
    fn new(low_seq: i64, high_seq: i64) -> Self {
        Self {
            low_seq,
            high_seq,
            last_attempt: None,
        }
    }

    fn overlaps(&self, low: i64, high: i64) -> bool {
        self.low_seq <= high && self.high_seq >= low
    }
}

/// How long to wait between retransmission attempts for a gap that lies
/// `age` behind the realtime watermark.
///
/// Older gaps are retried less often: ten minutes per day of age, capped at
/// one day. A fresh gap retries immediately.
pub fn next_attempt_delay(age: Duration) -> Duration {
    let days = age.as_secs_f64() / 86_400.0;
    let delay = Duration::from_secs_f64(days * DELAY_PER_DAY.as_secs_f64());
    delay.min(MAX_ATTEMPT_DELAY)
}

/// Serialized snapshot of the gap state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GapSnapshot {
    highest_seq: i64,
    entries: Vec<GapEntry>,
}

/// Ordered, disjoint set of un-acked sequence ranges.
pub struct GapList {
    entries: Vec<GapEntry>,
    highest_seq: i64,
    path: Option<PathBuf>,
}

impl GapList {
    /// Creates an empty, non-persistent gap list.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            highest_seq: 0,
            path: None,
        }
    }

    /// Opens a persistent gap list, loading the snapshot at `path` when one
    /// exists. A corrupt snapshot is discarded with a warning rather than
    /// failing startup.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut list = Self::new();
        match std::fs::read(&path) {
            Ok(bytes) => match bincode::deserialize::<GapSnapshot>(&bytes) {
                Ok(snapshot) => {
                    info!(
                        path = %path.display(),
                        gaps = snapshot.entries.len(),
                        highest_seq = snapshot.highest_seq,
                        "loaded gap snapshot"
                    );
                    list.entries = snapshot.entries;
                    list.highest_seq = snapshot.highest_seq;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt gap snapshot, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::IoError(e)),
        }
        list.path = Some(path);
        Ok(list)
    }

    /// Highest sequence acknowledged or reported by the peer.
    pub fn highest_seq(&self) -> i64 {
        self.highest_seq
    }

    /// Number of gap ranges.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no sequences are missing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total count of missing sequence numbers.
    pub fn missing_sequences(&self) -> i64 {
        self.entries
            .iter()
            .map(|e| e.high_seq - e.low_seq + 1)
            .sum()
    }

    /// Snapshot of the current entries, for reporting.
    pub fn entries(&self) -> Vec<GapEntry> {
        self.entries.clone()
    }

    /// Replaces the view of missing sequences inside `[low, high]` with
    /// `gap_pairs`; entries outside the range are preserved (straddlers are
    /// clipped). Pairs overlapping a previous entry inherit its
    /// `last_attempt` so re-acked gaps keep their backoff state.
    pub fn receive_ack_set(&mut self, low: i64, high: i64, gap_pairs: &[(i64, i64)]) {
        let old = std::mem::take(&mut self.entries);
        let mut next: Vec<GapEntry> = Vec::with_capacity(old.len() + gap_pairs.len());

        for entry in &old {
            if entry.high_seq < low || entry.low_seq > high {
                next.push(*entry);
                continue;
            }
            if entry.low_seq < low {
                next.push(GapEntry {
                    low_seq: entry.low_seq,
                    high_seq: low - 1,
                    last_attempt: entry.last_attempt,
                });
            }
            if entry.high_seq > high {
                next.push(GapEntry {
                    low_seq: high + 1,
                    high_seq: entry.high_seq,
                    last_attempt: entry.last_attempt,
                });
            }
        }

        for &(g_low, g_high) in gap_pairs {
            let low_seq = g_low.max(low);
            let high_seq = g_high.min(high);
            if low_seq > high_seq {
                warn!(g_low, g_high, low, high, "ignoring gap pair outside ack range");
                continue;
            }
            let mut entry = GapEntry::new(low_seq, high_seq);
            entry.last_attempt = old
                .iter()
                .filter(|e| e.overlaps(low_seq, high_seq))
                .filter_map(|e| e.last_attempt)
                .max();
            next.push(entry);
        }

        next.sort_by_key(|e| e.low_seq);
        self.entries = next;
        if high > self.highest_seq {
            self.highest_seq = high;
        }
        debug!(
            low,
            high,
            gaps = self.entries.len(),
            highest_seq = self.highest_seq,
            "ack set applied"
        );
        self.persist();
    }

    /// Drops entries entirely below the retention horizon and returns how
    /// many were removed. Partially-below entries are clipped up to the
    /// horizon since the aged-out part can no longer be served.
    pub fn trim(&mut self, below_seq: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.high_seq >= below_seq);
        let removed = before - self.entries.len();
        for entry in &mut self.entries {
            if entry.low_seq < below_seq {
                entry.low_seq = below_seq;
            }
        }
        if removed > 0 {
            debug!(below_seq, removed, "trimmed aged-out gaps");
            self.persist();
        }
        removed
    }

    /// Selects the oldest gap whose backoff has elapsed, returning its
    /// bounded fetch chunk `(low, min(low + FETCH_CHUNK - 1, high))`.
    ///
    /// Age is estimated from sequence distance to the realtime watermark:
    /// one sequence covers ten seconds of data.
    pub fn next_fetch_chunk(&self, now: SystemTime) -> Option<(i64, i64)> {
        for entry in &self.entries {
            let behind = (self.highest_seq - entry.high_seq).max(0) as u64;
            let age = Duration::from_secs(behind * 10);
            let due = match entry.last_attempt {
                None => true,
                Some(at) => match now.duration_since(at) {
                    Ok(since) => since >= next_attempt_delay(age),
                    Err(_) => false,
                },
            };
            if due {
                let high = entry.high_seq.min(entry.low_seq + FETCH_CHUNK - 1);
                return Some((entry.low_seq, high));
            }
        }
        None
    }

    /// Stamps the attempt time on every entry intersecting `[low, high]`.
    pub fn mark_attempt(&mut self, low: i64, high: i64, at: SystemTime) {
        for entry in &mut self.entries {
            if entry.overlaps(low, high) {
                entry.last_attempt = Some(at);
            }
        }
        self.persist();
    }

    /// Writes the snapshot to disk via temp-file-and-rename. Persistence
    /// failures are logged, never fatal to the data path.
    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let snapshot = GapSnapshot {
            highest_seq: self.highest_seq,
            entries: self.entries.clone(),
        };
        let bytes = match bincode::serialize(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "gap snapshot serialize failed");
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        let result = std::fs::write(&tmp, &bytes).and_then(|_| std::fs::rename(&tmp, path));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "gap snapshot write failed");
        }
    }
}

impl Default for GapList {
    fn default() -> Self {
        Self::new()
    }
}
