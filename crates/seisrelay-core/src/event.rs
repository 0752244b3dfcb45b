//! Operational event feed and latency statistics.
//!
//! Workers report noteworthy conditions as typed events on a bounded
//! channel instead of mutating global registries. A slow status consumer
//! must never stall the data path, so emission is non-blocking and drops
//! on overflow.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// Which backoff loop hit its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// Connection attempts are being refused.
    ConnectionRefused,
    /// Connection attempts are timing out.
    ConnectionTimeout,
}

/// Operational events surfaced to the status feed.
#[derive(Debug, Clone, PartialEq)]
pub enum OpEvent {
    /// An ACKNACK frame was processed.
    AckReceived {
        /// Low end of the acknowledged range.
        low: i64,
        /// High end of the acknowledged range.
        high: i64,
        /// Number of gap pairs the peer reported.
        gap_count: usize,
    },
    /// The peer sent an ALERT; the session is terminating.
    AlertReceived {
        /// Alert message text.
        message: String,
    },
    /// A frame was written to the ring and is available to send.
    FrameAvailable {
        /// The frame's sequence number.
        sequence: i64,
    },
    /// A write was rejected because its sequence aged out of the ring.
    StaleSequenceRejected {
        /// The rejected sequence.
        sequence: i64,
        /// The ring's current watermark.
        last_seq_out: i64,
    },
    /// Gap entries aged out of the retention window were dropped.
    GapsTrimmed {
        /// Number of entries removed.
        removed: usize,
        /// The retention horizon applied.
        below_seq: i64,
    },
    /// A reconnect backoff loop crossed its delay ceiling.
    BackoffCeiling {
        /// Which loop hit the ceiling.
        kind: BackoffKind,
        /// The capped delay now in effect.
        delay: Duration,
    },
    /// The adaptive throttle changed its send rate.
    ThrottleChanged {
        /// New rate in bytes per second.
        rate_bps: u32,
    },
    /// A span had to be cleared after an out-of-buffer condition.
    SpanCleared {
        /// The affected channel.
        seed_name: String,
    },
}

/// Non-blocking sender half of the event feed.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<OpEvent>,
}

impl EventSender {
    /// Creates the feed with the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OpEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Creates a sender whose events go nowhere, for tests and tools that
    /// do not consume the feed.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Emits an event without blocking; drops it if the feed is full.
    pub fn emit(&self, event: OpEvent) {
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(event) {
            warn!(?dropped, "event feed full, dropping event");
        }
    }
}

/// Min/max/average delivery latency for a reference channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    /// Lowest observed latency in seconds.
    pub min_secs: f64,
    /// Highest observed latency in seconds.
    pub max_secs: f64,
    /// Mean latency in seconds.
    pub avg_secs: f64,
    /// Number of samples since the last reset.
    pub samples: u64,
}

/// Accumulates delivery latency samples for operational reporting.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    min_secs: f64,
    max_secs: f64,
    sum_secs: f64,
    samples: u64,
}

impl LatencyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one latency observation.
    pub fn record(&mut self, latency_secs: f64) {
        if self.samples == 0 || latency_secs < self.min_secs {
            self.min_secs = latency_secs;
        }
        if self.samples == 0 || latency_secs > self.max_secs {
            self.max_secs = latency_secs;
        }
        self.sum_secs += latency_secs;
        self.samples += 1;
    }

    /// Current statistics snapshot.
    pub fn snapshot(&self) -> LatencyStats {
        LatencyStats {
            min_secs: self.min_secs,
            max_secs: self.max_secs,
            avg_secs: if self.samples > 0 {
                self.sum_secs / self.samples as f64
            } else {
                0.0
            },
            samples: self.samples,
        }
    }

    /// Clears the accumulated statistics.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (sender, mut rx) = EventSender::channel(8);
        sender.emit(OpEvent::FrameAvailable { sequence: 42 });
        assert_eq!(rx.recv().await, Some(OpEvent::FrameAvailable { sequence: 42 }));
    }

    #[tokio::test]
    async fn test_full_feed_drops_instead_of_blocking() {
        let (sender, mut rx) = EventSender::channel(1);
        sender.emit(OpEvent::FrameAvailable { sequence: 1 });
        sender.emit(OpEvent::FrameAvailable { sequence: 2 });
        assert_eq!(rx.recv().await, Some(OpEvent::FrameAvailable { sequence: 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_latency_tracker() {
        let mut tracker = LatencyTracker::new();
        tracker.record(5.0);
        tracker.record(15.0);
        tracker.record(10.0);
        let stats = tracker.snapshot();
        assert_eq!(stats.min_secs, 5.0);
        assert_eq!(stats.max_secs, 15.0);
        assert_eq!(stats.avg_secs, 10.0);
        assert_eq!(stats.samples, 3);
    }

    #[test]
    fn test_latency_tracker_reset() {
        let mut tracker = LatencyTracker::new();
        tracker.record(5.0);
        tracker.reset();
        assert_eq!(tracker.snapshot(), LatencyStats::default());
    }
}
