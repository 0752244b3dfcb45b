//! Gap backfill worker.
//!
//! Periodically walks the gap list, asks the upstream fetcher to replay
//! missing sequence ranges, and trims gaps that have aged out of the ring's
//! retention window. Fetched ranges are handed to the session's retransmit
//! channel so the sender replays them from the ring.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use seisrelay_core::{EventSender, FetchOutcome, GapFetcher, GapList, OpEvent};
use seisrelay_ring::RingStore;

use crate::error::Cd11Result;

/// Upper bound on fetch chunks issued per polling round.
const MAX_CHUNKS_PER_ROUND: usize = 16;

/// Walks the gap list and drives upstream refetches.
pub struct GapFillWorker {
    gaps: Arc<Mutex<GapList>>,
    ring: Arc<RingStore>,
    fetcher: Arc<dyn GapFetcher>,
    events: EventSender,
    terminate: watch::Receiver<bool>,
    retransmit: Option<mpsc::Sender<(i64, i64)>>,
    poll_interval: Duration,
}

impl GapFillWorker {
    /// Creates a worker polling at `poll_interval`.
    pub fn new(
        gaps: Arc<Mutex<GapList>>,
        ring: Arc<RingStore>,
        fetcher: Arc<dyn GapFetcher>,
        events: EventSender,
        terminate: watch::Receiver<bool>,
        retransmit: Option<mpsc::Sender<(i64, i64)>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gaps,
            ring,
            fetcher,
            events,
            terminate,
            retransmit,
            poll_interval,
        }
    }

    /// Runs until terminated.
    pub async fn run(mut self) -> Cd11Result<()> {
        loop {
            if *self.terminate.borrow() {
                break;
            }
            self.run_round(SystemTime::now()).await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.terminate.changed() => {}
            }
        }
        info!("backfill worker stopped");
        Ok(())
    }

    /// One polling round: trim aged gaps, then fetch eligible chunks.
    async fn run_round(&mut self, now: SystemTime) {
        if let Some((low, _)) = self.ring.readable_range() {
            let removed = self.gaps.lock().trim(low);
            if removed > 0 {
                debug!(removed, below_seq = low, "trimmed unrecoverable gaps");
                self.events.emit(OpEvent::GapsTrimmed {
                    removed,
                    below_seq: low,
                });
            }
        }

        let mut last_chunk: Option<(i64, i64)> = None;
        for _ in 0..MAX_CHUNKS_PER_ROUND {
            let chunk = {
                let gaps = self.gaps.lock();
                gaps.next_fetch_chunk(now)
            };
            let Some((low, high)) = chunk else {
                break;
            };
            // A chunk the fetcher could not fill stays first in line; stop
            // rather than hammer it within one round.
            if last_chunk == Some((low, high)) {
                break;
            }
            last_chunk = Some((low, high));

            match self.fetcher.fetch_gap(low, high).await {
                Ok(FetchOutcome::Sent(records)) => {
                    debug!(low, high, records, "gap range refetched");
                    self.gaps.lock().mark_attempt(low, high, now);
                    if let Some(tx) = &self.retransmit {
                        if tx.send((low, high)).await.is_err() {
                            debug!("retransmit channel closed");
                            break;
                        }
                    }
                }
                Ok(FetchOutcome::TooSoon) => {
                    debug!(low, high, "fetcher declined, range not yet eligible");
                    break;
                }
                Err(e) => {
                    warn!(low, high, error = %e, "gap fetch failed");
                    self.gaps.lock().mark_attempt(low, high, now);
                    break;
                }
            }
        }
    }
}
