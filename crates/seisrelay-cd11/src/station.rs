//! Station processor: turns per-channel spans into framed ring output.
//!
//! One processor owns all spans for a station. Records are queued in
//! arbitrary order; whenever every channel's next 10-second window is
//! fill-free the processor emits one data frame covering all channels,
//! writes it through the frame codec into the ring, and shifts the spans.
//! Frame sequence numbers are derived from time (`epoch_seconds / 10`) so a
//! backfilled window lands at the same sequence it originally had.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use seisrelay_core::{
    Codec, CoreError, DecodedRecord, EventSender, LatencyStats, LatencyTracker, OpEvent,
    SeedName, StationConfig, Timestamp, ZeroFilledSpan, DEFAULT_FILL_VALUE,
};
use seisrelay_ring::{RingError, RingStore};

use crate::error::{Cd11Error, Cd11Result};
use crate::frame::{ChannelSubframe, Frame, FrameBody};

/// Output cadence in seconds: one frame covers this much data.
pub const FRAME_SECS: i64 = 10;
/// Records required before the processor starts emitting.
pub const WARMUP_RECORDS: u64 = 10;
/// How far ahead of the output clock incoming data must be to trigger
/// catch-up, in seconds.
pub const CATCHUP_THRESHOLD_SECS: f64 = 180.0;

/// Processor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Absorbing records, not yet emitting.
    Warmup,
    /// Normal cadence: emit whenever the next window is ready.
    Streaming,
    /// Output clock is far behind incoming data; walking forward.
    Catchup,
    /// Shut down; records are rejected.
    Terminated,
}

/// Per-station frame builder and output clock.
pub struct StationProcessor {
    config: StationConfig,
    ring: Arc<RingStore>,
    events: EventSender,
    spans: HashMap<String, ZeroFilledSpan>,
    state: ProcessorState,
    next_output_time: Option<Timestamp>,
    records_seen: u64,
    reference_channel: Option<String>,
    latency: LatencyTracker,
}

impl StationProcessor {
    /// Creates a processor writing frames into `ring`.
    pub fn new(config: StationConfig, ring: Arc<RingStore>, events: EventSender) -> Self {
        Self {
            config,
            ring,
            events,
            spans: HashMap::new(),
            state: ProcessorState::Warmup,
            next_output_time: None,
            records_seen: 0,
            reference_channel: None,
            latency: LatencyTracker::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// The output clock: start of the next frame window.
    pub fn next_output_time(&self) -> Option<Timestamp> {
        self.next_output_time
    }

    /// Delivery-latency statistics for the reference channel.
    pub fn latency_stats(&self) -> LatencyStats {
        self.latency.snapshot()
    }

    /// Clears the latency statistics.
    pub fn reset_latency(&mut self) {
        self.latency.reset();
    }

    /// Queues one decoded record and emits any frames that became ready.
    ///
    /// Returns the sequences of frames written to the ring by this call.
    pub fn queue(&mut self, record: DecodedRecord) -> Cd11Result<Vec<i64>> {
        if self.state == ProcessorState::Terminated {
            return Err(Cd11Error::Terminated);
        }

        let name = self.renamed(&record.seed_name);
        let key = name.to_string();
        if self.reference_channel.is_none() {
            self.reference_channel = Some(key.clone());
        }

        let sec_depth = self.config.sec_depth;
        let span = self.spans.entry(key.clone()).or_insert_with(|| {
            debug!(channel = %key, rate = record.rate, "creating span");
            ZeroFilledSpan::new(name, record.rate, sec_depth, DEFAULT_FILL_VALUE)
        });

        match span.add_record(record.start, record.rate, &record.samples) {
            Ok(_) => {}
            Err(CoreError::OutOfBuffer { .. }) => {
                // The record falls entirely outside the buffer: restart the
                // span at the record's time.
                self.events.emit(OpEvent::SpanCleared {
                    seed_name: key.clone(),
                });
                span.clear();
                span.add_record(record.start, record.rate, &record.samples)?;
            }
            Err(e) => {
                warn!(channel = %key, error = %e, "record dropped");
                return Ok(Vec::new());
            }
        }
        self.records_seen += 1;

        if self.state == ProcessorState::Warmup {
            if self.records_seen < WARMUP_RECORDS {
                return Ok(Vec::new());
            }
            self.state = ProcessorState::Streaming;
            self.next_output_time = Some(self.initial_output_time());
            info!(
                station = %self.config.station,
                start = %self.next_output_time.unwrap_or_default(),
                "warmup complete, streaming"
            );
        }

        let mut emitted = Vec::new();
        let Some(mut next) = self.next_output_time else {
            return Ok(emitted);
        };

        if record.start.diff_secs(next) > CATCHUP_THRESHOLD_SECS {
            self.state = ProcessorState::Catchup;
            info!(
                station = %self.config.station,
                behind_secs = record.start.diff_secs(next),
                "entering catch-up"
            );
            while record.start.diff_secs(next) > FRAME_SECS as f64 {
                if self.window_ready(next) {
                    if let Some(seq) = self.emit_frame(next) {
                        emitted.push(seq);
                    }
                }
                self.shift_behind(next);
                next = next.add_secs_f64(FRAME_SECS as f64);
            }
            self.state = ProcessorState::Streaming;
        }

        while self.window_ready(next) {
            if let Some(seq) = self.emit_frame(next) {
                emitted.push(seq);
            }
            self.shift_behind(next);
            next = next.add_secs_f64(FRAME_SECS as f64);
        }

        self.next_output_time = Some(next);
        Ok(emitted)
    }

    /// Decodes one raw compressed record through `codec` and queues it.
    ///
    /// Undecodable records are logged and dropped; only a terminated
    /// processor is an error.
    pub fn queue_raw(&mut self, codec: &dyn Codec, bytes: &[u8]) -> Cd11Result<Vec<i64>> {
        match codec.decode(bytes) {
            Ok(record) => self.queue(record),
            Err(e) => {
                warn!(station = %self.config.station, error = %e, "undecodable record dropped");
                Ok(Vec::new())
            }
        }
    }

    /// Stops the processor and flushes the ring.
    pub fn terminate(&mut self) -> Cd11Result<()> {
        self.state = ProcessorState::Terminated;
        self.ring.flush()?;
        info!(station = %self.config.station, "processor terminated");
        Ok(())
    }

    fn renamed(&self, name: &SeedName) -> SeedName {
        SeedName {
            network: name.network.clone(),
            station: name.station.clone(),
            location: self.config.location_map.apply(&name.location).to_string(),
            channel: self.config.channel_map.apply(&name.channel).to_string(),
        }
    }

    /// First output boundary: the frame grid point at or just after the
    /// earliest span start (within half a sample period counts as "at").
    fn initial_output_time(&self) -> Timestamp {
        let earliest = self
            .spans
            .values()
            .filter_map(|s| s.start())
            .min()
            .unwrap_or_else(Timestamp::now);
        let max_rate = self
            .spans
            .values()
            .map(|s| s.rate())
            .fold(1.0_f64, f64::max);
        let aligned = earliest.align_down(FRAME_SECS);
        if earliest.diff_secs(aligned) > 0.5 / max_rate {
            aligned.add_secs_f64(FRAME_SECS as f64)
        } else {
            aligned
        }
    }

    /// True when every known channel's window at `t` is fill-free.
    fn window_ready(&self, t: Timestamp) -> bool {
        let mut any = false;
        for span in self.spans.values() {
            if span.is_empty() {
                continue;
            }
            any = true;
            if span.has_fill(t, FRAME_SECS as f64) {
                return false;
            }
        }
        any
    }

    /// Builds and writes one frame at `t`; returns its sequence on success.
    fn emit_frame(&mut self, t: Timestamp) -> Option<i64> {
        let sequence = t.as_micros() / (FRAME_SECS * 1_000_000);
        let mut subframes = Vec::new();
        let mut cleared = Vec::new();

        for (key, span) in &mut self.spans {
            if span.is_empty() {
                continue;
            }
            let count = (FRAME_SECS as f64 * span.rate()).round() as usize;
            match span.window(t, count) {
                Ok(samples) => subframes.push(ChannelSubframe {
                    name: key.clone(),
                    start: t,
                    rate: span.rate(),
                    samples,
                }),
                Err(e) => {
                    // Window build failed: treat the span as empty and let the
                    // channel rejoin when fresh data arrives.
                    warn!(channel = %key, error = %e, "window build failed, clearing span");
                    span.clear();
                    cleared.push(key.clone());
                }
            }
        }
        for key in cleared {
            self.events.emit(OpEvent::SpanCleared { seed_name: key });
        }
        if subframes.is_empty() {
            return None;
        }

        let frame = Frame {
            creator: self.config.creator.clone(),
            destination: self.config.destination.clone(),
            sequence,
            body: FrameBody::Data(subframes),
        };
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(sequence, error = %e, "frame encode failed");
                return None;
            }
        };

        match self.ring.write(sequence, &bytes) {
            Ok(()) => {
                if let Some(reference) = &self.reference_channel {
                    if self.spans.contains_key(reference) {
                        self.latency.record(Timestamp::now().diff_secs(t));
                    }
                }
                self.events.emit(OpEvent::FrameAvailable { sequence });
                Some(sequence)
            }
            Err(RingError::StaleSequence { last_seq_out, .. }) => {
                warn!(sequence, last_seq_out, "frame too old for ring, dropped");
                self.events.emit(OpEvent::StaleSequenceRejected {
                    sequence,
                    last_seq_out,
                });
                None
            }
            Err(e) => {
                warn!(sequence, error = %e, "ring write failed");
                None
            }
        }
    }

    /// Shifts every span whose window has been consumed up to `t`. Spans
    /// anchored ahead of the clock (data from the future) are left alone.
    /// A span left with nothing but fill has gone silent: it is cleared so
    /// it stops blocking the ready check until fresh data re-anchors it.
    fn shift_behind(&mut self, t: Timestamp) {
        let mut decayed = Vec::new();
        for (key, span) in &mut self.spans {
            match span.start() {
                Some(start) if start.diff_secs(t) < FRAME_SECS as f64 => {
                    span.shift_start(FRAME_SECS as f64);
                    if !span.is_empty() && span.is_all_fill() {
                        debug!(channel = %key, "span decayed to fill, clearing");
                        span.clear();
                        decayed.push(key.clone());
                    }
                }
                _ => {}
            }
        }
        for key in decayed {
            self.events.emit(OpEvent::SpanCleared { seed_name: key });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seisrelay_core::SeedName;

    const BASE: f64 = 1_700_000_000.0;

    fn t(secs: f64) -> Timestamp {
        Timestamp::from_secs_f64(BASE + secs)
    }

    fn record(channel: &str, secs: f64, rate: f64, samples: Vec<i32>) -> DecodedRecord {
        DecodedRecord {
            seed_name: SeedName::parse(&format!("IU.ANMO.00.{channel}")).unwrap(),
            start: t(secs),
            rate,
            samples,
        }
    }

    fn make_processor(dir: &tempfile::TempDir) -> (StationProcessor, Arc<RingStore>) {
        let ring = Arc::new(RingStore::open(dir.path().join("test.ring"), 32, 100).unwrap());
        let config = StationConfig::parse("ANMO", "-secdepth 120 -creator TEST -destination 0")
            .unwrap();
        let processor = StationProcessor::new(config, Arc::clone(&ring), EventSender::discard());
        (processor, ring)
    }

    /// Feeds `secs` seconds of 1-second records on two channels.
    fn feed_two_channels(processor: &mut StationProcessor, secs: usize) -> Vec<i64> {
        let mut emitted = Vec::new();
        for i in 0..secs {
            let data: Vec<i32> = (0..100).map(|j| (i * 100 + j) as i32).collect();
            emitted.extend(
                processor
                    .queue(record("BHZ", i as f64, 100.0, data.clone()))
                    .unwrap(),
            );
            emitted.extend(processor.queue(record("BHN", i as f64, 100.0, data)).unwrap());
        }
        emitted
    }

    #[test]
    fn test_warmup_holds_output() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        for i in 0..4 {
            let emitted = processor
                .queue(record("BHZ", i as f64, 100.0, vec![0; 100]))
                .unwrap();
            assert!(emitted.is_empty());
        }
        assert_eq!(processor.state(), ProcessorState::Warmup);
    }

    #[test]
    fn test_basic_streaming_two_channels() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, ring) = make_processor(&dir);
        let emitted = feed_two_channels(&mut processor, 30);

        assert_eq!(processor.state(), ProcessorState::Streaming);
        // 30s of data on both channels: one frame per 10-second window.
        assert_eq!(emitted.len(), 3);
        let base_seq = (BASE as i64) / FRAME_SECS;
        assert_eq!(emitted, vec![base_seq, base_seq + 1, base_seq + 2]);

        let slot = ring.read(base_seq).unwrap();
        let frame = Frame::decode(&slot).unwrap();
        assert_eq!(frame.creator, "TEST");
        assert_eq!(frame.sequence, base_seq);
        let FrameBody::Data(subframes) = &frame.body else {
            panic!("expected data frame");
        };
        assert_eq!(subframes.len(), 2);
        for sub in subframes {
            assert_eq!(sub.samples.len(), 1000);
            assert!(!sub.samples.contains(&DEFAULT_FILL_VALUE));
        }
        let bhz = subframes.iter().find(|s| s.name.ends_with("BHZ")).unwrap();
        assert_eq!(bhz.samples, (0..1000).collect::<Vec<i32>>());
    }

    #[test]
    fn test_hole_blocks_emission_until_filled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        let mut emitted = Vec::new();
        // Seconds 0..12 except second 3.
        for i in 0..12 {
            if i == 3 {
                continue;
            }
            emitted.extend(
                processor
                    .queue(record("BHZ", i as f64, 100.0, vec![1; 100]))
                    .unwrap(),
            );
        }
        assert!(emitted.is_empty());
        // The late record closes the hole; the first window emits.
        let late = processor
            .queue(record("BHZ", 3.0, 100.0, vec![1; 100]))
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0], (BASE as i64) / FRAME_SECS);
    }

    #[test]
    fn test_channel_rename_applied() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Arc::new(RingStore::open(dir.path().join("test.ring"), 32, 100).unwrap());
        let config = StationConfig::parse(
            "ANMO",
            "-secdepth 120 -creator TEST -destination 0 -cmap BHZ=HHZ -lmap 00=10",
        )
        .unwrap();
        let mut processor =
            StationProcessor::new(config, Arc::clone(&ring), EventSender::discard());

        let mut emitted = Vec::new();
        for i in 0..20 {
            emitted.extend(
                processor
                    .queue(record("BHZ", i as f64, 100.0, vec![5; 100]))
                    .unwrap(),
            );
        }
        assert!(!emitted.is_empty());
        let frame = Frame::decode(&ring.read(emitted[0]).unwrap()).unwrap();
        let FrameBody::Data(subframes) = &frame.body else {
            panic!("expected data frame");
        };
        assert_eq!(subframes[0].name, "IU.ANMO.10.HHZ");
    }

    #[test]
    fn test_catchup_advances_clock() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        for i in 0..15 {
            processor
                .queue(record("BHZ", i as f64, 100.0, vec![1; 100]))
                .unwrap();
        }
        let before = processor.next_output_time().unwrap();
        // A record ten minutes ahead forces catch-up.
        processor
            .queue(record("BHZ", 600.0, 100.0, vec![2; 100]))
            .unwrap();
        assert_eq!(processor.state(), ProcessorState::Streaming);
        let after = processor.next_output_time().unwrap();
        assert!(after.diff_secs(before) > 500.0);
        // The clock is now within one frame of the new data.
        assert!(t(600.0).diff_secs(after) <= FRAME_SECS as f64);
    }

    #[test]
    fn test_out_of_buffer_record_restarts_span() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        processor
            .queue(record("BHZ", 0.0, 100.0, vec![1; 100]))
            .unwrap();
        // Entirely before the anchored window: span restarts there.
        let emitted = processor
            .queue(record("BHZ", -500.0, 100.0, vec![2; 100]))
            .unwrap();
        assert!(emitted.is_empty());
        assert_eq!(processor.state(), ProcessorState::Warmup);
    }

    #[test]
    fn test_terminated_rejects_records() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        processor.terminate().unwrap();
        let err = processor
            .queue(record("BHZ", 0.0, 100.0, vec![0; 100]))
            .unwrap_err();
        assert!(matches!(err, Cd11Error::Terminated));
    }

    #[test]
    fn test_silent_channel_resumes_output() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, ring) = make_processor(&dir);
        feed_two_channels(&mut processor, 30);

        // BHN sends a few more seconds then goes silent; BHZ keeps flowing.
        for i in 30..35 {
            processor
                .queue(record("BHN", i as f64, 100.0, vec![2; 100]))
                .unwrap();
        }
        let mut emitted = Vec::new();
        for i in 30..300 {
            emitted.extend(
                processor
                    .queue(record("BHZ", i as f64, 100.0, vec![3; 100]))
                    .unwrap(),
            );
        }
        assert!(
            !emitted.is_empty(),
            "output never resumed after a channel went silent"
        );
        // The resumed frames carry the surviving channel only.
        let frame = Frame::decode(&ring.read(*emitted.last().unwrap()).unwrap()).unwrap();
        let FrameBody::Data(subframes) = &frame.body else {
            panic!("expected data frame");
        };
        assert_eq!(subframes.len(), 1);
        assert!(subframes[0].name.ends_with("BHZ"));
    }

    struct OneByteChannelCodec;

    impl Codec for OneByteChannelCodec {
        fn decode(&self, bytes: &[u8]) -> seisrelay_core::CoreResult<DecodedRecord> {
            if bytes.len() < 2 {
                return Err(CoreError::DecodeFailed {
                    reason: "short record".to_string(),
                });
            }
            Ok(DecodedRecord {
                seed_name: SeedName::parse("IU.ANMO.00.BHZ").unwrap(),
                start: t(bytes[0] as f64),
                rate: 100.0,
                samples: vec![bytes[1] as i32; 100],
            })
        }
    }

    #[test]
    fn test_queue_raw_drops_undecodable() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        let codec = OneByteChannelCodec;

        for i in 0..12u8 {
            processor.queue_raw(&codec, &[i, 7]).unwrap();
        }
        assert_eq!(processor.state(), ProcessorState::Streaming);
        // A garbage record is dropped without disturbing the stream.
        let emitted = processor.queue_raw(&codec, &[]).unwrap();
        assert!(emitted.is_empty());
        assert_eq!(processor.state(), ProcessorState::Streaming);
    }

    #[test]
    fn test_latency_stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut processor, _ring) = make_processor(&dir);
        feed_two_channels(&mut processor, 30);
        assert!(processor.latency_stats().samples > 0);
        processor.reset_latency();
        assert_eq!(processor.latency_stats().samples, 0);
    }
}
