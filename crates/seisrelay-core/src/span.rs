//! Zero-filled per-channel sample buffer.
//!
//! A [`ZeroFilledSpan`] absorbs decoded records arriving in any order,
//! fills positions never written with a sentinel value, and exposes
//! fixed-length windows to the frame builder. The invariant is that
//! `samples[i]` holds the sample for `start + i/rate`.

use tracing::{debug, trace, warn};

use crate::error::{CoreError, CoreResult};
use crate::record::{SeedName, Timestamp};

/// Default sentinel for positions never written.
pub const DEFAULT_FILL_VALUE: i32 = 2_147_000_000;

/// Fixed-duration reconstruction buffer for one channel.
pub struct ZeroFilledSpan {
    seed_name: SeedName,
    rate: f64,
    duration_secs: u32,
    fill_value: i32,
    start: Option<Timestamp>,
    samples: Vec<i32>,
    /// Record start times seen since the last clear, newest last. Used to
    /// re-snap `start` to a true sample boundary after a shift.
    arrival_times: Vec<Timestamp>,
}

impl ZeroFilledSpan {
    /// Creates an empty span covering `duration_secs` at `rate` Hz.
    pub fn new(seed_name: SeedName, rate: f64, duration_secs: u32, fill_value: i32) -> Self {
        Self {
            seed_name,
            rate,
            duration_secs,
            fill_value,
            start: None,
            samples: Vec::new(),
            arrival_times: Vec::new(),
        }
    }

    /// The channel this span reconstructs.
    pub fn seed_name(&self) -> &SeedName {
        &self.seed_name
    }

    /// Sample rate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        (self.duration_secs as f64 * self.rate).round() as usize
    }

    /// Time of `samples[0]`, or `None` before the first record.
    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    /// The sentinel value marking unwritten positions.
    pub fn fill_value(&self) -> i32 {
        self.fill_value
    }

    /// True before the first record (or after [`clear`](Self::clear)).
    pub fn is_empty(&self) -> bool {
        self.start.is_none()
    }

    /// True when every position holds the fill sentinel. An anchored span
    /// decays to this once shifts have consumed all of its real samples.
    pub fn is_all_fill(&self) -> bool {
        self.samples.iter().all(|&s| s == self.fill_value)
    }

    /// Drops all samples and arrival times, keeping the geometry. The next
    /// record re-anchors the buffer.
    pub fn clear(&mut self) {
        debug!(seed_name = %self.seed_name, "clearing span");
        self.start = None;
        self.samples.clear();
        self.arrival_times.clear();
    }

    /// Converts an instant into a sample offset relative to `start`.
    fn offset_from(&self, start: Timestamp, t: Timestamp) -> i64 {
        (t.diff_secs(start) * self.rate).round() as i64
    }

    /// Merges a decoded record into the buffer.
    ///
    /// The first record anchors `start` and allocates the buffer. Later
    /// records land at `round((start_time - start) * rate)`. Records
    /// partially overlapping the window are clipped and the in-window part
    /// is kept; records entirely outside return
    /// [`CoreError::OutOfBuffer`] and the caller must clear or advance.
    ///
    /// Returns the number of samples copied.
    pub fn add_record(
        &mut self,
        start_time: Timestamp,
        rate: f64,
        samples: &[i32],
    ) -> CoreResult<usize> {
        if (rate - self.rate).abs() > 1e-6 {
            return Err(CoreError::RateMismatch {
                seed_name: self.seed_name.to_string(),
                expected: self.rate,
                got: rate,
            });
        }

        let capacity = self.capacity();
        let anchor = match self.start {
            Some(s) => s,
            None => {
                self.start = Some(start_time);
                self.samples = vec![self.fill_value; capacity];
                trace!(
                    seed_name = %self.seed_name,
                    start = %start_time,
                    capacity,
                    "span anchored"
                );
                start_time
            }
        };

        let offset = self.offset_from(anchor, start_time);
        let len = samples.len();

        if offset + len as i64 <= 0 || offset >= capacity as i64 {
            return Err(CoreError::OutOfBuffer {
                offset,
                len,
                capacity,
            });
        }

        // Clip to the buffer window; partial overlaps keep the in-window part.
        let src_from = if offset < 0 { (-offset) as usize } else { 0 };
        let dst_from = if offset < 0 { 0 } else { offset as usize };
        let copy = (len - src_from).min(capacity - dst_from);
        self.samples[dst_from..dst_from + copy].copy_from_slice(&samples[src_from..src_from + copy]);
        if copy < len {
            trace!(
                seed_name = %self.seed_name,
                offset,
                len,
                copy,
                "record clipped to buffer window"
            );
        }

        self.arrival_times.push(start_time);
        Ok(copy)
    }

    /// Copies `count` samples beginning at `from` into a new vector.
    pub fn window(&self, from: Timestamp, count: usize) -> CoreResult<Vec<i32>> {
        let capacity = self.capacity();
        let Some(anchor) = self.start else {
            return Err(CoreError::OutOfBuffer {
                offset: 0,
                len: count,
                capacity,
            });
        };
        let offset = self.offset_from(anchor, from);
        if offset < 0 {
            return Err(CoreError::BeforeBufferStart { offset });
        }
        if offset as usize + count > capacity {
            return Err(CoreError::PastBufferEnd {
                offset,
                count,
                capacity,
            });
        }
        Ok(self.samples[offset as usize..offset as usize + count].to_vec())
    }

    /// True if any sample in `[from, from + duration_secs)` is still the
    /// fill sentinel. Positions outside the buffer count as fill.
    pub fn has_fill(&self, from: Timestamp, duration_secs: f64) -> bool {
        let Some(anchor) = self.start else {
            return true;
        };
        let capacity = self.capacity() as i64;
        let offset = self.offset_from(anchor, from);
        let count = (duration_secs * self.rate).round() as i64;
        if offset < 0 || offset + count > capacity {
            return true;
        }
        self.samples[offset as usize..(offset + count) as usize]
            .iter()
            .any(|&s| s == self.fill_value)
    }

    /// Drops the leading `duration_secs` of samples, advances `start` and
    /// fills the vacated tail with the sentinel.
    ///
    /// After the advance, `start` is snapped onto the sample grid of the
    /// closest recorded arrival time so repeated shifts do not accumulate
    /// rounding drift. Arrival times older than the new start are discarded.
    pub fn shift_start(&mut self, duration_secs: f64) {
        let Some(start) = self.start else {
            return;
        };
        let n = (duration_secs * self.rate).round() as usize;
        let len = self.samples.len();
        if n >= len {
            warn!(
                seed_name = %self.seed_name,
                shift = n,
                capacity = len,
                "shift covers whole buffer, clearing"
            );
            self.clear();
            return;
        }

        self.samples.copy_within(n.., 0);
        for s in &mut self.samples[len - n..] {
            *s = self.fill_value;
        }

        let advanced = start.add_secs_f64(duration_secs);
        let snapped = self.snap_to_arrival(advanced);
        self.start = Some(snapped);
        self.arrival_times.retain(|&t| t >= snapped);
        trace!(
            seed_name = %self.seed_name,
            advanced = %advanced,
            snapped = %snapped,
            "span shifted"
        );
    }

    /// Projects `t` onto the sample grid of the arrival time whose grid lands
    /// closest to `t`. Returns `t` unchanged if no arrivals are recorded.
    fn snap_to_arrival(&self, t: Timestamp) -> Timestamp {
        let mut best: Option<Timestamp> = None;
        for &arrival in &self.arrival_times {
            let steps = (t.diff_secs(arrival) * self.rate).round();
            let candidate = arrival.add_secs_f64(steps / self.rate);
            let better = match best {
                None => true,
                Some(b) => {
                    candidate.diff_secs(t).abs() < b.diff_secs(t).abs()
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.unwrap_or(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SeedName;

    fn make_span() -> ZeroFilledSpan {
        ZeroFilledSpan::new(
            SeedName::parse("IU.ANMO.00.BHZ").unwrap(),
            100.0,
            60,
            DEFAULT_FILL_VALUE,
        )
    }

    fn t(secs: f64) -> Timestamp {
        Timestamp::from_secs_f64(1_700_000_000.0 + secs)
    }

    #[test]
    fn test_first_record_anchors_span() {
        let mut span = make_span();
        assert!(span.is_empty());
        span.add_record(t(0.0), 100.0, &[1, 2, 3]).unwrap();
        assert_eq!(span.start(), Some(t(0.0)));
        assert_eq!(span.capacity(), 6000);
        let w = span.window(t(0.0), 4).unwrap();
        assert_eq!(w, vec![1, 2, 3, DEFAULT_FILL_VALUE]);
    }

    #[test]
    fn test_out_of_order_records_commute() {
        let a: Vec<i32> = (0..100).collect();
        let b: Vec<i32> = (100..200).collect();
        let c: Vec<i32> = (200..300).collect();

        let mut forward = make_span();
        forward.add_record(t(0.0), 100.0, &a).unwrap();
        forward.add_record(t(1.0), 100.0, &b).unwrap();
        forward.add_record(t(2.0), 100.0, &c).unwrap();

        let mut shuffled = make_span();
        shuffled.add_record(t(0.0), 100.0, &a).unwrap();
        shuffled.add_record(t(2.0), 100.0, &c).unwrap();
        shuffled.add_record(t(1.0), 100.0, &b).unwrap();

        assert_eq!(
            forward.window(t(0.0), 300).unwrap(),
            shuffled.window(t(0.0), 300).unwrap()
        );
    }

    #[test]
    fn test_duplicate_record_idempotent() {
        let a: Vec<i32> = (0..100).collect();
        let mut span = make_span();
        span.add_record(t(0.0), 100.0, &a).unwrap();
        span.add_record(t(0.0), 100.0, &a).unwrap();
        assert_eq!(span.window(t(0.0), 100).unwrap(), a);
    }

    #[test]
    fn test_gap_free_round_trip() {
        let mut span = make_span();
        let data: Vec<i32> = (0..1000).collect();
        span.add_record(t(0.0), 100.0, &data).unwrap();
        assert!(!span.has_fill(t(0.0), 10.0));
        assert_eq!(span.window(t(0.0), 1000).unwrap(), data);
    }

    #[test]
    fn test_has_fill_detects_hole() {
        let mut span = make_span();
        span.add_record(t(0.0), 100.0, &[7; 100]).unwrap();
        span.add_record(t(2.0), 100.0, &[9; 100]).unwrap();
        assert!(span.has_fill(t(0.0), 3.0));
        assert!(!span.has_fill(t(0.0), 1.0));
        assert!(!span.has_fill(t(2.0), 1.0));
    }

    #[test]
    fn test_record_before_window_is_clipped() {
        let mut span = make_span();
        span.add_record(t(1.0), 100.0, &[5; 100]).unwrap();
        // Starts 0.5s before the buffer start; the first 50 samples clip.
        let data: Vec<i32> = (0..100).collect();
        let copied = span.add_record(t(0.5), 100.0, &data).unwrap();
        assert_eq!(copied, 50);
        let w = span.window(t(1.0), 50).unwrap();
        assert_eq!(w, (50..100).collect::<Vec<i32>>());
    }

    #[test]
    fn test_record_entirely_outside_rejected() {
        let mut span = make_span();
        span.add_record(t(10.0), 100.0, &[1; 100]).unwrap();
        let err = span.add_record(t(0.0), 100.0, &[2; 100]).unwrap_err();
        assert!(matches!(err, CoreError::OutOfBuffer { .. }));
        let err = span.add_record(t(100.0), 100.0, &[3; 100]).unwrap_err();
        assert!(matches!(err, CoreError::OutOfBuffer { .. }));
    }

    #[test]
    fn test_record_past_end_is_clipped() {
        let mut span = make_span();
        span.add_record(t(0.0), 100.0, &[1; 100]).unwrap();
        // 59.5s in, only 50 of 100 samples fit.
        let copied = span.add_record(t(59.5), 100.0, &[4; 100]).unwrap();
        assert_eq!(copied, 50);
        assert_eq!(span.window(t(59.5), 50).unwrap(), vec![4; 50]);
    }

    #[test]
    fn test_window_before_start_errors() {
        let mut span = make_span();
        span.add_record(t(10.0), 100.0, &[1; 100]).unwrap();
        let err = span.window(t(5.0), 100).unwrap_err();
        assert!(matches!(err, CoreError::BeforeBufferStart { .. }));
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let mut span = make_span();
        let err = span.add_record(t(0.0), 40.0, &[1; 10]).unwrap_err();
        assert!(matches!(err, CoreError::RateMismatch { .. }));
    }

    #[test]
    fn test_shift_start_drops_head_and_fills_tail() {
        let mut span = make_span();
        let data: Vec<i32> = (0..2000).collect();
        span.add_record(t(0.0), 100.0, &data).unwrap();
        span.shift_start(10.0);

        assert_eq!(span.start(), Some(t(10.0)));
        let w = span.window(t(10.0), 1000).unwrap();
        assert_eq!(w, (1000..2000).collect::<Vec<i32>>());
        // Tail vacated by the shift is back to fill.
        assert!(span.has_fill(t(20.0), 10.0));
    }

    #[test]
    fn test_shift_snaps_to_arrival_grid() {
        let mut span = make_span();
        // Records arrive on a grid offset 4ms from round seconds.
        span.add_record(t(0.004), 100.0, &[1; 1000]).unwrap();
        span.add_record(t(10.004), 100.0, &[2; 1000]).unwrap();
        span.shift_start(10.0);
        // 0.004 + 10.0 already lies on the arrival grid of both records.
        assert_eq!(span.start(), Some(t(10.004)));
        assert!(!span.has_fill(t(10.004), 10.0));
    }

    #[test]
    fn test_shift_decays_to_all_fill() {
        let mut span = make_span();
        span.add_record(t(0.0), 100.0, &[1; 500]).unwrap();
        assert!(!span.is_all_fill());
        span.shift_start(10.0);
        assert!(!span.is_empty());
        assert!(span.is_all_fill());
    }

    #[test]
    fn test_shift_whole_buffer_clears() {
        let mut span = make_span();
        span.add_record(t(0.0), 100.0, &[1; 100]).unwrap();
        span.shift_start(60.0);
        assert!(span.is_empty());
    }

    #[test]
    fn test_clear_reanchors() {
        let mut span = make_span();
        span.add_record(t(0.0), 100.0, &[1; 100]).unwrap();
        span.clear();
        assert!(span.is_empty());
        span.add_record(t(500.0), 100.0, &[2; 100]).unwrap();
        assert_eq!(span.start(), Some(t(500.0)));
        assert_eq!(span.window(t(500.0), 100).unwrap(), vec![2; 100]);
    }
}
