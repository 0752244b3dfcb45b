//! Latency-adaptive send throttle.
//!
//! A multiplicative increase/decrease loop, not a PID controller. The
//! throttle paces writes so that sent volume never outruns the configured
//! rate, and every couple of minutes it consults the channel's realtime
//! delivery latency: latency rising past the cut threshold lowers the rate
//! by a quarter, latency falling under the raise threshold lifts it by a
//! quarter up to the configured ceiling. The state machine takes explicit
//! `Instant`s so adjustment schedules are testable without sleeping.

use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Bytes that accumulate before a pacing sleep is computed.
const PACE_CHUNK_BYTES: u64 = 2048;
/// Hard floor on the adapted rate.
const RATE_FLOOR_BPS: u32 = 100;

/// Throttle configuration.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Configured maximum send rate, bytes per second.
    pub max_rate_bps: u32,
    /// The throttle only activates when `max_rate_bps` is below this;
    /// faster links are left unpaced.
    pub active_below_bps: u32,
    /// Interval between latency-driven rate adjustments.
    pub check_interval: Duration,
    /// Latency below this and falling raises the rate.
    pub raise_below_secs: f64,
    /// Latency above this and rising cuts the rate.
    pub cut_above_secs: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_rate_bps: u32::MAX,
            active_below_bps: 512_000,
            check_interval: Duration::from_secs(120),
            raise_below_secs: 15.0,
            cut_above_secs: 30.0,
        }
    }
}

/// Outcome of a latency sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// No change.
    None,
    /// The rate changed to this many bytes per second.
    RateChanged(u32),
    /// The rate collapsed below half the configured maximum; the caller
    /// should disconnect and wait for realtime to catch up.
    Disconnect,
}

/// Latency-adaptive rate limiter for one connection.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    rate_bps: u32,
    pending_bytes: u64,
    window_start: Option<Instant>,
    last_check: Option<Instant>,
    last_latency_secs: Option<f64>,
}

impl AdaptiveThrottle {
    /// Creates a throttle starting at the configured maximum rate.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            rate_bps: config.max_rate_bps,
            pending_bytes: 0,
            window_start: None,
            last_check: None,
            last_latency_secs: None,
        }
    }

    /// Whether pacing applies at all for this configuration.
    pub fn active(&self) -> bool {
        self.config.max_rate_bps < self.config.active_below_bps
    }

    /// Current adapted rate in bytes per second.
    pub fn rate_bps(&self) -> u32 {
        self.rate_bps
    }

    /// The configured latency poll cadence.
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    /// Accounts for `bytes` written at `now`. Once enough volume has
    /// accumulated, returns how long the caller must sleep so the chunk
    /// takes the time the current rate dictates.
    pub fn on_sent(&mut self, bytes: usize, now: Instant) -> Option<Duration> {
        if !self.active() {
            return None;
        }
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.pending_bytes += bytes as u64;
        if self.pending_bytes < PACE_CHUNK_BYTES {
            return None;
        }

        let start = self.window_start.unwrap_or(now);
        let budget = Duration::from_secs_f64(
            self.pending_bytes as f64 / self.rate_bps.max(1) as f64,
        );
        let elapsed = now.saturating_duration_since(start);
        self.pending_bytes = 0;
        self.window_start = Some(now);
        if budget > elapsed {
            let pause = budget - elapsed;
            self.window_start = Some(now + pause);
            Some(pause)
        } else {
            None
        }
    }

    /// Feeds one realtime latency observation at `now`. Samples inside the
    /// check interval are absorbed without adjustment.
    pub fn on_latency_sample(&mut self, latency_secs: f64, now: Instant) -> ThrottleAction {
        if !self.active() {
            return ThrottleAction::None;
        }
        if let Some(at) = self.last_check {
            if now.saturating_duration_since(at) < self.config.check_interval {
                return ThrottleAction::None;
            }
        }
        self.last_check = Some(now);
        let previous = self.last_latency_secs.replace(latency_secs);
        let Some(previous) = previous else {
            return ThrottleAction::None;
        };

        let rising = latency_secs > previous;
        if rising && latency_secs > self.config.cut_above_secs {
            let cut = ((self.rate_bps as u64 * 3) / 4) as u32;
            self.rate_bps = cut.max(RATE_FLOOR_BPS);
            if self.rate_bps < self.config.max_rate_bps / 2 {
                info!(
                    rate_bps = self.rate_bps,
                    latency_secs, "throttle collapsed below half max, disconnecting"
                );
                return ThrottleAction::Disconnect;
            }
            debug!(rate_bps = self.rate_bps, latency_secs, "latency rising, rate cut");
            return ThrottleAction::RateChanged(self.rate_bps);
        }

        if !rising && latency_secs < self.config.raise_below_secs {
            let raised = ((self.rate_bps as u64 * 5) / 4) as u32;
            let new_rate = raised.min(self.config.max_rate_bps);
            if new_rate != self.rate_bps {
                self.rate_bps = new_rate;
                debug!(rate_bps = self.rate_bps, latency_secs, "latency falling, rate raised");
                return ThrottleAction::RateChanged(self.rate_bps);
            }
        }
        ThrottleAction::None
    }

    /// Restores the configured maximum rate, after a reconnect.
    pub fn reset(&mut self) {
        self.rate_bps = self.config.max_rate_bps;
        self.pending_bytes = 0;
        self.window_start = None;
        self.last_check = None;
        self.last_latency_secs = None;
    }
}
