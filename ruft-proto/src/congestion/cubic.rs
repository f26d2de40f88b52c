use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{Controller, ControllerFactory, DUP_ACK_THRESHOLD};

/// CUBIC constants per RFC 8312, with the multiplicative-decrease factor of
/// classic CUBIC deployments
const C: f64 = 0.4;
const BETA: f64 = 0.5;

/// Cubic growth state, recomputed at the start of each growth epoch
///
/// `k` and `w_max` are described in the RFC; the epoch starts on the first
/// congestion-avoidance ack after a congestion event.
#[derive(Debug, Default, Clone)]
struct State {
    /// Start of the current growth epoch; unset forces a recompute on the
    /// next congestion-avoidance ack
    epoch_start: Option<Instant>,
    /// Window maximum before the last congestion event, in bytes
    w_max: f64,
    /// Window maximum before the previous congestion event
    w_last_max: f64,
    /// Time offset at which the cubic curve crosses `w_max`
    k: f64,
    /// Window size at the start of the current epoch
    origin_point: f64,
}

/// The CUBIC controller: congestion avoidance grows the window along
/// `W(t) = C·(t − K)³ + origin`, shaped around the window maximum recorded
/// at the last congestion event
#[derive(Debug, Clone)]
pub struct Cubic {
    mss: u64,
    /// Congestion window in bytes
    window: f64,
    /// Slow start threshold in bytes
    ssthresh: f64,
    /// Highest cumulative ack processed so far
    last_ack: u64,
    /// Duplicate-ack counts keyed per acknowledged offset
    dup_acks: FxHashMap<u64, u32>,
    in_fast_recovery: bool,
    state: State,
}

impl Cubic {
    /// Construct a controller for segments of `mss` bytes
    pub fn new(config: &CubicConfig, mss: u64) -> Self {
        Self {
            mss,
            window: mss as f64,
            ssthresh: (config.initial_ssthresh_segments * mss) as f64,
            last_ack: 0,
            dup_acks: FxHashMap::default(),
            in_fast_recovery: false,
            state: State::default(),
        }
    }

    fn mss_f(&self) -> f64 {
        self.mss as f64
    }

    /// Target window along the cubic curve at time `now`
    ///
    /// Entering a fresh epoch records the curve parameters from the current
    /// window: `K = cbrt(w_max·β / C)` and the origin at the current window.
    fn target_window(&mut self, now: Instant) -> f64 {
        let epoch_start = match self.state.epoch_start {
            Some(epoch_start) => epoch_start,
            None => {
                self.state.w_max = self.state.w_max.max(self.window);
                self.state.k = (self.state.w_max * BETA / C).cbrt();
                self.state.origin_point = self.window;
                self.state.epoch_start = Some(now);
                now
            }
        };
        let t = now.duration_since(epoch_start).as_secs_f64();
        let target = self.state.origin_point + C * (t - self.state.k).powi(3);
        target.max(0.0).trunc()
    }
}

impl Controller for Cubic {
    fn on_new_ack(&mut self, now: Instant, ack_offset: u64) {
        if ack_offset <= self.last_ack {
            return;
        }
        if self.in_fast_recovery {
            self.window = self.ssthresh.max(self.mss_f());
            self.in_fast_recovery = false;
            debug!(window = self.window, "leaving fast recovery");
        } else if self.window < self.ssthresh {
            // Slow start
            self.window = (self.window * 2.0).min(self.ssthresh);
        } else {
            self.window = self.target_window(now).max(self.mss_f());
        }
        self.last_ack = ack_offset;
        self.dup_acks.clear();
    }

    fn on_duplicate_ack(&mut self, ack_offset: u64) -> bool {
        let count = self.dup_acks.entry(ack_offset).or_insert(0);
        *count += 1;
        trace!(ack_offset, count = *count, "duplicate ack");
        if *count == DUP_ACK_THRESHOLD && !self.in_fast_recovery {
            self.ssthresh = (self.window * BETA).max(self.mss_f());
            self.window = self.ssthresh + 3.0 * self.mss_f();
            self.state.w_last_max = self.state.w_max;
            // The next congestion-avoidance ack recomputes the curve from
            // the reduced window
            self.state.epoch_start = None;
            self.in_fast_recovery = true;
            debug!(
                window = self.window,
                ssthresh = self.ssthresh,
                "entering fast recovery"
            );
            return true;
        }
        false
    }

    fn on_timeout(&mut self) {
        self.ssthresh = (self.window * BETA).max(self.mss_f());
        self.window = self.mss_f();
        self.state = State::default();
        self.in_fast_recovery = false;
        self.dup_acks.clear();
        debug!(ssthresh = self.ssthresh, "window collapsed after timeout");
    }

    fn window(&self) -> u64 {
        self.window as u64
    }

    fn window_segments(&self) -> u64 {
        (self.window as u64 / self.mss).max(1)
    }
}

/// Configuration for [`Cubic`]
#[derive(Debug, Clone)]
pub struct CubicConfig {
    initial_ssthresh_segments: u64,
}

impl CubicConfig {
    /// Slow start threshold at session start, in whole segments
    pub fn initial_ssthresh_segments(&mut self, value: u64) -> &mut Self {
        self.initial_ssthresh_segments = value;
        self
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            initial_ssthresh_segments: 16,
        }
    }
}

impl ControllerFactory for CubicConfig {
    fn build(&self, mss: u64) -> Box<dyn Controller> {
        Box::new(Cubic::new(self, mss))
    }
}
