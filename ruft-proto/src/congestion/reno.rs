use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{Controller, ControllerFactory, DUP_ACK_THRESHOLD};

/// The classic AIMD controller: slow start, congestion avoidance, and fast
/// recovery after three duplicate acks
#[derive(Debug, Clone)]
pub struct Reno {
    mss: u64,
    /// Congestion window in bytes; kept fractional so congestion-avoidance
    /// growth below one byte per ack still accumulates
    window: f64,
    /// Slow start threshold in bytes
    ssthresh: f64,
    /// Highest cumulative ack processed so far
    last_ack: u64,
    /// Duplicate-ack counts keyed per acknowledged offset, so counts from
    /// different stale acks never accumulate together
    dup_acks: FxHashMap<u64, u32>,
    in_fast_recovery: bool,
}

impl Reno {
    /// Construct a controller for segments of `mss` bytes
    pub fn new(config: &RenoConfig, mss: u64) -> Self {
        Self {
            mss,
            window: mss as f64,
            ssthresh: (config.initial_ssthresh_segments * mss) as f64,
            last_ack: 0,
            dup_acks: FxHashMap::default(),
            in_fast_recovery: false,
        }
    }

    fn mss_f(&self) -> f64 {
        self.mss as f64
    }
}

impl Controller for Reno {
    fn on_new_ack(&mut self, _now: Instant, ack_offset: u64) {
        if ack_offset <= self.last_ack {
            return;
        }
        if self.in_fast_recovery {
            self.window = self.ssthresh;
            self.in_fast_recovery = false;
            debug!(window = self.window, "leaving fast recovery");
        } else if self.window < self.ssthresh {
            // Slow start
            self.window = (self.window * 2.0).min(self.ssthresh);
        } else {
            // Congestion avoidance, roughly one MSS per round trip
            self.window += self.mss_f() * self.mss_f() / self.window;
        }
        self.last_ack = ack_offset;
        self.dup_acks.clear();
    }

    fn on_duplicate_ack(&mut self, ack_offset: u64) -> bool {
        let count = self.dup_acks.entry(ack_offset).or_insert(0);
        *count += 1;
        trace!(ack_offset, count = *count, "duplicate ack");
        if *count == DUP_ACK_THRESHOLD && !self.in_fast_recovery {
            self.ssthresh = (self.window / 2.0).max(2.0 * self.mss_f());
            self.window = self.ssthresh + 3.0 * self.mss_f();
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
        self.ssthresh = (self.window / 2.0).max(2.0 * self.mss_f());
        self.window = self.mss_f();
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

/// Configuration for [`Reno`]
#[derive(Debug, Clone)]
pub struct RenoConfig {
    initial_ssthresh_segments: u64,
}

impl RenoConfig {
    /// Slow start threshold at session start, in whole segments
    pub fn initial_ssthresh_segments(&mut self, value: u64) -> &mut Self {
        self.initial_ssthresh_segments = value;
        self
    }
}

impl Default for RenoConfig {
    fn default() -> Self {
        Self {
            initial_ssthresh_segments: 16,
        }
    }
}

impl ControllerFactory for RenoConfig {
    fn build(&self, mss: u64) -> Box<dyn Controller> {
        Box::new(Reno::new(self, mss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u64 = 1400;

    fn controller() -> Reno {
        Reno::new(&RenoConfig::default(), MSS)
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn slow_start_doubles_capped_at_ssthresh() {
        let mut reno = controller();
        assert_eq!(reno.window(), MSS);
        reno.on_new_ack(now(), MSS);
        assert_eq!(reno.window(), 2 * MSS);
        reno.on_new_ack(now(), 2 * MSS);
        reno.on_new_ack(now(), 4 * MSS);
        reno.on_new_ack(now(), 8 * MSS);
        assert_eq!(reno.window(), 16 * MSS);
        // Capped: the next ack grows additively instead
        reno.on_new_ack(now(), 16 * MSS);
        assert_eq!(reno.window(), 16 * MSS + MSS / 16);
    }

    #[test]
    fn congestion_avoidance_adds_one_mss_per_window() {
        let mut reno = controller();
        reno.window = 4.0 * MSS as f64;
        reno.ssthresh = 4.0 * MSS as f64;
        for ack in 1..=4u64 {
            reno.on_new_ack(now(), ack * MSS);
        }
        // Four acks at cwnd of four segments add roughly one MSS total
        let grown = reno.window;
        assert!(grown > 4.9 * MSS as f64 && grown < 5.1 * MSS as f64);
    }

    #[test]
    fn triple_duplicate_ack_enters_fast_recovery() {
        let mut reno = controller();
        reno.window = 5600.0;
        reno.ssthresh = 22_400.0;
        assert!(!reno.on_duplicate_ack(2800));
        assert!(!reno.on_duplicate_ack(2800));
        assert!(reno.on_duplicate_ack(2800));
        assert_eq!(reno.ssthresh, 2800.0);
        assert_eq!(reno.window(), 2800 + 3 * MSS);
        assert!(reno.in_fast_recovery);
    }

    #[test]
    fn fast_recovery_fires_once_per_epoch() {
        let mut reno = controller();
        reno.window = 5600.0;
        for _ in 0..2 {
            reno.on_duplicate_ack(MSS);
        }
        assert!(reno.on_duplicate_ack(MSS));
        // Further duplicates of the same ack never re-trigger
        for _ in 0..10 {
            assert!(!reno.on_duplicate_ack(MSS));
        }
        let window = reno.window;
        let ssthresh = reno.ssthresh;
        assert_eq!(reno.window, window);
        assert_eq!(reno.ssthresh, ssthresh);
    }

    #[test]
    fn dup_ack_counts_are_keyed_per_offset() {
        let mut reno = controller();
        assert!(!reno.on_duplicate_ack(MSS));
        assert!(!reno.on_duplicate_ack(2 * MSS));
        assert!(!reno.on_duplicate_ack(MSS));
        // Two counts of two; neither offset reached the threshold
        assert!(!reno.in_fast_recovery);
    }

    #[test]
    fn new_ack_exits_fast_recovery_to_ssthresh() {
        let mut reno = controller();
        reno.window = 11_200.0;
        reno.ssthresh = 11_200.0;
        for _ in 0..3 {
            reno.on_duplicate_ack(MSS);
        }
        assert!(reno.in_fast_recovery);
        reno.on_new_ack(now(), 2 * MSS);
        assert!(!reno.in_fast_recovery);
        assert_eq!(reno.window, reno.ssthresh);
    }

    #[test]
    fn timeout_collapses_window() {
        let mut reno = controller();
        reno.window = 11_200.0;
        reno.on_duplicate_ack(MSS);
        reno.on_timeout();
        assert_eq!(reno.window(), MSS);
        assert_eq!(reno.ssthresh, 5600.0);
        assert!(!reno.in_fast_recovery);
        assert!(reno.dup_acks.is_empty());
    }

    #[test]
    fn window_never_falls_below_one_segment() {
        let mut reno = controller();
        reno.on_timeout();
        reno.on_timeout();
        assert!(reno.window() >= MSS);
        assert_eq!(reno.window_segments(), 1);
    }

    #[test]
    fn stale_ack_does_not_advance_state() {
        let mut reno = controller();
        reno.on_new_ack(now(), 4 * MSS);
        let window = reno.window;
        reno.on_new_ack(now(), 2 * MSS);
        assert_eq!(reno.window, window);
        assert_eq!(reno.last_ack, 4 * MSS);
    }
}
