use std::cmp;
use std::time::Duration;

/// Lower bound for the variance term and for the RTO itself
const GRANULARITY: Duration = Duration::from_millis(200);

/// Upper bound on the RTO, also the ceiling for exponential backoff
const MAX_RTO: Duration = Duration::from_secs(60);

/// Retransmission timeout estimation as described in RFC 6298
///
/// Smoothing uses α = 1/8 and β = 1/4, computed in integer `Duration`
/// arithmetic. The estimator never reports a timeout outside
/// `[200 ms, 60 s]`.
#[derive(Debug, Copy, Clone)]
pub struct RttEstimator {
    /// The smoothed RTT, unset until the first valid sample
    smoothed: Option<Duration>,
    /// The RTT variation; meaningful only once `smoothed` is set
    var: Duration,
    /// The current retransmission timeout
    rto: Duration,
}

impl RttEstimator {
    /// Construct an estimator that reports `initial_rto` until the first
    /// sample arrives
    pub fn new(initial_rto: Duration) -> Self {
        Self {
            smoothed: None,
            var: Duration::ZERO,
            rto: initial_rto.clamp(GRANULARITY, MAX_RTO),
        }
    }

    /// The duration to wait before treating an outstanding segment as lost
    pub fn timeout(&self) -> Duration {
        self.rto
    }

    /// The smoothed RTT, if any sample has been taken
    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }

    /// Feed one round-trip sample and return the recomputed timeout
    ///
    /// Callers must only feed samples that are unambiguously attributable to
    /// a single transmission; acks covering retransmitted segments carry no
    /// usable timing signal (Karn's rule).
    pub fn on_sample(&mut self, rtt: Duration) -> Duration {
        let smoothed = match self.smoothed {
            None => {
                self.var = rtt / 2;
                rtt
            }
            Some(smoothed) => {
                let var_sample = if smoothed > rtt {
                    smoothed - rtt
                } else {
                    rtt - smoothed
                };
                self.var = (3 * self.var + var_sample) / 4;
                (7 * smoothed + rtt) / 8
            }
        };
        self.smoothed = Some(smoothed);
        self.rto = (smoothed + cmp::max(4 * self.var, GRANULARITY)).clamp(GRANULARITY, MAX_RTO);
        self.rto
    }

    /// Exponential backoff after an expired timer
    ///
    /// Doubles the timeout up to the ceiling. The smoothed state is kept so
    /// the next valid sample recovers the estimate.
    pub fn on_timeout(&mut self) -> Duration {
        self.rto = cmp::min(self.rto * 2, MAX_RTO);
        self.rto
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
