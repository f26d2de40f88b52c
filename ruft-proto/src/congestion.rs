//! Logic for controlling the rate at which data is sent

use std::fmt;
use std::time::Instant;

mod cubic;
mod reno;

pub use cubic::{Cubic, CubicConfig};
pub use reno::{Reno, RenoConfig};

/// Number of duplicate acks that triggers fast retransmit
pub(crate) const DUP_ACK_THRESHOLD: u32 = 3;

/// Common interface for congestion controllers
///
/// All quantities are in bytes. An ack is considered new only when it
/// strictly exceeds every previously processed cumulative ack; the
/// controllers track this themselves and ignore regressions.
pub trait Controller: fmt::Debug + Send {
    /// A cumulative ack advanced past everything below `ack_offset`
    fn on_new_ack(&mut self, now: Instant, ack_offset: u64);

    /// A stale cumulative ack arrived
    ///
    /// Returns true when this event entered fast recovery, signalling the
    /// sender to retransmit the oldest unacknowledged segment immediately.
    fn on_duplicate_ack(&mut self, ack_offset: u64) -> bool;

    /// The retransmission timer expired
    fn on_timeout(&mut self);

    /// Bytes the congestion window currently admits
    fn window(&self) -> u64;

    /// Whole segments the window currently admits, never less than one
    fn window_segments(&self) -> u64;
}

/// Constructs controllers at session setup
pub trait ControllerFactory: fmt::Debug + Send + Sync {
    /// Build a fresh controller for a transfer using segments of `mss` bytes
    fn build(&self, mss: u64) -> Box<dyn Controller>;
}
