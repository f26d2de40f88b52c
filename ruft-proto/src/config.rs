use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::DEFAULT_MSS;
use crate::congestion::{ControllerFactory, RenoConfig};

/// Largest payload that fits a UDP datagram alongside the packet header
const MAX_MSS: usize = 65_000;

/// Session parameters shared by both engines
///
/// Built once per transfer; the engines validate it at construction.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub(crate) mss: usize,
    pub(crate) initial_rto: Duration,
    pub(crate) max_retries: u32,
    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory>,
}

impl TransferConfig {
    /// Maximum payload bytes per segment
    pub fn mss(&mut self, value: usize) -> &mut Self {
        self.mss = value;
        self
    }

    /// Retransmission timeout before the first RTT sample arrives
    pub fn initial_rto(&mut self, value: Duration) -> &mut Self {
        self.initial_rto = value;
        self
    }

    /// Consecutive unanswered timeouts tolerated before the transfer is
    /// abandoned as failed
    pub fn max_retries(&mut self, value: u32) -> &mut Self {
        self.max_retries = value;
        self
    }

    /// How the congestion window reacts to acks, duplicate acks and
    /// timeouts
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 {
            return Err(ConfigError::ZeroMss);
        }
        if self.mss > MAX_MSS {
            return Err(ConfigError::OversizedMss);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetryBudget);
        }
        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            initial_rto: Duration::from_secs(1),
            max_retries: 30,
            congestion_controller_factory: Arc::new(RenoConfig::default()),
        }
    }
}

/// Session parameters that can never work
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The segment size is zero
    #[error("mss must be nonzero")]
    ZeroMss,
    /// The segment size exceeds what a UDP datagram can carry
    #[error("mss exceeds the datagram payload limit")]
    OversizedMss,
    /// The retry budget is zero, so no transfer could ever complete
    #[error("retry budget must be nonzero")]
    ZeroRetryBudget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(TransferConfig::default().validate(), Ok(()));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let mut config = TransferConfig::default();
        config.mss(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroMss));
        config.mss(1 << 20);
        assert_eq!(config.validate(), Err(ConfigError::OversizedMss));
        config.mss(1400).max_retries(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroRetryBudget));
    }
}
