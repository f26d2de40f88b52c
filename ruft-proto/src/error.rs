use std::io;

use thiserror::Error;

/// Fatal transfer failures surfaced to the caller
///
/// Everything recoverable — timeouts, duplicate or stale acks, reordered
/// segments, malformed datagrams — is absorbed inside the engines and
/// converted into retransmission. Only these conditions abort a session.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer stayed silent through the whole retry budget
    #[error("retransmission budget exceeded after {0} consecutive timeouts")]
    RetransmissionBudgetExceeded(u32),
    /// The transport or the output sink failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
