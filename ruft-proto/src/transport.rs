use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

/// The unreliable datagram channel the engines run over
///
/// Implementations deliver at most once per call and never retry. An
/// expired wait is reported as `Ok(None)`, distinguishable from both a
/// received datagram and a channel failure.
pub trait Transport {
    /// Send one datagram to `peer`
    fn send_to(&mut self, datagram: &[u8], peer: SocketAddr) -> io::Result<()>;

    /// Wait up to `timeout` for one datagram
    fn recv_from(&mut self, timeout: Duration) -> io::Result<Option<(Bytes, SocketAddr)>>;
}
