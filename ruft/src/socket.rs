use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use ruft_proto::Transport;

/// Largest datagram a UDP socket can deliver
const RECV_BUF: usize = 65_535;

/// A blocking UDP socket driving the transfer engines
///
/// Receive waits are implemented with the socket read timeout; the timeout
/// is only written to the socket when it actually changes, since the
/// engines ask with fresh timeouts on every call.
pub struct UdpTransport {
    socket: UdpSocket,
    read_timeout: Option<Duration>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind a socket to `addr`; use port 0 for an ephemeral port
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        debug!(local = %socket.local_addr()?, "bound");
        Ok(Self {
            socket,
            read_timeout: None,
            buf: vec![0; RECV_BUF],
        })
    }

    /// The address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, datagram: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.socket.send_to(datagram, peer)?;
        Ok(())
    }

    fn recv_from(&mut self, timeout: Duration) -> io::Result<Option<(Bytes, SocketAddr)>> {
        // A zero read timeout means "block forever" to the socket
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, peer)) => Ok(Some((Bytes::copy_from_slice(&self.buf[..len]), peer))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }
}
