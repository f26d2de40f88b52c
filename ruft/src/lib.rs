//! Reliable, congestion-controlled file transfer over UDP
//!
//! Pairs the [`ruft_proto`] engines with blocking UDP sockets. A transfer
//! involves one [`send_bytes`] or [`send_file`] call on the serving side
//! and one [`receive_bytes`] or [`receive_file`] call on the fetching
//! side; the receiver initiates, so only the sender's address needs to be
//! known in advance.
//!
//! ```no_run
//! # fn run() -> Result<(), ruft::Error> {
//! use ruft::{TransferConfig, UdpTransport};
//!
//! let transport = UdpTransport::bind("0.0.0.0:4433")?;
//! ruft::send_file(transport, "kernel.img".as_ref(), TransferConfig::default())?;
//! # Ok(()) }
//! ```

#![warn(missing_docs)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;
use tracing::info;

mod socket;

pub use ruft_proto::{
    congestion, BinaryCodec, ConfigError, Packet, PacketCodec, ReceiverEngine, Segment,
    SenderEngine, TransferConfig, TransferError, TransferStats, Transport,
};
pub use socket::UdpTransport;

/// Everything that can go wrong around a transfer
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied configuration can never work
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The transfer itself failed
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// Reading the source or writing the destination failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Serve `data` to the first peer that asks on `transport`
///
/// Blocks until the peer acknowledges the whole stream or the retry budget
/// runs out.
pub fn send_bytes(
    transport: UdpTransport,
    data: Bytes,
    config: TransferConfig,
) -> Result<TransferStats, Error> {
    let mut engine = SenderEngine::new(transport, BinaryCodec, data, config)?;
    let stats = engine.run()?;
    info!(
        bytes = stats.bytes_sent,
        retransmits = stats.retransmits,
        "transfer served"
    );
    Ok(stats)
}

/// Serve the contents of `path` to the first peer that asks on `transport`
pub fn send_file(
    transport: UdpTransport,
    path: &Path,
    config: TransferConfig,
) -> Result<TransferStats, Error> {
    let data = std::fs::read(path)?;
    send_bytes(transport, Bytes::from(data), config)
}

/// Fetch a byte stream from the sender at `server`
pub fn receive_bytes(
    transport: UdpTransport,
    server: SocketAddr,
    config: TransferConfig,
) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    let mut engine = ReceiverEngine::new(transport, BinaryCodec, server, &mut data, config)?;
    engine.run()?;
    drop(engine);
    Ok(data)
}

/// Fetch a byte stream from the sender at `server` into the file at `path`
///
/// Returns the number of bytes written. An existing file is truncated.
pub fn receive_file(
    transport: UdpTransport,
    server: SocketAddr,
    path: &Path,
    config: TransferConfig,
) -> Result<u64, Error> {
    let mut sink = BufWriter::new(File::create(path)?);
    let mut engine = ReceiverEngine::new(transport, BinaryCodec, server, &mut sink, config)?;
    let received = engine.run()?;
    drop(engine);
    sink.flush()?;
    info!(bytes = received, path = %path.display(), "transfer received");
    Ok(received)
}
