//! Protocol logic for reliable, congestion-controlled byte transfer over an
//! unreliable datagram channel
//!
//! ruft-proto reconstructs ordered, lossless delivery on top of a channel
//! that may drop, delay, duplicate or reorder datagrams, while pacing
//! transmission with a TCP-style congestion window. It contains no
//! networking code: engines exchange datagrams through a caller-supplied
//! [`Transport`] and serialize packets through a [`PacketCodec`].
//!
//! The most important types are [`SenderEngine`], which drives a windowed
//! retransmission loop over a byte source, and [`ReceiverEngine`], which
//! reorders and deduplicates inbound segments and produces the cumulative
//! ack stream the sender consumes. Retransmission timeouts follow RFC 6298
//! via [`RttEstimator`]; window evolution is pluggable through the
//! [`congestion::Controller`] trait, with Reno and CUBIC provided.

#![warn(missing_docs)]

mod config;
pub mod congestion;
mod error;
mod packet;
mod receiver;
mod reorder;
mod rtt;
mod sender;
mod transport;

pub use config::{ConfigError, TransferConfig};
pub use error::TransferError;
pub use packet::{BinaryCodec, DecodeError, Packet, PacketCodec, Segment};
pub use receiver::ReceiverEngine;
pub use rtt::RttEstimator;
pub use sender::{SenderEngine, TransferStats};
pub use transport::Transport;

/// Default maximum payload bytes per segment
pub const DEFAULT_MSS: usize = 1400;
