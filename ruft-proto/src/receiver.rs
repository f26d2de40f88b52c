use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::{ConfigError, TransferConfig};
use crate::error::TransferError;
use crate::packet::{Packet, PacketCodec, Segment};
use crate::reorder::ReorderBuffer;
use crate::rtt::RttEstimator;
use crate::transport::Transport;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    AwaitFirst,
    Receiving,
    Done,
}

/// When the ack for an offset was sent, and whether it went out more than
/// once (which makes the next matching segment useless as an RTT signal)
#[derive(Debug, Clone, Copy)]
struct AckRecord {
    at: Instant,
    resent: bool,
}

/// Consumes inbound segments and produces the cumulative ack stream
///
/// Maintains the next-expected-offset cursor and a reorder buffer; in-order
/// payload is appended to the sink immediately, segments ahead of the
/// cursor are buffered, and everything behind it is acknowledged again and
/// dropped. The engine initiates the session by sending the connection
/// request the sender blocks on.
pub struct ReceiverEngine<T, C, W> {
    transport: T,
    codec: C,
    sink: W,
    config: TransferConfig,
    server: SocketAddr,
    rtt: RttEstimator,
    state: State,
    /// Offset of the next in-order byte
    expected: u64,
    buffer: ReorderBuffer,
    /// Send times of recent acks, keyed by the acked offset
    ack_times: BTreeMap<u64, AckRecord>,
    consecutive_timeouts: u32,
    bytes_written: u64,
    scratch: Vec<u8>,
}

impl<T: Transport, C: PacketCodec, W: Write> ReceiverEngine<T, C, W> {
    /// Construct an engine that will fetch a byte stream from `server` and
    /// append it to `sink`
    pub fn new(
        transport: T,
        codec: C,
        server: SocketAddr,
        sink: W,
        config: TransferConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rtt = RttEstimator::new(config.initial_rto);
        Ok(Self {
            transport,
            codec,
            sink,
            server,
            rtt,
            config,
            state: State::AwaitFirst,
            expected: 0,
            buffer: ReorderBuffer::new(),
            ack_times: BTreeMap::new(),
            consecutive_timeouts: 0,
            bytes_written: 0,
            scratch: Vec::new(),
        })
    }

    /// The RTT estimator driving this engine's timeouts
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the transfer to completion, returning the bytes written
    ///
    /// Blocks until the sender announces end of stream or the retry budget
    /// is exhausted.
    pub fn run(&mut self) -> Result<u64, TransferError> {
        debug!(server = %self.server, "requesting stream");
        self.send_ack(self.expected)?;
        loop {
            match self.state {
                State::AwaitFirst | State::Receiving => self.receive_once()?,
                State::Done => {
                    self.linger()?;
                    return Ok(self.bytes_written);
                }
            }
        }
    }

    fn receive_once(&mut self) -> Result<(), TransferError> {
        match self.transport.recv_from(self.rtt.timeout())? {
            Some((datagram, _)) => {
                self.consecutive_timeouts = 0;
                match self.codec.decode(&datagram) {
                    Ok(Packet::Segment(segment)) => self.handle_segment(segment)?,
                    Ok(_) => trace!("ignoring non-segment packet"),
                    Err(error) => trace!(%error, "dropping malformed datagram"),
                }
            }
            None => {
                self.rtt.on_timeout();
                self.bump_timeouts()?;
                // Covers a lost connection request as well as a lost ack:
                // re-advertising the cursor is always safe
                self.send_ack(self.expected)?;
            }
        }
        Ok(())
    }

    fn handle_segment(&mut self, segment: Segment) -> Result<(), TransferError> {
        if self.state == State::AwaitFirst {
            debug!("stream established");
            self.state = State::Receiving;
        }
        if segment.is_last {
            // End of stream is only announced once everything before it was
            // acknowledged, so nothing can still be outstanding here
            debug!(bytes = self.bytes_written, "end of stream");
            self.send_final_ack()?;
            self.state = State::Done;
            return Ok(());
        }
        let now = Instant::now();
        match segment.offset.cmp(&self.expected) {
            Ordering::Equal => {
                self.take_rtt_sample(segment.offset, now);
                self.deliver(&segment.payload)?;
                while let Some(chunk) = self.buffer.pop_at(self.expected) {
                    self.deliver(&chunk)?;
                }
            }
            Ordering::Less => {
                trace!(
                    offset = segment.offset,
                    expected = self.expected,
                    "stale segment"
                );
                self.send_ack(self.expected)?;
            }
            Ordering::Greater => {
                trace!(
                    offset = segment.offset,
                    expected = self.expected,
                    buffered = self.buffer.len(),
                    "buffering out-of-order segment"
                );
                self.buffer.insert(segment.offset, segment.payload);
                // The duplicate ack drives the sender's fast retransmit
                self.send_ack(self.expected)?;
            }
        }
        Ok(())
    }

    /// Append one in-order chunk to the sink, advance the cursor and
    /// acknowledge the new position
    fn deliver(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        self.sink.write_all(chunk)?;
        self.bytes_written += chunk.len() as u64;
        self.expected += chunk.len() as u64;
        self.send_ack(self.expected)?;
        Ok(())
    }

    fn send_ack(&mut self, offset: u64) -> io::Result<()> {
        match self.ack_times.entry(offset) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(AckRecord {
                    at: Instant::now(),
                    resent: false,
                });
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().resent = true;
            }
        }
        trace!(offset, "sending cumulative ack");
        self.send_packet(&Packet::Ack { offset })
    }

    fn send_final_ack(&mut self) -> io::Result<()> {
        self.send_packet(&Packet::FinalAck)
    }

    /// The delay between acking an offset and receiving the segment that
    /// starts there is one round trip, usable when the ack went out once
    fn take_rtt_sample(&mut self, offset: u64, now: Instant) {
        if let Some(record) = self.ack_times.get(&offset) {
            if !record.resent {
                self.rtt.on_sample(now.duration_since(record.at));
            }
        }
        self.ack_times = self.ack_times.split_off(&(offset + 1));
    }

    /// Answer retransmitted end-of-stream markers until the sender goes
    /// quiet, so a lost final ack cannot strand the peer
    fn linger(&mut self) -> Result<(), TransferError> {
        loop {
            match self.transport.recv_from(self.rtt.timeout())? {
                Some((datagram, _)) => {
                    if let Ok(Packet::Segment(segment)) = self.codec.decode(&datagram) {
                        if segment.is_last {
                            trace!("re-acknowledging end of stream");
                            self.send_final_ack()?;
                        }
                    }
                }
                None => return Ok(()),
            }
        }
    }

    fn bump_timeouts(&mut self) -> Result<(), TransferError> {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= self.config.max_retries {
            warn!(
                retries = self.consecutive_timeouts,
                "giving up on silent sender"
            );
            return Err(TransferError::RetransmissionBudgetExceeded(
                self.consecutive_timeouts,
            ));
        }
        Ok(())
    }

    fn send_packet(&mut self, packet: &Packet) -> io::Result<()> {
        self.scratch.clear();
        self.codec.encode(packet, &mut self.scratch);
        self.transport.send_to(&self.scratch, self.server)
    }
}
