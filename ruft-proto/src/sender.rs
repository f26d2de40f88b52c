use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, TransferConfig};
use crate::congestion::Controller;
use crate::error::TransferError;
use crate::packet::{Packet, PacketCodec, Segment};
use crate::rtt::RttEstimator;
use crate::transport::Transport;

/// Counters accumulated over one transfer
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferStats {
    /// Segments handed to the transport, including retransmissions
    pub segments_sent: u64,
    /// Payload bytes handed to the transport, including retransmissions
    pub bytes_sent: u64,
    /// Segments sent more than once
    pub retransmits: u64,
    /// Receive waits that expired
    pub timeouts: u64,
    /// Stale cumulative acks observed
    pub duplicate_acks: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Handshake,
    Streaming,
    Draining,
    Closed,
}

/// Bookkeeping for one in-flight segment
#[derive(Debug, Clone, Copy)]
struct SentSegment {
    len: usize,
    sent_at: Instant,
}

/// Drives one outbound transfer to completion
///
/// The engine owns the transmission loop: it decides which byte ranges the
/// congestion window admits, tracks per-segment send timestamps, interprets
/// the cumulative ack stream, and feeds congestion and RTT state machines.
/// All channel anomalies are absorbed and converted into retransmission;
/// `run` fails only when the retry budget is spent or the transport itself
/// breaks.
pub struct SenderEngine<T, C> {
    transport: T,
    codec: C,
    config: TransferConfig,
    data: Bytes,
    rtt: RttEstimator,
    congestion: Box<dyn Controller>,
    state: State,
    /// Lowest unacknowledged offset
    base: u64,
    /// Lowest offset not yet sent in the current window pass
    next: u64,
    /// Send bookkeeping per in-flight segment, keyed by offset
    in_flight: BTreeMap<u64, SentSegment>,
    /// Offsets sent more than once; acks completing these are ambiguous and
    /// never feed the RTT estimator
    retransmitted: BTreeSet<u64>,
    peer: Option<SocketAddr>,
    consecutive_timeouts: u32,
    stats: TransferStats,
    scratch: Vec<u8>,
}

impl<T: Transport, C: PacketCodec> SenderEngine<T, C> {
    /// Construct an engine that will serve `data` to the first peer that
    /// makes contact
    pub fn new(transport: T, codec: C, data: Bytes, config: TransferConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rtt = RttEstimator::new(config.initial_rto);
        let congestion = config
            .congestion_controller_factory
            .build(config.mss as u64);
        Ok(Self {
            transport,
            codec,
            data,
            rtt,
            congestion,
            config,
            state: State::Handshake,
            base: 0,
            next: 0,
            in_flight: BTreeMap::new(),
            retransmitted: BTreeSet::new(),
            peer: None,
            consecutive_timeouts: 0,
            stats: TransferStats::default(),
            scratch: Vec::new(),
        })
    }

    /// Counters for the transfer so far
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// The RTT estimator driving this engine's timeouts
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the transfer to completion
    ///
    /// Blocks until the peer acknowledges the end of the stream or the
    /// retry budget is exhausted.
    pub fn run(&mut self) -> Result<TransferStats, TransferError> {
        loop {
            match self.state {
                State::Handshake => self.await_peer()?,
                State::Streaming => self.stream_once()?,
                State::Draining => self.drain_once()?,
                State::Closed => return Ok(self.stats),
            }
        }
    }

    /// Wait for the peer's connection request; any first datagram will do
    fn await_peer(&mut self) -> Result<(), TransferError> {
        match self.transport.recv_from(self.rtt.timeout())? {
            Some((_, peer)) => {
                debug!(%peer, bytes = self.data.len(), "connection request received");
                self.peer = Some(peer);
                self.consecutive_timeouts = 0;
                self.state = if self.data.is_empty() {
                    State::Draining
                } else {
                    State::Streaming
                };
            }
            None => {
                self.rtt.on_timeout();
                self.bump_timeouts()?;
            }
        }
        Ok(())
    }

    fn stream_once(&mut self) -> Result<(), TransferError> {
        self.fill_window()?;
        self.await_ack()?;
        if self.base >= self.total() && self.state == State::Streaming {
            debug!("all payload acknowledged, draining");
            self.state = State::Draining;
        }
        Ok(())
    }

    /// Send every segment the window admits that is unsent or stale
    fn fill_window(&mut self) -> Result<(), TransferError> {
        let window_bytes = self.congestion.window_segments() * self.config.mss as u64;
        let window_end = self.base.saturating_add(window_bytes).min(self.total());
        let now = Instant::now();
        let rto = self.rtt.timeout();
        while self.next < window_end {
            let offset = self.next;
            self.next = (offset + self.config.mss as u64).min(self.total());
            if let Some(sent) = self.in_flight.get(&offset) {
                // Recently (re)sent; give its timer a chance to fire first
                if now.duration_since(sent.sent_at) < rto {
                    continue;
                }
            }
            self.send_segment(offset, now)?;
        }
        Ok(())
    }

    fn send_segment(&mut self, offset: u64, now: Instant) -> Result<(), TransferError> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let end = (offset + self.config.mss as u64).min(self.total());
        let len = (end - offset) as usize;
        let resend = self.in_flight.contains_key(&offset) || self.retransmitted.contains(&offset);
        if resend {
            self.retransmitted.insert(offset);
            self.stats.retransmits += 1;
        }
        let segment = Segment {
            offset,
            payload: self.data.slice(offset as usize..end as usize),
            is_first: offset == 0,
            is_last: false,
        };
        trace!(offset, len, resend, "sending segment");
        self.send_packet(&Packet::Segment(segment), peer)?;
        self.stats.segments_sent += 1;
        self.stats.bytes_sent += len as u64;
        self.in_flight.insert(offset, SentSegment { len, sent_at: now });
        Ok(())
    }

    /// Block for one inbound ack, bounded by the current RTO
    fn await_ack(&mut self) -> Result<(), TransferError> {
        match self.transport.recv_from(self.rtt.timeout())? {
            Some((datagram, _)) => match self.codec.decode(&datagram) {
                Ok(Packet::Ack { offset }) => self.handle_ack(offset),
                Ok(Packet::FinalAck) => {
                    debug!("peer reported end of stream");
                    self.state = State::Closed;
                }
                Ok(Packet::Segment(_)) => trace!("ignoring unexpected segment"),
                Err(error) => {
                    // Indistinguishable from channel loss; the
                    // retransmission machinery covers it
                    trace!(%error, "dropping malformed datagram");
                }
            },
            None => self.on_ack_timeout()?,
        }
        Ok(())
    }

    fn handle_ack(&mut self, offset: u64) {
        if offset > self.base {
            self.on_new_ack(offset);
        } else {
            self.stats.duplicate_acks += 1;
            if self.congestion.on_duplicate_ack(offset) {
                // Fast retransmit: the base segment goes out again on the
                // next window pass, regardless of how recently it was sent
                debug!(offset, base = self.base, "fast retransmit");
                self.retransmitted.insert(self.base);
                self.in_flight.remove(&self.base);
                self.next = self.base;
            }
        }
    }

    fn on_new_ack(&mut self, offset: u64) {
        let now = Instant::now();
        // Only segments sent exactly once yield a clean RTT signal
        if let Some((&sent_offset, sent)) = self.in_flight.range(..offset).next_back() {
            if sent_offset + sent.len as u64 == offset && !self.retransmitted.contains(&sent_offset)
            {
                self.rtt.on_sample(now.duration_since(sent.sent_at));
            }
        }
        self.congestion.on_new_ack(now, offset);
        self.base = offset;
        if self.next < self.base {
            self.next = self.base;
        }
        self.consecutive_timeouts = 0;
        // Drop bookkeeping the cumulative ack has covered
        self.in_flight = self.in_flight.split_off(&offset);
        self.retransmitted = self.retransmitted.split_off(&offset);
        trace!(
            base = self.base,
            window = self.congestion.window(),
            "new cumulative ack"
        );
    }

    fn on_ack_timeout(&mut self) -> Result<(), TransferError> {
        self.rtt.on_timeout();
        self.congestion.on_timeout();
        // The whole outstanding window becomes resend-eligible, and every
        // later ack for it is ambiguous
        self.retransmitted.extend(self.in_flight.keys().copied());
        self.in_flight.clear();
        self.next = self.base;
        warn!(base = self.base, rto = ?self.rtt.timeout(), "retransmission timeout");
        self.bump_timeouts()
    }

    /// Announce end of stream and wait for the terminal handshake
    ///
    /// The `is_last` segment is only ever sent from here, after every
    /// payload byte was acknowledged, so a reordered end-of-stream marker
    /// can never truncate the receiver's output.
    fn drain_once(&mut self) -> Result<(), TransferError> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let total = self.total();
        let segment = Segment {
            offset: total,
            payload: Bytes::new(),
            is_first: total == 0,
            is_last: true,
        };
        trace!(offset = total, "sending end of stream");
        self.send_packet(&Packet::Segment(segment), peer)?;
        self.stats.segments_sent += 1;
        match self.transport.recv_from(self.rtt.timeout())? {
            Some((datagram, _)) => match self.codec.decode(&datagram) {
                Ok(Packet::FinalAck) => {
                    debug!(bytes = total, "transfer complete");
                    self.state = State::Closed;
                }
                Ok(_) => trace!("ignoring stale packet while draining"),
                Err(error) => trace!(%error, "dropping malformed datagram"),
            },
            None => {
                self.rtt.on_timeout();
                self.bump_timeouts()?;
            }
        }
        Ok(())
    }

    fn bump_timeouts(&mut self) -> Result<(), TransferError> {
        self.stats.timeouts += 1;
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= self.config.max_retries {
            warn!(
                retries = self.consecutive_timeouts,
                "giving up on unresponsive peer"
            );
            return Err(TransferError::RetransmissionBudgetExceeded(
                self.consecutive_timeouts,
            ));
        }
        Ok(())
    }

    fn send_packet(&mut self, packet: &Packet, peer: SocketAddr) -> io::Result<()> {
        self.scratch.clear();
        self.codec.encode(packet, &mut self.scratch);
        self.transport.send_to(&self.scratch, peer)
    }

    fn total(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::packet::BinaryCodec;

    const MSS: usize = 4;

    /// Replays a fixed inbound script and records everything sent;
    /// an exhausted script reads as a timeout
    struct ScriptTransport {
        inbound: VecDeque<Packet>,
        sent: Vec<Packet>,
        peer: SocketAddr,
    }

    impl ScriptTransport {
        fn new(inbound: Vec<Packet>) -> Self {
            Self {
                inbound: inbound.into(),
                sent: Vec::new(),
                peer: "127.0.0.1:9".parse().unwrap(),
            }
        }
    }

    impl Transport for ScriptTransport {
        fn send_to(&mut self, datagram: &[u8], _peer: SocketAddr) -> io::Result<()> {
            self.sent.push(BinaryCodec.decode(datagram).unwrap());
            Ok(())
        }

        fn recv_from(
            &mut self,
            _timeout: Duration,
        ) -> io::Result<Option<(Bytes, SocketAddr)>> {
            match self.inbound.pop_front() {
                Some(packet) => {
                    let mut buf = Vec::new();
                    BinaryCodec.encode(&packet, &mut buf);
                    Ok(Some((buf.into(), self.peer)))
                }
                None => Ok(None),
            }
        }
    }

    fn config() -> TransferConfig {
        let mut config = TransferConfig::default();
        config.mss(MSS).max_retries(3);
        config
    }

    fn engine(data: &'static [u8], inbound: Vec<Packet>) -> SenderEngine<ScriptTransport, BinaryCodec> {
        SenderEngine::new(
            ScriptTransport::new(inbound),
            BinaryCodec,
            Bytes::from_static(data),
            config(),
        )
        .unwrap()
    }

    fn segment_offsets(sent: &[Packet]) -> Vec<u64> {
        sent.iter()
            .filter_map(|packet| match packet {
                Packet::Segment(segment) if !segment.is_last => Some(segment.offset),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn clean_transfer_walks_the_states() {
        let mut sender = engine(
            b"abcdwxyz",
            vec![
                Packet::Ack { offset: 0 }, // connection request
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 8 },
                Packet::FinalAck,
            ],
        );
        let stats = sender.run().unwrap();
        assert_eq!(segment_offsets(&sender.transport.sent), vec![0, 4]);
        let last = sender.transport.sent.last().unwrap();
        assert_matches!(
            last,
            Packet::Segment(Segment { offset: 8, is_last: true, .. })
        );
        assert_eq!(stats.bytes_sent, 8);
        assert_eq!(stats.retransmits, 0);
        // The first ack completed a never-retransmitted segment
        assert!(sender.rtt().smoothed().is_some());
    }

    #[test]
    fn first_segment_carries_the_first_flag() {
        let mut sender = engine(
            b"abcd",
            vec![
                Packet::Ack { offset: 0 },
                Packet::Ack { offset: 4 },
                Packet::FinalAck,
            ],
        );
        sender.run().unwrap();
        assert_matches!(
            &sender.transport.sent[0],
            Packet::Segment(Segment { offset: 0, is_first: true, .. })
        );
    }

    #[test]
    fn triple_duplicate_ack_forces_retransmit() {
        let mut sender = engine(
            b"abcdefghijklmnop",
            vec![
                Packet::Ack { offset: 0 },
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 16 },
                Packet::FinalAck,
            ],
        );
        let stats = sender.run().unwrap();
        let offsets = segment_offsets(&sender.transport.sent);
        let resends = offsets.iter().filter(|&&offset| offset == 4).count();
        assert_eq!(resends, 2, "fast retransmit must resend the base segment");
        assert_eq!(stats.retransmits, 1);
        assert_eq!(stats.duplicate_acks, 3);
    }

    #[test]
    fn silence_exhausts_the_retry_budget() {
        let mut sender = engine(b"abcd", vec![Packet::Ack { offset: 0 }]);
        let result = sender.run();
        assert_matches!(result, Err(TransferError::RetransmissionBudgetExceeded(3)));
        // The lone segment went out once per timeout round
        let offsets = segment_offsets(&sender.transport.sent);
        assert!(offsets.iter().all(|&offset| offset == 0));
        assert!(offsets.len() >= 2);
        assert_eq!(sender.stats().timeouts, 3);
    }

    #[test]
    fn no_peer_contact_aborts() {
        let mut sender = engine(b"abcd", vec![]);
        assert_matches!(
            sender.run(),
            Err(TransferError::RetransmissionBudgetExceeded(3))
        );
        assert!(sender.transport.sent.is_empty());
    }

    #[test]
    fn empty_stream_sends_only_end_of_stream() {
        let mut sender = engine(b"", vec![Packet::Ack { offset: 0 }, Packet::FinalAck]);
        sender.run().unwrap();
        assert_matches!(
            &sender.transport.sent[..],
            [Packet::Segment(Segment { offset: 0, is_first: true, is_last: true, .. })]
        );
    }

    #[test]
    fn ambiguous_ack_takes_no_rtt_sample() {
        let mut sender = engine(
            b"abcd",
            vec![
                Packet::Ack { offset: 0 },
                // Silence: segment 0 times out and is retransmitted
                // (script exhaustion), then the ack finally lands
            ],
        );
        // Run the pieces by hand to interleave a timeout with the ack
        sender.await_peer().unwrap();
        sender.stream_once().unwrap(); // sends 0, times out
        sender.fill_window().unwrap(); // retransmits 0
        sender.handle_ack(4);
        assert!(sender.rtt().smoothed().is_none());
        assert_eq!(sender.base, 4);
    }

    #[test]
    fn duplicate_acks_below_threshold_do_not_rewind() {
        let mut sender = engine(
            b"abcdefgh",
            vec![
                Packet::Ack { offset: 0 },
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 4 },
                Packet::Ack { offset: 8 },
                Packet::FinalAck,
            ],
        );
        let stats = sender.run().unwrap();
        assert_eq!(stats.retransmits, 0);
        assert_eq!(stats.duplicate_acks, 1);
    }
}
