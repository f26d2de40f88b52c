use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

const KIND_SEGMENT: u8 = 0x01;
const KIND_ACK: u8 = 0x02;
const KIND_FINAL_ACK: u8 = 0x03;

const FLAG_FIRST: u8 = 0x01;
const FLAG_LAST: u8 = 0x02;

/// One datagram's worth of protocol payload
///
/// The terminal handshake is a distinct kind rather than a sentinel offset,
/// so every `Ack` offset is a valid position in the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A slice of the byte stream
    Segment(Segment),
    /// Cumulative acknowledgment: the receiver holds everything below `offset`
    Ack {
        /// The next byte offset the receiver expects
        offset: u64,
    },
    /// Terminal handshake: the receiver saw the end of the stream
    FinalAck,
}

/// A slice of the transferred byte stream, identified by its offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Cumulative bytes sent before this segment; doubles as its identifier
    pub offset: u64,
    /// Stream data, at most one MSS
    pub payload: Bytes,
    /// Marks the first segment of the stream
    pub is_first: bool,
    /// Marks end of stream; such segments carry no payload
    pub is_last: bool,
}

impl Segment {
    /// Offset of the first byte past this segment
    pub fn end(&self) -> u64 {
        self.offset + self.payload.len() as u64
    }
}

/// Serializes packets for the wire and parses them back
///
/// Opaque to the engines; the only requirement is that offsets and the
/// first/last flags round-trip exactly.
pub trait PacketCodec {
    /// Append the encoding of `packet` to `buf`
    fn encode(&self, packet: &Packet, buf: &mut Vec<u8>);
    /// Parse one datagram; failures are treated as channel loss
    fn decode(&self, datagram: &[u8]) -> Result<Packet, DecodeError>;
}

/// The standard binary encoding: a kind tag, then fixed-width big-endian
/// fields and a length-prefixed payload
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl PacketCodec for BinaryCodec {
    fn encode(&self, packet: &Packet, buf: &mut Vec<u8>) {
        match packet {
            Packet::Segment(segment) => {
                buf.put_u8(KIND_SEGMENT);
                let mut flags = 0;
                if segment.is_first {
                    flags |= FLAG_FIRST;
                }
                if segment.is_last {
                    flags |= FLAG_LAST;
                }
                buf.put_u8(flags);
                buf.put_u64(segment.offset);
                buf.put_u32(segment.payload.len() as u32);
                buf.put_slice(&segment.payload);
            }
            Packet::Ack { offset } => {
                buf.put_u8(KIND_ACK);
                buf.put_u64(*offset);
            }
            Packet::FinalAck => buf.put_u8(KIND_FINAL_ACK),
        }
    }

    fn decode(&self, datagram: &[u8]) -> Result<Packet, DecodeError> {
        let mut buf = datagram;
        if buf.remaining() < 1 {
            return Err(DecodeError::UnexpectedEnd);
        }
        match buf.get_u8() {
            KIND_SEGMENT => {
                if buf.remaining() < 1 + 8 + 4 {
                    return Err(DecodeError::UnexpectedEnd);
                }
                let flags = buf.get_u8();
                if flags & !(FLAG_FIRST | FLAG_LAST) != 0 {
                    return Err(DecodeError::InvalidFlags(flags));
                }
                let offset = buf.get_u64();
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(DecodeError::UnexpectedEnd);
                }
                Ok(Packet::Segment(Segment {
                    offset,
                    payload: buf.copy_to_bytes(len),
                    is_first: flags & FLAG_FIRST != 0,
                    is_last: flags & FLAG_LAST != 0,
                }))
            }
            KIND_ACK => {
                if buf.remaining() < 8 {
                    return Err(DecodeError::UnexpectedEnd);
                }
                Ok(Packet::Ack {
                    offset: buf.get_u64(),
                })
            }
            KIND_FINAL_ACK => Ok(Packet::FinalAck),
            kind => Err(DecodeError::UnknownKind(kind)),
        }
    }
}

/// Reasons an inbound datagram failed to parse
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The datagram ended before the advertised contents
    #[error("datagram ended unexpectedly")]
    UnexpectedEnd,
    /// The kind tag is not one this protocol version emits
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),
    /// Reserved flag bits were set
    #[error("invalid segment flags {0:#04x}")]
    InvalidFlags(u8),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = Vec::new();
        BinaryCodec.encode(&packet, &mut buf);
        BinaryCodec.decode(&buf).unwrap()
    }

    #[test]
    fn segment_roundtrip() {
        let segment = Segment {
            offset: 2800,
            payload: Bytes::from_static(b"some payload"),
            is_first: false,
            is_last: false,
        };
        assert_eq!(
            roundtrip(Packet::Segment(segment.clone())),
            Packet::Segment(segment)
        );
    }

    #[test]
    fn flags_roundtrip() {
        let first = Segment {
            offset: 0,
            payload: Bytes::from_static(b"x"),
            is_first: true,
            is_last: false,
        };
        let last = Segment {
            offset: 140_000,
            payload: Bytes::new(),
            is_first: false,
            is_last: true,
        };
        assert_matches!(
            roundtrip(Packet::Segment(first)),
            Packet::Segment(Segment { is_first: true, is_last: false, .. })
        );
        assert_matches!(
            roundtrip(Packet::Segment(last)),
            Packet::Segment(Segment { offset: 140_000, is_last: true, .. })
        );
    }

    #[test]
    fn ack_roundtrip() {
        assert_eq!(
            roundtrip(Packet::Ack { offset: 4200 }),
            Packet::Ack { offset: 4200 }
        );
        assert_eq!(roundtrip(Packet::FinalAck), Packet::FinalAck);
    }

    #[test]
    fn truncated_datagrams_are_rejected() {
        let mut buf = Vec::new();
        BinaryCodec.encode(
            &Packet::Segment(Segment {
                offset: 0,
                payload: Bytes::from_static(b"payload"),
                is_first: true,
                is_last: false,
            }),
            &mut buf,
        );
        for len in 0..buf.len() {
            assert_matches!(
                BinaryCodec.decode(&buf[..len]),
                Err(DecodeError::UnexpectedEnd)
            );
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_matches!(
            BinaryCodec.decode(&[0x7f, 0, 0]),
            Err(DecodeError::UnknownKind(0x7f))
        );
    }

    #[test]
    fn reserved_flags_are_rejected() {
        let mut buf = Vec::new();
        BinaryCodec.encode(
            &Packet::Segment(Segment {
                offset: 0,
                payload: Bytes::new(),
                is_first: false,
                is_last: false,
            }),
            &mut buf,
        );
        buf[1] = 0xf0;
        assert_matches!(
            BinaryCodec.decode(&buf),
            Err(DecodeError::InvalidFlags(0xf0))
        );
    }
}
