//! Wire format for tunnel packets.
//!
//! Every transport message carries exactly one packet: a fixed 9-byte header
//! (kind, socket id, sequence number, all big-endian) followed by an opaque
//! payload. CONNECT and CLOSE carry no payload; DATA carries up to
//! [`MAX_PAYLOAD_SIZE`] bytes of raw TCP stream data.

use core::fmt;

/// Fixed header size: kind (1) + socket id (4) + sequence number (4).
pub const HEADER_SIZE: usize = 9;

/// Maximum payload carried by a single DATA packet.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// The three packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Open a new logical TCP connection.
    Connect = 0x01,
    /// TCP stream data for an established logical connection.
    Data = 0x02,
    /// Notify the peer that a logical connection has ended.
    Close = 0x03,
}

impl PacketKind {
    /// Parses the wire byte into a kind, or `None` for an unknown opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Close),
            _ => None,
        }
    }

    /// Converts this kind into its wire byte.
    pub fn into_u8(self) -> u8 {
        self as u8
    }
}

/// A single tunnel protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub socket_id: u32,
    pub seq_num: u32,
    pub payload: Vec<u8>,
}

/// Reasons an inbound transport message failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The message is shorter than the fixed header.
    ShortPacket(usize),
    /// The kind byte is not one of the known opcodes.
    UnknownKind(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortPacket(len) => write!(f, "packet too short: {len} bytes (need at least {HEADER_SIZE})"),
            Self::UnknownKind(value) => write!(f, "unknown packet kind: 0x{value:02x}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Packet {
    pub fn connect(socket_id: u32, seq_num: u32) -> Self {
        Self {
            kind: PacketKind::Connect,
            socket_id,
            seq_num,
            payload: Vec::new(),
        }
    }

    pub fn data(socket_id: u32, seq_num: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            socket_id,
            seq_num,
            payload,
        }
    }

    pub fn close(socket_id: u32, seq_num: u32) -> Self {
        Self {
            kind: PacketKind::Close,
            socket_id,
            seq_num,
            payload: Vec::new(),
        }
    }

    /// Serializes this packet for transmission. The result is exactly
    /// [`HEADER_SIZE`] plus the payload length.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.kind.into_u8());
        buf.extend_from_slice(&self.socket_id.to_be_bytes());
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserializes a transport message. The payload is copied out of `data`,
    /// so the packet stays valid after the caller recycles its receive buffer.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::ShortPacket(data.len()));
        }

        let kind = PacketKind::from_u8(data[0]).ok_or(DecodeError::UnknownKind(data[0]))?;
        let socket_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let seq_num = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);

        Ok(Self {
            kind,
            socket_id,
            seq_num,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let cases = [
            Packet::connect(0x12345678, 1),
            Packet::data(0xDEADBEEF, 42, b"hello world".to_vec()),
            Packet::close(0xCAFEBABE, 100),
            Packet::data(0x11223344, 999, vec![0u8; 16 * 1024]),
            Packet::data(0xAABBCCDD, 555, Vec::new()),
        ];

        for pkt in cases {
            let encoded = pkt.encode();
            assert_eq!(encoded.len(), HEADER_SIZE + pkt.payload.len());
            let decoded = Packet::decode(&encoded).expect("decode");
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn decode_too_short() {
        let cases: [&[u8]; 3] = [&[], &[0x01], &[0u8; 8]];
        for data in cases {
            assert_eq!(Packet::decode(data), Err(DecodeError::ShortPacket(data.len())));
        }
    }

    #[test]
    fn decode_exact_header_size() {
        let encoded = Packet::connect(0xABCDEF01, 777).encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = Packet::decode(&encoded).expect("decode");
        assert_eq!(decoded.kind, PacketKind::Connect);
        assert_eq!(decoded.socket_id, 0xABCDEF01);
        assert_eq!(decoded.seq_num, 777);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_unknown_kind() {
        let mut encoded = Packet::close(1, 1).encode();
        encoded[0] = 0x7F;
        assert_eq!(Packet::decode(&encoded), Err(DecodeError::UnknownKind(0x7F)));
    }

    #[test]
    fn boundary_values() {
        let cases = [(0u32, 0u32), (0xFFFFFFFF, 123), (456, 0xFFFFFFFF), (0xFFFFFFFF, 0xFFFFFFFF)];

        for (socket_id, seq_num) in cases {
            let pkt = Packet::data(socket_id, seq_num, b"test".to_vec());
            let decoded = Packet::decode(&pkt.encode()).expect("decode");
            assert_eq!(decoded.socket_id, socket_id);
            assert_eq!(decoded.seq_num, seq_num);
        }
    }

    #[test]
    fn large_payloads() {
        for size in [1024, 16 * 1024, 64 * 1024, 256 * 1024] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            let pkt = Packet::data(0x99999999, 1, payload.clone());
            let decoded = Packet::decode(&pkt.encode()).expect("decode");
            assert_eq!(decoded.payload, payload);
        }
    }

    #[test]
    fn decoded_payload_is_an_independent_copy() {
        let pkt = Packet::data(0x12345678, 10, b"original".to_vec());
        let mut encoded = pkt.encode();

        let decoded = Packet::decode(&encoded).expect("decode");
        encoded[HEADER_SIZE] = 0xFF;

        assert_eq!(decoded.payload, b"original");
    }
}
