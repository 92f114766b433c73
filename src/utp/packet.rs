//! uTP packet encoding/decoding
//!
//! The wire format is a 20-byte header in network byte order, followed
//! by a chain of extension records and the payload. The only extension
//! in use is the selective ack bitmap.

use bytes::Bytes;

use crate::error::{CoreError, ProtocolErrorKind, Result};

/// uTP packet header size
pub const HEADER_SIZE: usize = 20;

/// uTP protocol version
pub const UTP_VERSION: u8 = 1;

/// Packet type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet
    Data = 0,
    /// Connection teardown
    Fin = 1,
    /// Acknowledgment (no payload)
    State = 2,
    /// Connection reset
    Reset = 3,
    /// Connection initiation
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(CoreError::protocol(
                ProtocolErrorKind::UtpHeader,
                format!("Invalid packet type: {}", value),
            )),
        }
    }
}

/// Extension ids in the post-header chain
const EXT_NONE: u8 = 0;
const EXT_SELECTIVE_ACK: u8 = 1;

/// Selective ack extension data.
///
/// Bit `i` of the bitmask means sequence number `ack_nr + 2 + i` was
/// received; `ack_nr + 1` is by definition missing or the cumulative
/// ack would have covered it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectiveAck {
    bitmask: Vec<u8>,
}

impl SelectiveAck {
    pub fn new(bitmask: Vec<u8>) -> Self {
        Self { bitmask }
    }

    /// Check whether the packet at `offset` (relative to `ack_nr + 2`)
    /// is acknowledged
    pub fn is_acked(&self, offset: u16) -> bool {
        let byte_idx = offset as usize / 8;
        let bit_idx = offset as usize % 8;

        match self.bitmask.get(byte_idx) {
            Some(byte) => (byte & (0x80 >> bit_idx)) != 0,
            None => false,
        }
    }

    /// Mark the packet at `offset` as received
    pub fn set_acked(&mut self, offset: u16) {
        let byte_idx = offset as usize / 8;
        let bit_idx = offset as usize % 8;

        while self.bitmask.len() <= byte_idx {
            self.bitmask.push(0);
        }
        self.bitmask[byte_idx] |= 0x80 >> bit_idx;
    }

    /// Number of bits the bitmask can express
    pub fn bit_len(&self) -> usize {
        self.bitmask.len() * 8
    }

    /// True if no packet is marked received
    pub fn is_empty(&self) -> bool {
        self.bitmask.iter().all(|b| *b == 0)
    }
}

/// A decoded uTP packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,

    /// Receiver's connection id
    pub connection_id: u16,

    /// Sender's clock, microseconds, when the packet left
    pub timestamp_us: u32,

    /// Sender's measured one-way delay of the last packet it received
    pub timestamp_diff_us: u32,

    /// Advertised receive window in bytes
    pub wnd_size: u32,

    /// This packet's sequence number
    pub seq_nr: u16,

    /// Cumulative ack of the peer's sequence numbers
    pub ack_nr: u16,

    /// Optional selective ack extension
    pub selective_ack: Option<SelectiveAck>,

    /// Packet payload
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            connection_id,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            selective_ack: None,
            payload: Bytes::new(),
        }
    }

    pub fn syn(connection_id: u16, seq_nr: u16) -> Self {
        Self::new(PacketType::Syn, connection_id, seq_nr, 0)
    }

    pub fn state(connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::State, connection_id, seq_nr, ack_nr)
    }

    pub fn data(connection_id: u16, seq_nr: u16, ack_nr: u16, payload: Bytes) -> Self {
        let mut pkt = Self::new(PacketType::Data, connection_id, seq_nr, ack_nr);
        pkt.payload = payload;
        pkt
    }

    pub fn fin(connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::Fin, connection_id, seq_nr, ack_nr)
    }

    pub fn reset(connection_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self::new(PacketType::Reset, connection_id, seq_nr, ack_nr)
    }

    pub fn with_timestamps(mut self, timestamp_us: u32, timestamp_diff_us: u32) -> Self {
        self.timestamp_us = timestamp_us;
        self.timestamp_diff_us = timestamp_diff_us;
        self
    }

    pub fn with_window(mut self, wnd_size: u32) -> Self {
        self.wnd_size = wnd_size;
        self
    }

    pub fn with_selective_ack(mut self, sack: SelectiveAck) -> Self {
        self.selective_ack = Some(sack);
        self
    }

    /// Encoded size on the wire
    pub fn wire_size(&self) -> usize {
        let ext = match &self.selective_ack {
            Some(sack) => 2 + sack.bitmask.len(),
            None => 0,
        };
        HEADER_SIZE + ext + self.payload.len()
    }

    /// Encode the packet to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());

        let first_ext = if self.selective_ack.is_some() {
            EXT_SELECTIVE_ACK
        } else {
            EXT_NONE
        };

        buf.push((self.packet_type as u8) << 4 | UTP_VERSION);
        buf.push(first_ext);
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_diff_us.to_be_bytes());
        buf.extend_from_slice(&self.wnd_size.to_be_bytes());
        buf.extend_from_slice(&self.seq_nr.to_be_bytes());
        buf.extend_from_slice(&self.ack_nr.to_be_bytes());

        if let Some(sack) = &self.selective_ack {
            buf.push(EXT_NONE);
            buf.push(sack.bitmask.len() as u8);
            buf.extend_from_slice(&sack.bitmask);
        }

        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a packet from bytes.
    ///
    /// Anything malformed is an error; the caller drops the datagram
    /// without touching connection state.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::protocol(
                ProtocolErrorKind::UtpHeader,
                format!("Datagram too short: {} bytes", data.len()),
            ));
        }

        let type_ver = data[0];
        let packet_type = PacketType::try_from(type_ver >> 4)?;
        let version = type_ver & 0x0F;
        if version != UTP_VERSION {
            return Err(CoreError::protocol(
                ProtocolErrorKind::UtpHeader,
                format!("Unsupported uTP version: {}", version),
            ));
        }

        let first_ext = data[1];
        let connection_id = u16::from_be_bytes([data[2], data[3]]);
        let timestamp_us = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let timestamp_diff_us = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let wnd_size = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let seq_nr = u16::from_be_bytes([data[16], data[17]]);
        let ack_nr = u16::from_be_bytes([data[18], data[19]]);

        // Walk the extension chain: next_ext(1) | len(1) | bytes(len),
        // terminated by next_ext == 0 in the *previous* record
        let mut offset = HEADER_SIZE;
        let mut selective_ack = None;
        let mut next_ext = first_ext;

        while next_ext != EXT_NONE {
            if offset + 2 > data.len() {
                return Err(CoreError::protocol(
                    ProtocolErrorKind::UtpExtension,
                    "Extension header truncated",
                ));
            }
            let this_ext = next_ext;
            next_ext = data[offset];
            let ext_len = data[offset + 1] as usize;
            offset += 2;

            if offset + ext_len > data.len() {
                return Err(CoreError::protocol(
                    ProtocolErrorKind::UtpExtension,
                    "Extension data truncated",
                ));
            }

            if this_ext == EXT_SELECTIVE_ACK {
                selective_ack = Some(SelectiveAck::new(data[offset..offset + ext_len].to_vec()));
            }
            // Unknown extensions are skipped, not fatal

            offset += ext_len;
        }

        Ok(Self {
            packet_type,
            connection_id,
            timestamp_us,
            timestamp_diff_us,
            wnd_size,
            seq_nr,
            ack_nr,
            selective_ack,
            payload: Bytes::copy_from_slice(&data[offset..]),
        })
    }

    pub fn is_syn(&self) -> bool {
        self.packet_type == PacketType::Syn
    }

    pub fn is_fin(&self) -> bool {
        self.packet_type == PacketType::Fin
    }

    pub fn is_reset(&self) -> bool {
        self.packet_type == PacketType::Reset
    }

    pub fn is_state(&self) -> bool {
        self.packet_type == PacketType::State
    }

    pub fn is_data(&self) -> bool {
        self.packet_type == PacketType::Data
    }
}

/// Current wall clock in microseconds, truncated to the header's 32 bits
pub fn timestamp_us() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (duration.as_micros() & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let pkt = Packet::syn(12345, 1)
            .with_timestamps(1_000_000, 500)
            .with_window(65535);

        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Syn);
        assert_eq!(decoded.connection_id, 12345);
        assert_eq!(decoded.seq_nr, 1);
        assert_eq!(decoded.ack_nr, 0);
        assert_eq!(decoded.timestamp_us, 1_000_000);
        assert_eq!(decoded.timestamp_diff_us, 500);
        assert_eq!(decoded.wnd_size, 65535);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_data_packet_carries_payload() {
        let payload = Bytes::from_static(b"block data");
        let pkt = Packet::data(7, 5, 3, payload.clone());
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert!(decoded.is_data());
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_selective_ack_bits() {
        let mut sack = SelectiveAck::default();
        sack.set_acked(0);
        sack.set_acked(2);
        sack.set_acked(10);

        assert!(sack.is_acked(0));
        assert!(!sack.is_acked(1));
        assert!(sack.is_acked(2));
        assert!(sack.is_acked(10));
        assert!(!sack.is_acked(100));
    }

    #[test]
    fn test_sack_roundtrip() {
        let mut sack = SelectiveAck::default();
        sack.set_acked(1);
        sack.set_acked(3);

        let pkt = Packet::state(9, 10, 5).with_selective_ack(sack.clone());
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.selective_ack, Some(sack));
    }

    #[test]
    fn test_decode_rejects_short_and_bad_version() {
        assert!(Packet::decode(&[0u8; 19]).is_err());

        let mut bytes = Packet::state(1, 1, 0).encode();
        bytes[0] = (PacketType::State as u8) << 4 | 2; // version 2
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_extension() {
        let mut bytes = Packet::state(1, 1, 0).encode();
        bytes[1] = EXT_SELECTIVE_ACK; // claims an extension that isn't there
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_extension_skipped() {
        let mut bytes = Packet::state(1, 1, 0).encode();
        bytes[1] = 42; // unknown extension id
        bytes.extend_from_slice(&[EXT_NONE, 2, 0xAA, 0xBB]);
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(decoded.selective_ack.is_none());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0).unwrap(), PacketType::Data);
        assert_eq!(PacketType::try_from(4).unwrap(), PacketType::Syn);
        assert!(PacketType::try_from(5).is_err());
    }
}
