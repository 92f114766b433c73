//! uTP connection state machine types

use std::time::Instant;

use bytes::Bytes;

/// uTP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, no handshake yet
    Idle,

    /// SYN sent, waiting for the acking STATE (initiator)
    SynSent,

    /// Connection established, data transfer active
    Connected,

    /// FIN sent, waiting for it to be acked
    FinSent,

    /// Connection torn down by RESET (peer's or synthesized)
    Reset,

    /// FIN acked; lingering briefly to absorb stray packets
    CloseWait,

    /// Finished; the manager garbage-collects the socket
    Deleted,
}

impl ConnectionState {
    /// Check if data can be queued for sending
    pub fn can_send_data(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is past the point of no return
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reset | Self::CloseWait | Self::Deleted)
    }

    /// Check if the handshake or transfer is still in progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::SynSent | Self::Connected | Self::FinSent)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::FinSent => write!(f, "FIN_SENT"),
            Self::Reset => write!(f, "RESET"),
            Self::CloseWait => write!(f, "CLOSE_WAIT"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Clean FIN exchange
    Graceful,
    /// Peer sent RESET
    PeerReset,
    /// A packet exhausted its retransmission budget
    RetransmitExhausted,
}

/// A packet in the send window awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    /// Sequence number
    pub seq_nr: u16,

    /// Payload carried (empty for SYN/FIN)
    pub payload: Bytes,

    /// Bytes charged against the congestion window
    pub size: u32,

    /// Time of the first transmission
    pub first_sent: Instant,

    /// Time of the most recent transmission
    pub last_sent: Instant,

    /// Total transmissions so far (1 = never retransmitted)
    pub transmissions: u32,

    /// This packet is a path-MTU probe; its loss is a probe result,
    /// not congestion
    pub mtu_probe: bool,
}

impl OutstandingPacket {
    pub fn new(seq_nr: u16, payload: Bytes, size: u32, mtu_probe: bool) -> Self {
        let now = Instant::now();
        Self {
            seq_nr,
            payload,
            size,
            first_sent: now,
            last_sent: now,
            transmissions: 1,
            mtu_probe,
        }
    }

    pub fn mark_retransmit(&mut self) {
        self.last_sent = Instant::now();
        self.transmissions += 1;
    }
}

/// Per-connection transfer statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Packets sent
    pub packets_sent: u64,

    /// Packets received
    pub packets_received: u64,

    /// Bytes sent (payload only)
    pub bytes_sent: u64,

    /// Bytes received (payload only)
    pub bytes_received: u64,

    /// Packets retransmitted
    pub retransmits: u64,

    /// Fast retransmits triggered by duplicate acks
    pub fast_retransmits: u64,

    /// Duplicate acks received
    pub duplicate_acks: u64,

    /// Retransmission timer expirations
    pub timeouts: u64,
}
