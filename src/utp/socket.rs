//! uTP connection state machine and socket handle
//!
//! [`UtpSocketInner`] is the per-connection state machine. All of its
//! transitions are synchronous: packets come in from the multiplexer's
//! receive task, timers from its tick task, and bytes from the owning
//! [`UtpSocket`] handle, each locking the state briefly and never
//! across an await. Outbound datagrams leave through an unbounded
//! channel drained by the multiplexer's send task.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::config::UtpSettings;
use crate::error::{CoreError, NetworkErrorKind, Result};

use super::congestion::LedbatController;
use super::mtu::MtuDiscovery;
use super::packet::{timestamp_us, Packet, PacketType, SelectiveAck, HEADER_SIZE};
use super::state::{CloseCause, ConnectionState, ConnectionStats, OutstandingPacket};

/// Lingering in CLOSE_WAIT absorbs stray retransmissions before the
/// socket is collected
const CLOSE_WAIT_LINGER: Duration = Duration::from_secs(1);

/// Cap on buffered out-of-order packets
const MAX_REASSEMBLY_PACKETS: usize = 256;

/// Handshake timeout for `connect`
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A datagram queued for the multiplexer's send task
pub(crate) struct OutgoingDatagram {
    pub data: Vec<u8>,
    pub remote: SocketAddr,
    /// Ask the network stack not to fragment (MTU probes)
    pub dont_fragment: bool,
    /// Socket to inform if the stack refuses the size outright
    pub probe_owner: Option<Weak<Mutex<UtpSocketInner>>>,
}

pub(crate) type DatagramSender = mpsc::UnboundedSender<OutgoingDatagram>;

/// Per-connection state machine
pub struct UtpSocketInner {
    remote: SocketAddr,

    /// Id carried in every packet we send (the peer receives on it)
    send_id: u16,

    /// Id the peer puts in packets meant for us
    recv_id: u16,

    state: ConnectionState,
    close_cause: Option<CloseCause>,

    /// Next sequence number to send
    seq_nr: u16,

    /// Sequence number of the SYN, while it may still need resending
    syn_seq: Option<u16>,

    /// Highest in-order sequence number received from the peer
    ack_nr: u16,

    /// Last ack we put on the wire, and whether one is owed
    last_ack_sent: u16,
    ack_pending: bool,

    /// Last cumulative ack received, for duplicate detection
    last_ack_recv: u16,
    dup_ack_count: u32,

    congestion: LedbatController,
    mtu: MtuDiscovery,

    /// Packets in flight, keyed by sequence number
    send_window: BTreeMap<u16, OutstandingPacket>,

    /// Out-of-order payloads awaiting their predecessors
    reassembly: BTreeMap<u16, Bytes>,

    /// In-order bytes ready for the reader
    recv_buffer: VecDeque<u8>,

    /// Peer's advertised receive window
    remote_window: u32,

    /// Our one-way delay measurement, echoed in outgoing packets
    reply_micro: u32,

    /// Sequence number of the peer's FIN, once seen
    eof_seq: Option<u16>,

    /// Sequence number of our FIN, once sent
    fin_seq: Option<u16>,

    close_wait_deadline: Option<Instant>,

    settings: UtpSettings,
    stats: ConnectionStats,

    outgoing_tx: DatagramSender,
    progress: Arc<Notify>,
    self_weak: Weak<Mutex<UtpSocketInner>>,
}

impl UtpSocketInner {
    fn new(
        remote: SocketAddr,
        send_id: u16,
        recv_id: u16,
        settings: UtpSettings,
        outgoing_tx: DatagramSender,
        progress: Arc<Notify>,
    ) -> Self {
        Self {
            remote,
            send_id,
            recv_id,
            state: ConnectionState::Idle,
            close_cause: None,
            seq_nr: 1,
            syn_seq: None,
            ack_nr: 0,
            last_ack_sent: 0,
            ack_pending: false,
            last_ack_recv: 0,
            dup_ack_count: 0,
            congestion: LedbatController::new(&settings),
            mtu: MtuDiscovery::new(settings.mtu_floor, settings.mtu_ceiling),
            send_window: BTreeMap::new(),
            reassembly: BTreeMap::new(),
            recv_buffer: VecDeque::new(),
            remote_window: 0,
            reply_micro: 0,
            eof_seq: None,
            fin_seq: None,
            close_wait_deadline: None,
            settings,
            stats: ConnectionStats::default(),
            outgoing_tx,
            progress,
            self_weak: Weak::new(),
        }
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn recv_id(&self) -> u16 {
        self.recv_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    pub(crate) fn close_cause(&self) -> Option<CloseCause> {
        self.close_cause
    }

    /// Send the SYN and start the handshake
    pub(crate) fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(CoreError::InvalidState {
                action: "connect",
                current_state: self.state.to_string(),
            });
        }

        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.syn_seq = Some(seq);
        self.state = ConnectionState::SynSent;

        let pkt = Packet::syn(self.send_id, seq);
        self.transmit(pkt, Bytes::new(), false);
        Ok(())
    }

    /// Absorb an inbound SYN: pick our initial sequence number, ack
    /// the SYN, and enter CONNECTED
    pub(crate) fn accept_syn(&mut self, syn: &Packet) {
        self.ack_nr = syn.seq_nr;
        self.last_ack_recv = syn.ack_nr;
        self.remote_window = syn.wnd_size;
        self.seq_nr = rand::random();
        if syn.timestamp_us != 0 {
            self.reply_micro = timestamp_us().wrapping_sub(syn.timestamp_us);
        }
        self.state = ConnectionState::Connected;
        self.stats.packets_received += 1;
        self.send_ack();
    }

    /// Feed one decoded packet through the state machine
    pub(crate) fn handle_packet(&mut self, pkt: &Packet) {
        self.stats.packets_received += 1;
        self.remote_window = pkt.wnd_size;

        if pkt.timestamp_us != 0 {
            self.reply_micro = timestamp_us().wrapping_sub(pkt.timestamp_us);
        }
        if pkt.timestamp_diff_us != 0 {
            self.congestion
                .add_delay_sample(Instant::now(), pkt.timestamp_diff_us);
        }

        match self.state {
            ConnectionState::SynSent => {
                if pkt.is_state() {
                    // The acking STATE carries the peer's next sequence
                    // number; nothing has consumed it yet
                    self.ack_nr = pkt.seq_nr.wrapping_sub(1);
                    self.last_ack_recv = pkt.ack_nr.wrapping_sub(1);
                    self.process_acks(pkt);
                    self.syn_seq = None;
                    self.state = ConnectionState::Connected;
                    self.notify();
                } else if pkt.is_reset() {
                    self.enter_reset(CloseCause::PeerReset);
                }
            }

            ConnectionState::Connected | ConnectionState::FinSent => {
                if pkt.is_reset() {
                    self.enter_reset(CloseCause::PeerReset);
                    return;
                }
                if pkt.is_syn() {
                    // Retransmitted SYN: our acking STATE was lost
                    self.ack_pending = true;
                    return;
                }

                self.process_acks(pkt);

                if pkt.is_fin() {
                    self.eof_seq = Some(pkt.seq_nr);
                }
                if pkt.is_data() || pkt.is_fin() {
                    self.receive_data(pkt.seq_nr, pkt.payload.clone());
                }
                self.notify();
            }

            ConnectionState::CloseWait => {
                // Stray retransmissions still deserve acks
                if pkt.is_data() || pkt.is_fin() {
                    self.ack_pending = true;
                }
            }

            ConnectionState::Idle | ConnectionState::Reset | ConnectionState::Deleted => {}
        }
    }

    /// Cumulative ack, selective ack, and duplicate-ack bookkeeping
    fn process_acks(&mut self, pkt: &Packet) {
        let ack_nr = pkt.ack_nr;

        // An ack for a sequence number we never sent is a protocol
        // error; drop the information without touching state
        let highest_sent = self.seq_nr.wrapping_sub(1);
        if !seq_before_eq(ack_nr, highest_sent) {
            return;
        }

        let mut bytes_acked: u32 = 0;
        let mut rtt_sample: Option<Duration> = None;
        let mut advanced = false;

        // Cumulative portion
        let acked: Vec<u16> = self
            .send_window
            .keys()
            .copied()
            .filter(|&seq| seq_before_eq(seq, ack_nr))
            .collect();
        for seq in acked {
            if let Some(out) = self.send_window.remove(&seq) {
                advanced = true;
                bytes_acked += out.size;
                if out.transmissions == 1 {
                    // Retransmitted packets give ambiguous samples
                    rtt_sample = Some(out.first_sent.elapsed());
                }
                if out.mtu_probe {
                    self.mtu.on_probe_acked(seq);
                }
                if self.fin_seq == Some(seq) {
                    self.enter_close_wait();
                }
            }
        }

        // Selective portion
        if let Some(sack) = &pkt.selective_ack {
            for i in 0..sack.bit_len() {
                if !sack.is_acked(i as u16) {
                    continue;
                }
                let seq = ack_nr.wrapping_add(2).wrapping_add(i as u16);
                if let Some(out) = self.send_window.remove(&seq) {
                    bytes_acked += out.size;
                    if out.mtu_probe {
                        self.mtu.on_probe_acked(seq);
                    }
                    if self.fin_seq == Some(seq) {
                        self.enter_close_wait();
                    }
                }
            }
        }

        // Duplicate-ack accounting: the same cumulative ack repeated
        // with a selective ack naming later packets means the packet
        // right after `ack_nr` went missing
        let missing = ack_nr.wrapping_add(1);
        if advanced {
            self.dup_ack_count = 0;
        } else if ack_nr == self.last_ack_recv
            && pkt.selective_ack.as_ref().is_some_and(|s| !s.is_empty())
            && self.send_window.contains_key(&missing)
        {
            self.dup_ack_count += 1;
            self.stats.duplicate_acks += 1;
            if self.dup_ack_count >= 3 {
                self.dup_ack_count = 0;
                self.fast_retransmit(missing);
            }
        }
        self.last_ack_recv = ack_nr;

        if bytes_acked > 0 {
            self.congestion.on_ack(bytes_acked, rtt_sample);
            self.notify();
        }
    }

    /// Retransmit exactly one lost packet and halve the window; the
    /// retransmission timer keeps its current backoff
    fn fast_retransmit(&mut self, seq: u16) {
        if self.resend(seq) {
            self.stats.fast_retransmits += 1;
            self.congestion.on_fast_retransmit();
        }
    }

    /// Buffer or deliver an inbound payload
    fn receive_data(&mut self, seq_nr: u16, payload: Bytes) {
        let expected = self.ack_nr.wrapping_add(1);

        if seq_nr == expected {
            self.stats.bytes_received += payload.len() as u64;
            self.recv_buffer.extend(payload.iter());
            self.ack_nr = seq_nr;

            // Pull any successors out of the reassembly buffer
            loop {
                let next = self.ack_nr.wrapping_add(1);
                match self.reassembly.remove(&next) {
                    Some(data) => {
                        self.stats.bytes_received += data.len() as u64;
                        self.recv_buffer.extend(data.iter());
                        self.ack_nr = next;
                    }
                    None => break,
                }
            }
            self.ack_pending = true;
        } else if seq_after(seq_nr, expected) && self.reassembly.len() < MAX_REASSEMBLY_PACKETS {
            self.reassembly.insert(seq_nr, payload);
            // An out-of-order arrival is worth a selective ack now
            self.ack_pending = true;
        } else {
            // Duplicate of something already delivered; re-ack so the
            // peer stops resending it
            self.ack_pending = true;
        }
    }

    /// Queue up to `data.len()` bytes of payload, segmented to the
    /// current MTU, gated by the congestion window, the pacing quota
    /// and the peer's advertised window. Returns the bytes consumed.
    pub(crate) fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        if !self.state.can_send_data() {
            return Err(self.terminal_error("send"));
        }

        let now = Instant::now();
        let mut sent = 0;

        while sent < data.len() {
            let mss = self.mtu.mss() - HEADER_SIZE;
            let remaining = data.len() - sent;

            // An MTU probe is an ordinary data packet sized to the
            // bisection midpoint, flagged don't-fragment
            let (chunk_len, probe) = match self.mtu.probe_payload_size(now) {
                Some(probe_payload) if remaining >= probe_payload - HEADER_SIZE => {
                    (probe_payload - HEADER_SIZE, true)
                }
                _ => (remaining.min(mss), false),
            };

            let wire_size = (HEADER_SIZE + chunk_len) as u32;
            if !self.congestion.can_send(wire_size) {
                break;
            }
            if self.congestion.bytes_in_flight() + wire_size > self.remote_window.max(wire_size) {
                break;
            }

            let payload = Bytes::copy_from_slice(&data[sent..sent + chunk_len]);
            let seq = self.seq_nr;
            self.seq_nr = self.seq_nr.wrapping_add(1);

            let pkt = Packet::data(self.send_id, seq, self.ack_nr, payload.clone());
            self.transmit(pkt, payload, probe);
            if probe {
                self.mtu.on_probe_sent(seq, now);
            }
            sent += chunk_len;
        }

        Ok(sent)
    }

    /// Copy buffered in-order bytes out to the reader
    pub(crate) fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.recv_buffer.len());
        for (i, byte) in self.recv_buffer.drain(..n).enumerate() {
            buf[i] = byte;
        }
        if n > 0 {
            // Freed receive window is worth advertising
            self.ack_pending = true;
        }
        n
    }

    pub(crate) fn bytes_readable(&self) -> usize {
        self.recv_buffer.len()
    }

    /// EOF: the peer's FIN and everything before it was delivered
    pub(crate) fn at_eof(&self) -> bool {
        match self.eof_seq {
            Some(eof) => self.recv_buffer.is_empty() && self.ack_nr == eof,
            None => false,
        }
    }

    /// Send our FIN
    pub(crate) fn close(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }

        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.fin_seq = Some(seq);
        self.state = ConnectionState::FinSent;
        self.close_cause.get_or_insert(CloseCause::Graceful);

        let pkt = Packet::fin(self.send_id, seq, self.ack_nr);
        self.transmit(pkt, Bytes::new(), false);
        self.notify();
    }

    /// Drive timers: retransmission, delayed acks, linger, collection
    pub(crate) fn tick(&mut self, now: Instant) {
        self.congestion.refill_quota(now);

        match self.state {
            ConnectionState::Reset => {
                self.state = ConnectionState::Deleted;
                return;
            }
            ConnectionState::CloseWait => {
                if self.ack_pending {
                    self.send_ack();
                }
                if self.close_wait_deadline.is_some_and(|d| now >= d) {
                    self.state = ConnectionState::Deleted;
                }
                return;
            }
            ConnectionState::Idle | ConnectionState::Deleted => return,
            _ => {}
        }

        self.check_retransmit(now);

        if self.ack_pending {
            self.send_ack();
        }
    }

    fn check_retransmit(&mut self, now: Instant) {
        // Oldest outstanding packet in wrapping order (the farthest
        // behind the next sequence number)
        let oldest = self
            .send_window
            .keys()
            .copied()
            .max_by_key(|&seq| self.seq_nr.wrapping_sub(seq));
        let Some(seq) = oldest else { return };

        let out = &self.send_window[&seq];
        if now.duration_since(out.last_sent) < self.congestion.rto() {
            return;
        }

        if out.mtu_probe {
            // Probe loss is a search result, not congestion
            let size = out.size;
            self.send_window.remove(&seq);
            self.mtu.on_probe_lost(seq);
            self.congestion.on_abandoned(size);
            return;
        }

        if out.transmissions > self.settings.max_retransmits {
            tracing::debug!(
                remote = %self.remote,
                seq,
                "retransmission budget exhausted, resetting connection"
            );
            self.enter_reset(CloseCause::RetransmitExhausted);
            return;
        }

        self.stats.timeouts += 1;
        self.congestion.on_timeout();
        self.resend(seq);
    }

    /// Put one outstanding packet back on the wire
    fn resend(&mut self, seq: u16) -> bool {
        let Some(out) = self.send_window.get_mut(&seq) else {
            return false;
        };
        out.mark_retransmit();
        let payload = out.payload.clone();
        let probe = out.mtu_probe;
        self.stats.retransmits += 1;

        let packet_type = if self.syn_seq == Some(seq) {
            PacketType::Syn
        } else if self.fin_seq == Some(seq) {
            PacketType::Fin
        } else {
            PacketType::Data
        };

        let mut pkt = Packet::new(packet_type, self.send_id, seq, self.ack_nr);
        pkt.payload = payload;
        self.send_raw(pkt, probe);
        true
    }

    /// Flush the pending ack, attaching a selective ack when the
    /// reassembly buffer shows holes
    fn send_ack(&mut self) {
        let mut pkt = Packet::state(self.send_id, self.seq_nr, self.ack_nr);

        if self.settings.enable_sack && !self.reassembly.is_empty() {
            let mut sack = SelectiveAck::default();
            for &seq in self.reassembly.keys() {
                let offset = seq.wrapping_sub(self.ack_nr).wrapping_sub(2);
                if offset < 8 * 64 {
                    sack.set_acked(offset);
                }
            }
            pkt = pkt.with_selective_ack(sack);
        }

        self.send_raw(pkt, false);
        self.last_ack_sent = self.ack_nr;
        self.ack_pending = false;
    }

    /// First transmission of a sequence-consuming packet: track it in
    /// the send window and charge the congestion controller
    fn transmit(&mut self, pkt: Packet, payload: Bytes, probe: bool) {
        let seq = pkt.seq_nr;
        let size = pkt.wire_size() as u32;
        self.send_window
            .insert(seq, OutstandingPacket::new(seq, payload, size, probe));
        self.congestion.on_send(size);
        self.send_raw(pkt, probe);
    }

    /// Stamp timestamps and window, encode, and hand to the send task
    fn send_raw(&mut self, mut pkt: Packet, probe: bool) {
        pkt.timestamp_us = timestamp_us();
        pkt.timestamp_diff_us = self.reply_micro;
        pkt.wnd_size = self.recv_window_bytes();

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += pkt.payload.len() as u64;
        if pkt.ack_nr == self.ack_nr {
            self.last_ack_sent = self.ack_nr;
            self.ack_pending = false;
        }

        let datagram = OutgoingDatagram {
            data: pkt.encode(),
            remote: self.remote,
            dont_fragment: probe,
            probe_owner: probe.then(|| self.self_weak.clone()),
        };
        if self.outgoing_tx.send(datagram).is_err() {
            tracing::debug!(remote = %self.remote, "send task gone, dropping packet");
        }
    }

    fn recv_window_bytes(&self) -> u32 {
        let buffered: usize = self.recv_buffer.len()
            + self.reassembly.values().map(|p| p.len()).sum::<usize>();
        (self.settings.recv_window as usize).saturating_sub(buffered) as u32
    }

    /// The network stack refused a datagram of this size
    pub(crate) fn on_message_too_large(&mut self, udp_payload: usize) {
        self.mtu.on_message_too_large(udp_payload);

        // The refused probe never left the host; abandon it
        let oversized: Vec<u16> = self
            .send_window
            .iter()
            .filter(|(_, out)| out.mtu_probe && out.size as usize >= udp_payload)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in oversized {
            if let Some(out) = self.send_window.remove(&seq) {
                self.congestion.on_abandoned(out.size);
            }
        }
    }

    /// Local cancellation: tell the peer and abandon everything queued
    pub(crate) fn abort(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let pkt = Packet::reset(self.send_id, self.seq_nr, self.ack_nr);
        self.send_raw(pkt, false);
        self.close_cause.get_or_insert(CloseCause::Graceful);
        self.state = ConnectionState::Reset;
        self.send_window.clear();
        self.notify();
    }

    fn enter_reset(&mut self, cause: CloseCause) {
        self.close_cause = Some(cause);
        self.state = ConnectionState::Reset;
        self.send_window.clear();
        self.notify();
    }

    fn enter_close_wait(&mut self) {
        if self.state == ConnectionState::FinSent {
            self.state = ConnectionState::CloseWait;
            self.close_wait_deadline = Some(Instant::now() + CLOSE_WAIT_LINGER);
            self.notify();
        }
    }

    fn terminal_error(&self, action: &'static str) -> CoreError {
        match self.close_cause {
            Some(CloseCause::PeerReset) => {
                CoreError::network(NetworkErrorKind::ConnectionReset, "connection reset by peer")
            }
            Some(CloseCause::RetransmitExhausted) => {
                CoreError::network(NetworkErrorKind::Timeout, "retransmissions exhausted")
            }
            _ => CoreError::InvalidState {
                action,
                current_state: self.state.to_string(),
            },
        }
    }

    fn notify(&self) {
        self.progress.notify_waiters();
    }
}

/// Wrapping sequence-number comparison: is `a` at or before `b`?
fn seq_before_eq(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < 32768
}

/// Wrapping sequence-number comparison: is `a` strictly after `b`?
fn seq_after(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff > 0 && diff < 32768
}

/// Handle to one uTP connection.
///
/// Reads deliver the peer's bytes in order; writes are segmented and
/// paced by the congestion controller. [`shutdown`](Self::shutdown)
/// closes gracefully with a FIN; dropping the handle cancels the
/// connection with a RESET instead.
pub struct UtpSocket {
    inner: Arc<Mutex<UtpSocketInner>>,
    progress: Arc<Notify>,
}

impl std::fmt::Debug for UtpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpSocket").finish_non_exhaustive()
    }
}

impl UtpSocket {
    pub(crate) fn new_outgoing(
        remote: SocketAddr,
        send_id: u16,
        settings: UtpSettings,
        outgoing_tx: DatagramSender,
    ) -> Self {
        let progress = Arc::new(Notify::new());
        let recv_id = send_id.wrapping_add(1);
        let inner = Arc::new(Mutex::new(UtpSocketInner::new(
            remote,
            send_id,
            recv_id,
            settings,
            outgoing_tx,
            progress.clone(),
        )));
        inner.lock().self_weak = Arc::downgrade(&inner);
        Self { inner, progress }
    }

    pub(crate) fn new_incoming(
        remote: SocketAddr,
        syn: &Packet,
        settings: UtpSettings,
        outgoing_tx: DatagramSender,
    ) -> Self {
        let progress = Arc::new(Notify::new());
        let recv_id = syn.connection_id;
        let send_id = syn.connection_id.wrapping_add(1);
        let inner = Arc::new(Mutex::new(UtpSocketInner::new(
            remote,
            send_id,
            recv_id,
            settings,
            outgoing_tx,
            progress.clone(),
        )));
        {
            let mut locked = inner.lock();
            locked.self_weak = Arc::downgrade(&inner);
            locked.accept_syn(syn);
        }
        Self { inner, progress }
    }

    pub(crate) fn inner(&self) -> Arc<Mutex<UtpSocketInner>> {
        self.inner.clone()
    }

    /// Start the handshake and wait for the connection to establish
    pub async fn connect(&self) -> Result<()> {
        self.inner.lock().connect()?;

        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            // Register before checking, so a notification landing
            // between the check and the await is not lost
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                match inner.state() {
                    ConnectionState::Connected => return Ok(()),
                    state if state.is_terminal() => return Err(inner.terminal_error("connect")),
                    _ => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoreError::network(
                    NetworkErrorKind::Timeout,
                    "connect timed out",
                ));
            }
        }
    }

    /// Read into `buf`, waiting for at least one byte. Returns 0 at
    /// EOF (peer sent FIN and everything before it was delivered).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.bytes_readable() > 0 {
                    return Ok(inner.read_data(buf));
                }
                if inner.at_eof() {
                    return Ok(0);
                }
                if inner.state().is_terminal() {
                    return match inner.close_cause() {
                        Some(CloseCause::Graceful) | None => Ok(0),
                        _ => Err(inner.terminal_error("read")),
                    };
                }
            }

            notified.await;
        }
    }

    /// Read exactly `buf.len()` bytes
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..]).await?;
            if n == 0 {
                return Err(CoreError::network(
                    NetworkErrorKind::ConnectionReset,
                    "unexpected EOF",
                ));
            }
            total += n;
        }
        Ok(())
    }

    /// Write all of `data`, waiting on the congestion window as needed
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let sent = self.inner.lock().send_data(&data[offset..])?;
            offset += sent;
            if offset < data.len() && sent == 0 {
                // Window or quota exhausted; pacing refills on the tick
                let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
            }
        }
        Ok(())
    }

    /// Send a FIN and stop writing. Reads continue to drain.
    pub fn shutdown(&self) {
        self.inner.lock().close();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.lock().remote()
    }
}

impl Drop for UtpSocket {
    fn drop(&mut self) {
        // The manager owns the state machine; dropping the handle
        // cancels the connection rather than leaking it
        self.inner.lock().abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_socket() -> (UtpSocket, UnboundedReceiver<OutgoingDatagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = UtpSocket::new_outgoing(
            "127.0.0.1:6881".parse().unwrap(),
            100,
            UtpSettings::default(),
            tx,
        );
        (socket, rx)
    }

    fn decode_next(rx: &mut UnboundedReceiver<OutgoingDatagram>) -> Packet {
        let datagram = rx.try_recv().expect("expected an outgoing datagram");
        Packet::decode(&datagram.data).unwrap()
    }

    /// Drive an outgoing socket through the handshake: SYN out, acking
    /// STATE in. The peer's initial seq is 1000, window 1 MiB.
    fn connected_socket() -> (UtpSocket, UnboundedReceiver<OutgoingDatagram>) {
        let (socket, mut rx) = test_socket();
        socket.inner().lock().connect().unwrap();

        let syn = decode_next(&mut rx);
        assert!(syn.is_syn());
        assert_eq!(syn.connection_id, 100);
        assert_eq!(syn.seq_nr, 1);

        let reply = Packet::state(101, 1000, 1).with_window(1024 * 1024);
        socket.inner().lock().handle_packet(&reply);
        assert_eq!(socket.state(), ConnectionState::Connected);
        (socket, rx)
    }

    #[test]
    fn test_seq_comparison_wraps() {
        assert!(seq_before_eq(10, 20));
        assert!(seq_before_eq(10, 10));
        assert!(!seq_before_eq(20, 10));
        assert!(seq_before_eq(65530, 5));
        assert!(!seq_before_eq(5, 65530));

        assert!(seq_after(20, 10));
        assert!(!seq_after(10, 10));
        assert!(seq_after(5, 65530));
    }

    #[test]
    fn test_handshake_outgoing() {
        let (socket, _rx) = connected_socket();
        let inner = socket.inner();
        let inner = inner.lock();
        // Peer's first data packet will be seq 1001
        assert_eq!(inner.ack_nr, 999);
        assert!(inner.send_window.is_empty());
    }

    #[test]
    fn test_handshake_incoming() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let syn = Packet::syn(7, 1).with_window(65536);
        let socket = UtpSocket::new_incoming(
            "127.0.0.1:6881".parse().unwrap(),
            &syn,
            UtpSettings::default(),
            tx,
        );

        assert_eq!(socket.state(), ConnectionState::Connected);
        {
            let inner = socket.inner();
            let inner = inner.lock();
            assert_eq!(inner.recv_id(), 7);
            assert_eq!(inner.send_id, 8);
            assert_eq!(inner.remote_window, 65536);
        }

        let state = decode_next(&mut rx);
        assert!(state.is_state());
        assert_eq!(state.connection_id, 8);
        assert_eq!(state.ack_nr, 1);
    }

    #[test]
    fn test_in_order_delivery() {
        let (socket, mut rx) = connected_socket();
        let inner = socket.inner();

        inner
            .lock()
            .handle_packet(&Packet::data(101, 1000, 1, Bytes::from_static(b"hello ")));
        inner
            .lock()
            .handle_packet(&Packet::data(101, 1001, 1, Bytes::from_static(b"world")));

        let mut buf = [0u8; 64];
        let n = inner.lock().read_data(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(inner.lock().ack_nr, 1001);
        drop(rx.try_recv());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let (socket, _rx) = connected_socket();
        let inner = socket.inner();

        // seq 1001 arrives before seq 1000
        inner
            .lock()
            .handle_packet(&Packet::data(101, 1001, 1, Bytes::from_static(b"world")));
        assert_eq!(inner.lock().bytes_readable(), 0);

        inner
            .lock()
            .handle_packet(&Packet::data(101, 1000, 1, Bytes::from_static(b"hello ")));
        let mut buf = [0u8; 64];
        let n = inner.lock().read_data(&mut buf);
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn test_sack_attached_for_holes() {
        let (socket, mut rx) = connected_socket();
        let inner = socket.inner();

        inner
            .lock()
            .handle_packet(&Packet::data(101, 1002, 1, Bytes::from_static(b"late")));
        inner.lock().tick(Instant::now());

        let ack = decode_next(&mut rx);
        assert!(ack.is_state());
        assert_eq!(ack.ack_nr, 999);
        let sack = ack.selective_ack.expect("sack expected");
        // 1002 = ack_nr(999) + 2 + 1
        assert!(sack.is_acked(1));
        assert!(!sack.is_acked(0));
    }

    #[test]
    fn test_duplicate_ack_fast_retransmit() {
        let (socket, mut rx) = connected_socket();
        let inner = socket.inner();

        // Six outstanding data packets, seq 2..=7
        let sent = inner.lock().send_data(&[0xAB; 60]).unwrap();
        assert_eq!(sent, 60);
        {
            let mut locked = inner.lock();
            // Re-segment into 10-byte packets for the test
            locked.send_window.clear();
            let in_flight = locked.congestion.bytes_in_flight();
            locked.congestion.on_abandoned(in_flight);
            for seq in 2u16..=7 {
                let payload = Bytes::from_static(&[0xAB; 10]);
                locked.send_window.insert(
                    seq,
                    OutstandingPacket::new(seq, payload, (HEADER_SIZE + 10) as u32, false),
                );
                locked.congestion.on_send((HEADER_SIZE + 10) as u32);
            }
            locked.seq_nr = 8;
        }
        while rx.try_recv().is_ok() {}

        let rto_before = inner.lock().congestion.rto();

        // Three duplicate acks of seq 1, each selectively acking 3..=7
        // (seq 2 missing)
        let mut sack = SelectiveAck::default();
        for seq in 3u16..=7 {
            sack.set_acked(seq.wrapping_sub(1).wrapping_sub(2));
        }
        let dup = Packet::state(101, 1000, 1)
            .with_window(1024 * 1024)
            .with_selective_ack(sack);

        inner.lock().handle_packet(&dup);
        inner.lock().handle_packet(&dup);
        assert!(rx.try_recv().is_err());
        let window_before_third = inner.lock().congestion.window();

        inner.lock().handle_packet(&dup);

        // Exactly one retransmission, of seq 2 alone
        let retx = decode_next(&mut rx);
        assert!(retx.is_data());
        assert_eq!(retx.seq_nr, 2);
        assert!(rx.try_recv().is_err());

        let locked = inner.lock();
        assert_eq!(locked.stats.fast_retransmits, 1);
        assert_eq!(locked.stats.duplicate_acks, 3);
        // Window halved, RTO untouched
        assert_eq!(
            locked.congestion.window(),
            (window_before_third / 2).max(crate::utp::congestion::MIN_WINDOW)
        );
        assert_eq!(locked.congestion.rto(), rto_before);
        // 3..=7 left the window via the selective acks
        assert_eq!(locked.send_window.len(), 1);
        assert!(locked.send_window.contains_key(&2));
    }

    #[test]
    fn test_retransmit_exhaustion_resets() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = UtpSettings {
            max_retransmits: 2,
            ..Default::default()
        };
        let socket = UtpSocket::new_outgoing(
            "127.0.0.1:6881".parse().unwrap(),
            100,
            settings,
            tx,
        );
        let inner = socket.inner();
        inner.lock().connect().unwrap();
        let _syn = decode_next(&mut rx);

        // Let the retransmission timer expire repeatedly
        let mut now = Instant::now();
        for _ in 0..8 {
            now += inner.lock().congestion.rto() + Duration::from_millis(1);
            inner.lock().tick(now);
            if inner.lock().state() == ConnectionState::Reset {
                break;
            }
        }

        assert_eq!(inner.lock().state(), ConnectionState::Reset);
        assert_eq!(
            inner.lock().close_cause(),
            Some(CloseCause::RetransmitExhausted)
        );

        // The next tick hands the socket to the garbage collector
        inner.lock().tick(now);
        assert_eq!(inner.lock().state(), ConnectionState::Deleted);
    }

    #[test]
    fn test_peer_reset_surfaces_cause() {
        let (socket, _rx) = connected_socket();
        let inner = socket.inner();

        inner.lock().handle_packet(&Packet::reset(101, 0, 0));
        assert_eq!(socket.state(), ConnectionState::Reset);
        assert_eq!(inner.lock().close_cause(), Some(CloseCause::PeerReset));
        assert!(inner.lock().send_data(b"x").is_err());
    }

    #[test]
    fn test_fin_handshake_to_close_wait() {
        let (socket, mut rx) = connected_socket();
        let inner = socket.inner();

        inner.lock().close();
        assert_eq!(socket.state(), ConnectionState::FinSent);

        let fin = decode_next(&mut rx);
        assert!(fin.is_fin());
        assert_eq!(fin.seq_nr, 2);

        // Peer acks the FIN
        let ack = Packet::state(101, 1000, 2).with_window(1024 * 1024);
        inner.lock().handle_packet(&ack);
        assert_eq!(socket.state(), ConnectionState::CloseWait);

        // Linger expires
        inner.lock().tick(Instant::now() + CLOSE_WAIT_LINGER + Duration::from_millis(1));
        assert_eq!(socket.state(), ConnectionState::Deleted);
    }

    #[test]
    fn test_eof_after_peer_fin() {
        let (socket, _rx) = connected_socket();
        let inner = socket.inner();

        inner
            .lock()
            .handle_packet(&Packet::data(101, 1000, 1, Bytes::from_static(b"tail")));
        inner
            .lock()
            .handle_packet(&Packet::fin(101, 1001, 1));

        assert!(!inner.lock().at_eof());
        let mut buf = [0u8; 8];
        let n = inner.lock().read_data(&mut buf);
        assert_eq!(&buf[..n], b"tail");
        assert!(inner.lock().at_eof());
    }

    #[test]
    fn test_impossible_ack_ignored() {
        let (socket, _rx) = connected_socket();
        let inner = socket.inner();
        inner.lock().send_data(b"payload").unwrap();
        assert_eq!(inner.lock().send_window.len(), 1);

        // Ack of seq 500: we've only sent up to 2
        let bogus = Packet::state(101, 1000, 500).with_window(1024 * 1024);
        inner.lock().handle_packet(&bogus);
        assert_eq!(inner.lock().send_window.len(), 1);
        assert_eq!(socket.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_send_respects_remote_window() {
        let (socket, mut rx) = connected_socket();
        let inner = socket.inner();

        // One in-flight packet always rides a zero window so the
        // connection cannot deadlock waiting for window updates
        inner.lock().remote_window = 0;
        let sent = inner.lock().send_data(&[0u8; 100]).unwrap();
        assert_eq!(sent, 100);
        assert!(rx.try_recv().is_ok());

        let sent = inner.lock().send_data(&[0u8; 100]).unwrap();
        assert_eq!(sent, 0);
        assert!(rx.try_recv().is_err());
    }
}
