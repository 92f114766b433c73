//! uTP socket multiplexer
//!
//! One UDP socket shared by every uTP connection. Inbound datagrams
//! are demultiplexed by `(connection id, remote endpoint)` — the id
//! space is only 16 bits, so distinct peers may collide on an id — and
//! handed to the owning connection's state machine. A one-entry cache
//! remembers the last matched connection, which catches the common
//! case of a burst from a single peer.
//!
//! Unmatched SYNs become new connections handed to `accept`; any other
//! unmatched datagram draws a RESET, rate-limited so the manager can't
//! be used as a reflection amplifier.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::config::UtpSettings;
use crate::error::{CoreError, Result};

use super::packet::{Packet, HEADER_SIZE};
use super::socket::{DatagramSender, OutgoingDatagram, UtpSocket, UtpSocketInner};
use super::state::ConnectionState;

type SharedConn = Arc<Mutex<UtpSocketInner>>;

/// Connection counts by state, from a walk over the socket directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UtpStatus {
    pub num_idle: usize,
    pub num_syn_sent: usize,
    pub num_connected: usize,
    pub num_fin_sent: usize,
    pub num_close_wait: usize,
}

/// Token bucket limiting RESETs sent to unknown senders
struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            burst,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Socket directory: connections keyed by the id they receive on, with
/// the remote endpoint disambiguating id collisions
#[derive(Default)]
struct Directory {
    sockets: HashMap<u16, Vec<(SocketAddr, SharedConn)>>,
}

impl Directory {
    fn find(&self, recv_id: u16, remote: SocketAddr) -> Option<SharedConn> {
        self.sockets
            .get(&recv_id)?
            .iter()
            .find(|(addr, _)| *addr == remote)
            .map(|(_, conn)| conn.clone())
    }

    fn insert(&mut self, recv_id: u16, remote: SocketAddr, conn: SharedConn) {
        self.sockets.entry(recv_id).or_default().push((remote, conn));
    }

    fn contains(&self, recv_id: u16, remote: SocketAddr) -> bool {
        self.find(recv_id, remote).is_some()
    }

    fn remove(&mut self, recv_id: u16, remote: SocketAddr) {
        if let Some(list) = self.sockets.get_mut(&recv_id) {
            list.retain(|(addr, _)| *addr != remote);
            if list.is_empty() {
                self.sockets.remove(&recv_id);
            }
        }
    }

    fn len(&self) -> usize {
        self.sockets.values().map(|l| l.len()).sum()
    }
}

/// Shared state reachable from the background tasks
struct MuxInner {
    directory: RwLock<Directory>,
    /// `(recv_id, remote)` of the most recently matched connection
    last_socket: Mutex<Option<(u16, SocketAddr, SharedConn)>>,
    outgoing_tx: DatagramSender,
    accept_tx: mpsc::UnboundedSender<UtpSocket>,
    reset_limiter: Mutex<TokenBucket>,
    settings: UtpSettings,
}

/// uTP socket manager over one bound UDP socket
pub struct UtpMux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    inner: Arc<MuxInner>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<UtpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UtpMux {
    /// Bind to `addr` with default settings
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_settings(addr, UtpSettings::default()).await
    }

    /// Bind to `addr` and start the receive, send and tick tasks
    pub async fn bind_with_settings(addr: SocketAddr, settings: UtpSettings) -> Result<Self> {
        let socket = Arc::new(bind_udp(addr)?);
        let local_addr = socket.local_addr()?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(MuxInner {
            directory: RwLock::new(Directory::default()),
            last_socket: Mutex::new(None),
            outgoing_tx,
            accept_tx,
            reset_limiter: Mutex::new(TokenBucket::new(
                settings.reset_rate_per_sec as f64,
                2.0 * settings.reset_rate_per_sec as f64,
            )),
            settings,
        });

        let mut mux = Self {
            socket,
            local_addr,
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            tasks: Vec::new(),
        };
        mux.start_tasks(outgoing_rx);
        Ok(mux)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn start_tasks(&mut self, mut outgoing_rx: mpsc::UnboundedReceiver<OutgoingDatagram>) {
        // Receive task: decode and demultiplex inbound datagrams
        let socket = self.socket.clone();
        let inner = self.inner.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, remote)) => {
                        inner.handle_datagram(&buf[..len], remote);
                    }
                    Err(e) => {
                        tracing::error!("UDP receive error: {}", e);
                        break;
                    }
                }
            }
        }));

        // Send task: drain the shared outgoing queue
        let socket = self.socket.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(datagram) = outgoing_rx.recv().await {
                send_datagram(&socket, datagram).await;
            }
        }));

        // Tick task: timers, delayed acks, garbage collection
        let inner = self.inner.clone();
        let tick_interval = Duration::from_millis(self.inner.settings.tick_interval_ms.max(10));
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                inner.tick(Instant::now());
            }
        }));
    }

    /// Open a connection to `remote` and complete the handshake
    pub async fn connect(&self, remote: SocketAddr) -> Result<UtpSocket> {
        let send_id = {
            let directory = self.inner.directory.read();
            let mut send_id = rand::random::<u16>();
            // The id we receive on must be free for this remote
            let mut attempts = 0;
            while directory.contains(send_id.wrapping_add(1), remote) {
                send_id = send_id.wrapping_add(2);
                attempts += 1;
                if attempts > u16::MAX as usize / 2 {
                    return Err(CoreError::Internal(
                        "connection id space exhausted".into(),
                    ));
                }
            }
            send_id
        };

        let socket = UtpSocket::new_outgoing(
            remote,
            send_id,
            self.inner.settings.clone(),
            self.inner.outgoing_tx.clone(),
        );
        let recv_id = send_id.wrapping_add(1);
        self.inner
            .directory
            .write()
            .insert(recv_id, remote, socket.inner());

        match socket.connect().await {
            Ok(()) => Ok(socket),
            Err(e) => {
                self.inner.directory.write().remove(recv_id, remote);
                Err(e)
            }
        }
    }

    /// Wait for the next inbound connection. Its SYN is already
    /// absorbed and acked; the socket is connected.
    pub async fn accept(&self) -> Result<UtpSocket> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(CoreError::Shutdown)
    }

    /// Connection counts derived from the socket directory
    pub fn status(&self) -> UtpStatus {
        let mut status = UtpStatus::default();
        let directory = self.inner.directory.read();
        for list in directory.sockets.values() {
            for (_, conn) in list {
                match conn.lock().state() {
                    ConnectionState::Idle => status.num_idle += 1,
                    ConnectionState::SynSent => status.num_syn_sent += 1,
                    ConnectionState::Connected => status.num_connected += 1,
                    ConnectionState::FinSent => status.num_fin_sent += 1,
                    ConnectionState::Reset | ConnectionState::CloseWait => {
                        status.num_close_wait += 1
                    }
                    ConnectionState::Deleted => {}
                }
            }
        }
        status
    }

    /// Number of live connections in the directory
    pub fn socket_count(&self) -> usize {
        self.inner.directory.read().len()
    }

    /// Stop the background tasks and drop all connections
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.inner.directory.write().sockets.clear();
        *self.inner.last_socket.lock() = None;
    }
}

impl Drop for UtpMux {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl MuxInner {
    /// Demultiplex one inbound datagram
    fn handle_datagram(&self, data: &[u8], remote: SocketAddr) {
        if data.len() < HEADER_SIZE {
            tracing::debug!(%remote, len = data.len(), "runt datagram dropped");
            return;
        }

        let pkt = match Packet::decode(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::debug!(%remote, "undecodable datagram dropped: {}", e);
                return;
            }
        };

        let conn_id = pkt.connection_id;

        // Fast path: same connection as the previous datagram
        {
            let last = self.last_socket.lock();
            if let Some((id, addr, conn)) = last.as_ref() {
                if *id == conn_id && *addr == remote {
                    conn.lock().handle_packet(&pkt);
                    return;
                }
            }
        }

        if let Some(conn) = self.directory.read().find(conn_id, remote) {
            conn.lock().handle_packet(&pkt);
            *self.last_socket.lock() = Some((conn_id, remote, conn));
            return;
        }

        // A RESET answering our SYN echoes the id the SYN carried,
        // which is one below the id we receive on
        if pkt.is_reset() {
            if let Some(conn) = self.directory.read().find(conn_id.wrapping_add(1), remote) {
                conn.lock().handle_packet(&pkt);
            }
            return;
        }

        if pkt.is_syn() && self.settings.enable_incoming {
            self.accept_incoming(&pkt, remote);
            return;
        }

        // Unknown connection: answer with a RESET, within budget, so
        // the peer gives up instead of retransmitting at us
        if self.settings.reset_unknown_connections
            && self.reset_limiter.lock().try_take(Instant::now())
        {
            tracing::debug!(%remote, conn_id, "resetting unknown connection");
            let reset = Packet::reset(conn_id, 0, pkt.seq_nr);
            let _ = self.outgoing_tx.send(OutgoingDatagram {
                data: reset.encode(),
                remote,
                dont_fragment: false,
                probe_owner: None,
            });
        }
    }

    /// A SYN with no owner: make a connection for it and queue it for
    /// `accept`
    fn accept_incoming(&self, syn: &Packet, remote: SocketAddr) {
        let socket = UtpSocket::new_incoming(
            remote,
            syn,
            self.settings.clone(),
            self.outgoing_tx.clone(),
        );
        self.directory
            .write()
            .insert(syn.connection_id, remote, socket.inner());

        tracing::debug!(%remote, conn_id = syn.connection_id, "inbound uTP connection");
        if self.accept_tx.send(socket).is_err() {
            // Nobody accepting; the directory entry dies on reset/GC
            tracing::debug!("accept queue closed, dropping inbound connection");
            self.directory.write().remove(syn.connection_id, remote);
        }
    }

    /// Periodic driver: per-connection timers and directory GC
    fn tick(&self, now: Instant) {
        let connections: Vec<(u16, SocketAddr, SharedConn)> = {
            let directory = self.directory.read();
            directory
                .sockets
                .iter()
                .flat_map(|(&id, list)| {
                    list.iter().map(move |(addr, conn)| (id, *addr, conn.clone()))
                })
                .collect()
        };

        let mut dead: Vec<(u16, SocketAddr, SharedConn)> = Vec::new();
        for (id, addr, conn) in connections {
            let mut locked = conn.lock();
            locked.tick(now);
            if locked.state() == ConnectionState::Deleted {
                drop(locked);
                dead.push((id, addr, conn));
            }
        }

        if !dead.is_empty() {
            let mut directory = self.directory.write();
            let mut last = self.last_socket.lock();
            for (id, addr, conn) in dead {
                directory.remove(id, addr);
                if let Some((_, _, cached)) = last.as_ref() {
                    if Arc::ptr_eq(cached, &conn) {
                        *last = None;
                    }
                }
            }
        }
    }
}

/// Bind the shared UDP socket with moderate buffers sized for a busy
/// swarm of connections
fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let _ = socket.set_recv_buffer_size(1 << 20);
    let _ = socket.set_send_buffer_size(1 << 20);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Put one datagram on the wire, honoring the don't-fragment hint and
/// feeding refusals back to the probing connection
async fn send_datagram(socket: &UdpSocket, datagram: OutgoingDatagram) {
    if datagram.dont_fragment {
        set_dont_fragment(socket, true);
    }
    let result = socket.send_to(&datagram.data, datagram.remote).await;
    if datagram.dont_fragment {
        set_dont_fragment(socket, false);
    }

    if let Err(e) = result {
        let too_large = e.raw_os_error() == Some(message_too_large_errno());
        if too_large {
            if let Some(owner) = datagram.probe_owner.and_then(|w| w.upgrade()) {
                owner.lock().on_message_too_large(datagram.data.len());
                return;
            }
        }
        // Dropped datagrams are recovered by retransmission
        tracing::warn!(remote = %datagram.remote, "UDP send failed: {}", e);
    }
}

#[cfg(unix)]
fn message_too_large_errno() -> i32 {
    libc::EMSGSIZE
}

#[cfg(not(unix))]
fn message_too_large_errno() -> i32 {
    10040 // WSAEMSGSIZE
}

/// Toggle the IP don't-fragment bit for path-MTU probes
#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &UdpSocket, enable: bool) {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = if enable {
        libc::IP_PMTUDISC_DO
    } else {
        libc::IP_PMTUDISC_WANT
    };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::debug!(
            "IP_MTU_DISCOVER toggle failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &UdpSocket, _enable: bool) {
    // No portable DF control; probes rely on timeout-based detection
}
