//! uTP (Micro Transport Protocol) implementation (BEP 29)
//!
//! A reliable, ordered, delay-based-congestion-controlled transport
//! multiplexed over a single UDP socket:
//!
//! - `packet`: wire format (20-byte header, extensions, selective ack)
//! - `congestion`: LEDBAT window control, RTT estimation, send pacing
//! - `state`: connection states and send-window bookkeeping
//! - `mtu`: path-MTU discovery by bisection probing
//! - `socket`: the per-connection state machine and byte-stream handle
//! - `multiplexer`: datagram dispatch, accept queue, tick driver
//!
//! # Usage
//!
//! ```ignore
//! use gosh_core::utp::UtpMux;
//!
//! let mux = UtpMux::bind("0.0.0.0:6881".parse()?).await?;
//! let socket = mux.connect("192.0.2.7:6881".parse()?).await?;
//! socket.write_all(b"hello").await?;
//! let mut buf = [0u8; 1024];
//! let n = socket.read(&mut buf).await?;
//! ```

pub mod congestion;
pub mod mtu;
pub mod multiplexer;
pub mod packet;
pub mod socket;
pub mod state;

pub use congestion::LedbatController;
pub use mtu::MtuDiscovery;
pub use multiplexer::{UtpMux, UtpStatus};
pub use packet::{Packet, PacketType, SelectiveAck, HEADER_SIZE};
pub use socket::UtpSocket;
pub use state::{CloseCause, ConnectionState, ConnectionStats};
