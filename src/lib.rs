//! # gosh-core
//!
//! Transport and disk-cache core for the gosh download engine:
//!
//! - **uTP transport**: a reliable, LEDBAT-congestion-controlled
//!   stream protocol multiplexing many connections over one UDP
//!   socket, with selective acks, path-MTU discovery and RESET
//!   handling
//! - **Disk buffer pool**: a bounded allocator of 16 KiB disk blocks
//!   with watermark back-pressure, queued asynchronous allocation and
//!   pluggable backing (heap, slab pool, mmap cache file)
//! - **Lazy bencode decoder**: a zero-copy parser for torrent metadata
//!   and peer messages, borrowing slices straight out of the input
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gosh_core::{CoreConfig, UtpMux};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::default();
//!     config.validate()?;
//!
//!     let mux = UtpMux::bind_with_settings("0.0.0.0:6881".parse()?, config.utp).await?;
//!     let socket = mux.connect("192.0.2.7:6881".parse()?).await?;
//!     socket.write_all(b"\x13BitTorrent protocol").await?;
//!     Ok(())
//! }
//! ```

// Modules
pub mod bencode;
pub mod config;
pub mod disk;
pub mod error;
pub mod utp;

// Re-exports for convenience
pub use config::{CoreConfig, DiskCacheConfig, UtpSettings, BLOCK_SIZE};
pub use error::{CoreError, DiskErrorKind, NetworkErrorKind, ProtocolErrorKind, Result};

// Bencode exports
pub use bencode::{decode, decode_strict, LazyEntry};

// Disk pool exports
pub use disk::{spawn_wake_dispatcher, Block, BufferPool, DiskObserver, WakeBatch};

// uTP exports
pub use utp::{CloseCause, ConnectionState, ConnectionStats, UtpMux, UtpSocket, UtpStatus};
