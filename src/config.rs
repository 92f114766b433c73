//! Core configuration
//!
//! Configuration for the two subsystems: the uTP transport and the disk
//! buffer cache. All structs are serde round-trippable so an embedding
//! engine can persist them alongside its own settings.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Block size of the disk cache (16 KiB, the BitTorrent block convention)
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Top-level configuration for gosh-core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// uTP transport configuration
    #[serde(default)]
    pub utp: UtpSettings,

    /// Disk buffer cache configuration
    #[serde(default)]
    pub disk: DiskCacheConfig,
}

/// uTP (Micro Transport Protocol) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtpSettings {
    /// Accept inbound uTP connections
    #[serde(default = "default_true")]
    pub enable_incoming: bool,

    /// LEDBAT target one-way queuing delay in microseconds
    #[serde(default = "default_target_delay")]
    pub target_delay_us: u32,

    /// LEDBAT window gain
    #[serde(default = "default_gain")]
    pub gain: f64,

    /// Maximum congestion window size in bytes
    #[serde(default = "default_max_window")]
    pub max_window: u32,

    /// Initial receive window advertised to peers, in bytes
    #[serde(default = "default_recv_window")]
    pub recv_window: u32,

    /// Enable the selective-ack extension
    #[serde(default = "default_true")]
    pub enable_sack: bool,

    /// Lower bound for path-MTU discovery
    #[serde(default = "default_mtu_floor")]
    pub mtu_floor: u16,

    /// Upper bound for path-MTU discovery
    #[serde(default = "default_mtu_ceiling")]
    pub mtu_ceiling: u16,

    /// Give up a connection after this many retransmissions of one packet
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    /// Manager tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Send RESET for datagrams that match no connection
    #[serde(default = "default_true")]
    pub reset_unknown_connections: bool,

    /// Sustained rate limit for those RESETs, per second
    #[serde(default = "default_reset_rate")]
    pub reset_rate_per_sec: u32,
}

/// Disk buffer cache configuration
///
/// `cache_size` is the high watermark; the low watermark is derived from
/// `max_queued_disk_bytes` and clamped into `[0, cache_size]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    /// Maximum number of outstanding blocks (high watermark)
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Gap between the high and low watermarks, in bytes
    #[serde(default = "default_max_queued_disk_bytes")]
    pub max_queued_disk_bytes: usize,

    /// Slab-pool growth hint in blocks; 0 = automatic
    #[serde(default)]
    pub cache_buffer_chunk_size: usize,

    /// Pin allocated blocks in RAM (mlock)
    #[serde(default)]
    pub lock_disk_cache: bool,

    /// Use the recycling slab pool instead of per-block heap allocations
    #[serde(default)]
    pub use_disk_cache_pool: bool,

    /// Non-empty path selects a memory-mapped cache file at that path
    #[serde(default)]
    pub mmap_cache: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_target_delay() -> u32 {
    100_000 // 100ms
}

fn default_gain() -> f64 {
    1.0
}

fn default_max_window() -> u32 {
    1024 * 1024 // 1MB
}

fn default_recv_window() -> u32 {
    1024 * 1024 // 1MB
}

fn default_mtu_floor() -> u16 {
    576
}

fn default_mtu_ceiling() -> u16 {
    1500
}

fn default_max_retransmits() -> u32 {
    10
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_reset_rate() -> u32 {
    10
}

fn default_cache_size() -> usize {
    256
}

fn default_max_queued_disk_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

impl Default for UtpSettings {
    fn default() -> Self {
        Self {
            enable_incoming: true,
            target_delay_us: 100_000,
            gain: 1.0,
            max_window: 1024 * 1024,
            recv_window: 1024 * 1024,
            enable_sack: true,
            mtu_floor: 576,
            mtu_ceiling: 1500,
            max_retransmits: 10,
            tick_interval_ms: 50,
            reset_unknown_connections: true,
            reset_rate_per_sec: 10,
        }
    }
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            max_queued_disk_bytes: 1024 * 1024,
            cache_buffer_chunk_size: 0,
            lock_disk_cache: false,
            use_disk_cache_pool: false,
            mmap_cache: None,
        }
    }
}

impl DiskCacheConfig {
    /// The low watermark derived from this configuration.
    ///
    /// The gap below the ceiling is `max_queued_disk_bytes` expressed in
    /// blocks, at least 16; the result is clamped into `[0, cache_size]`
    /// so a small cache keeps its hysteresis band instead of underflowing.
    pub fn low_watermark(&self) -> usize {
        let gap = (self.max_queued_disk_bytes / BLOCK_SIZE).max(16);
        self.cache_size.saturating_sub(gap).min(self.cache_size)
    }
}

impl CoreConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the disk cache capacity in blocks
    pub fn cache_size(mut self, blocks: usize) -> Self {
        self.disk.cache_size = blocks;
        self
    }

    /// Set the maximum congestion window
    pub fn max_window(mut self, bytes: u32) -> Self {
        self.utp.max_window = bytes;
        self
    }

    /// Enable or disable inbound uTP connections
    pub fn enable_incoming(mut self, enabled: bool) -> Self {
        self.utp.enable_incoming = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.utp.mtu_floor < 150 {
            return Err(CoreError::invalid_input(
                "mtu_floor",
                "Must be at least 150 bytes",
            ));
        }

        if self.utp.mtu_floor > self.utp.mtu_ceiling {
            return Err(CoreError::invalid_input(
                "mtu_floor",
                "Must not exceed mtu_ceiling",
            ));
        }

        if self.utp.max_window == 0 {
            return Err(CoreError::invalid_input("max_window", "Must be non-zero"));
        }

        if !(0.0..=4.0).contains(&self.utp.gain) {
            return Err(CoreError::invalid_input(
                "gain",
                "Must be within [0.0, 4.0]",
            ));
        }

        if self.disk.cache_size == 0 {
            return Err(CoreError::invalid_input(
                "cache_size",
                "Must be at least 1 block",
            ));
        }

        Ok(())
    }
}
