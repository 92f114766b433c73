//! Path-MTU discovery
//!
//! Bisection search between a floor the path is known to carry and a
//! ceiling it is known (or suspected) not to. Probes are ordinary data
//! packets sized to the midpoint and sent with the don't-fragment hint;
//! an acked probe raises the floor, a lost probe or an EMSGSIZE from
//! the socket lowers the ceiling. Once the bounds converge the search
//! goes quiet, re-expanding periodically to notice path changes.

use std::time::{Duration, Instant};

/// IPv4 + UDP header overhead subtracted from link MTUs
pub const UDP_OVERHEAD: usize = 28;

/// Stop bisecting when the bounds are this close
const CONVERGENCE_MARGIN: u16 = 16;

/// Delay between probes while searching
const PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Delay before re-expanding the bounds to re-check the path
const REPROBE_INTERVAL: Duration = Duration::from_secs(600);

/// Per-connection path-MTU prober
#[derive(Debug)]
pub struct MtuDiscovery {
    /// Largest link MTU known to work
    floor: u16,

    /// Smallest link MTU known (or suspected) not to work, plus one
    ceiling: u16,

    /// Configured search bounds, restored on re-probe
    configured_floor: u16,
    configured_ceiling: u16,

    /// Sequence number of the outstanding probe, if any
    probe_seq: Option<u16>,

    /// Size of the outstanding probe (link MTU bytes)
    probe_size: u16,

    /// When the last probe was sent or the search last converged
    last_activity: Instant,
}

impl MtuDiscovery {
    pub fn new(floor: u16, ceiling: u16) -> Self {
        Self {
            floor,
            ceiling,
            configured_floor: floor,
            configured_ceiling: ceiling,
            probe_seq: None,
            probe_size: 0,
            last_activity: Instant::now(),
        }
    }

    /// The UDP payload budget packets must fit in right now
    pub fn mss(&self) -> usize {
        self.floor as usize - UDP_OVERHEAD
    }

    /// Last good link MTU
    pub fn current_mtu(&self) -> u16 {
        self.floor
    }

    fn converged(&self) -> bool {
        self.ceiling - self.floor <= CONVERGENCE_MARGIN
    }

    /// UDP payload size the next probe should have, if one is due.
    /// At most one probe is outstanding at a time.
    pub fn probe_payload_size(&mut self, now: Instant) -> Option<usize> {
        if self.probe_seq.is_some() {
            return None;
        }

        if self.converged() {
            if now.duration_since(self.last_activity) < REPROBE_INTERVAL {
                return None;
            }
            // Path may have changed; restart the search
            self.floor = self.configured_floor;
            self.ceiling = self.configured_ceiling;
            if self.converged() {
                self.last_activity = now;
                return None;
            }
        } else if now.duration_since(self.last_activity) < PROBE_INTERVAL {
            return None;
        }

        let midpoint = self.floor + (self.ceiling - self.floor) / 2;
        self.probe_size = midpoint;
        Some(midpoint as usize - UDP_OVERHEAD)
    }

    /// A probe of the size last returned left with this sequence number
    pub fn on_probe_sent(&mut self, seq_nr: u16, now: Instant) {
        self.probe_seq = Some(seq_nr);
        self.last_activity = now;
    }

    /// True when `seq_nr` is the outstanding probe
    pub fn is_probe(&self, seq_nr: u16) -> bool {
        self.probe_seq == Some(seq_nr)
    }

    /// The probe was acked: the path carries its size
    pub fn on_probe_acked(&mut self, seq_nr: u16) {
        if self.probe_seq != Some(seq_nr) {
            return;
        }
        self.probe_seq = None;
        self.floor = self.floor.max(self.probe_size);
    }

    /// The probe timed out while other traffic flowed: too big
    pub fn on_probe_lost(&mut self, seq_nr: u16) {
        if self.probe_seq != Some(seq_nr) {
            return;
        }
        self.probe_seq = None;
        self.ceiling = self.ceiling.min(self.probe_size.saturating_sub(1)).max(self.floor);
    }

    /// The socket refused a datagram of `udp_payload` bytes outright
    pub fn on_message_too_large(&mut self, udp_payload: usize) {
        let link_size = (udp_payload + UDP_OVERHEAD) as u16;
        if link_size <= self.floor {
            // Even the floor doesn't fit; fall back to the configured
            // minimum and let probing sort it out
            self.floor = self.configured_floor;
        }
        self.ceiling = self.ceiling.min(link_size.saturating_sub(1)).max(self.floor);
        if self.probe_size >= link_size {
            self.probe_seq = None;
        }
    }
}
