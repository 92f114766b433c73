//! LEDBAT congestion control
//!
//! The delay-based controller behind uTP. Each acked packet carries the
//! peer's measurement of our one-way delay; the difference between the
//! current measurement and a long-window minimum (the base delay)
//! estimates self-induced queueing, and the window is steered so that
//! queueing stays near the target. The controller yields to loss-based
//! flows long before loss occurs.
//!
//! Loss handling is split: a retransmission timeout collapses the
//! window to one segment and doubles the RTO, while a duplicate-ack
//! fast retransmit only halves the window and leaves the RTO alone.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::UtpSettings;

/// Minimum congestion window: one maximum-size segment
pub const MIN_WINDOW: u32 = MSS;

/// Maximum segment size used for window arithmetic
pub const MSS: u32 = 1400;

/// Base delay window duration (2 minutes)
const BASE_DELAY_HISTORY_DURATION: Duration = Duration::from_secs(120);

/// Number of base delay samples to keep
const BASE_DELAY_HISTORY_SIZE: usize = 13;

/// Samples in the current-delay filter
const CURRENT_DELAY_FILTER_SIZE: usize = 4;

/// RTO bounds
const MIN_RTO: Duration = Duration::from_millis(500);
const MAX_RTO: Duration = Duration::from_secs(60);

/// Sliding window of delay samples keeping a running minimum
#[derive(Debug, Clone)]
struct DelayHistory {
    samples: VecDeque<(Instant, u32)>,
    max_size: usize,
    window_duration: Duration,
}

impl DelayHistory {
    fn new(max_size: usize, window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_size),
            max_size,
            window_duration,
        }
    }

    fn add_sample(&mut self, now: Instant, delay_us: u32) {
        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if self.samples.len() >= self.max_size {
            self.samples.pop_front();
        }
        self.samples.push_back((now, delay_us));
    }

    fn min(&self) -> Option<u32> {
        self.samples.iter().map(|(_, d)| *d).min()
    }
}

/// LEDBAT congestion controller with RTT estimation and send pacing
#[derive(Debug)]
pub struct LedbatController {
    /// Current congestion window (bytes)
    max_window: u32,

    /// Configured ceiling for the window
    window_ceiling: u32,

    /// Target queueing delay (microseconds)
    target_delay_us: u32,

    /// Window gain
    gain: f64,

    /// Slow start threshold
    ssthresh: u32,

    /// Whether in slow start phase
    in_slow_start: bool,

    /// Minimum one-way delay over the long window
    base_delay_history: DelayHistory,

    /// Recent one-way delays, filtered by minimum
    current_delay_filter: VecDeque<u32>,

    /// Bytes sent but not yet acknowledged
    bytes_in_flight: u32,

    /// Smoothed RTT (microseconds); 0 until the first sample
    srtt_us: u32,

    /// RTT variance (microseconds)
    rttvar_us: u32,

    /// Retransmission timeout
    rto: Duration,

    /// Send quota for pacing, in bytes
    quota: f64,

    /// Last quota refill
    last_refill: Instant,
}

impl LedbatController {
    pub fn new(settings: &UtpSettings) -> Self {
        Self {
            max_window: 2 * MSS,
            window_ceiling: settings.max_window.max(MIN_WINDOW),
            target_delay_us: settings.target_delay_us.max(1),
            gain: settings.gain,
            ssthresh: settings.max_window,
            in_slow_start: true,
            base_delay_history: DelayHistory::new(
                BASE_DELAY_HISTORY_SIZE,
                BASE_DELAY_HISTORY_DURATION,
            ),
            current_delay_filter: VecDeque::with_capacity(CURRENT_DELAY_FILTER_SIZE),
            bytes_in_flight: 0,
            srtt_us: 0,
            rttvar_us: 0,
            rto: Duration::from_secs(1),
            quota: 2.0 * MSS as f64,
            last_refill: Instant::now(),
        }
    }

    /// Current congestion window in bytes
    pub fn window(&self) -> u32 {
        self.max_window
    }

    /// Bytes in flight
    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    /// Window headroom in bytes
    pub fn available_window(&self) -> u32 {
        self.max_window.saturating_sub(self.bytes_in_flight)
    }

    /// Current retransmission timeout
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT in microseconds, 0 before the first sample
    pub fn srtt_us(&self) -> u32 {
        self.srtt_us
    }

    /// Record a transmission
    pub fn on_send(&mut self, bytes: u32) {
        self.bytes_in_flight += bytes;
        self.quota = (self.quota - bytes as f64).max(-(MSS as f64));
    }

    /// Remove abandoned bytes from flight without treating them as
    /// acked or lost (dropped MTU probes)
    pub fn on_abandoned(&mut self, bytes: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    /// Record the peer's one-way delay measurement of our packets
    pub fn add_delay_sample(&mut self, now: Instant, delay_us: u32) {
        self.base_delay_history.add_sample(now, delay_us);

        if self.current_delay_filter.len() >= CURRENT_DELAY_FILTER_SIZE {
            self.current_delay_filter.pop_front();
        }
        self.current_delay_filter.push_back(delay_us);
    }

    /// Queueing delay estimate: current filtered delay above the base
    fn queuing_delay_us(&self) -> u32 {
        let base = match self.base_delay_history.min() {
            Some(base) => base,
            None => return 0,
        };
        let current = self
            .current_delay_filter
            .iter()
            .copied()
            .min()
            .unwrap_or(base);
        current.saturating_sub(base)
    }

    /// Process a cumulative or selective acknowledgment of `bytes_acked`
    /// bytes. `rtt` is a round-trip sample from a never-retransmitted
    /// packet, when one is available.
    pub fn on_ack(&mut self, bytes_acked: u32, rtt: Option<Duration>) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes_acked);

        if let Some(rtt) = rtt {
            self.update_rtt(rtt);
        }

        self.adjust_window(bytes_acked, self.queuing_delay_us());
    }

    fn adjust_window(&mut self, bytes_acked: u32, queuing_delay_us: u32) {
        if self.in_slow_start {
            if queuing_delay_us < self.target_delay_us && self.max_window < self.ssthresh {
                self.max_window = self.max_window.saturating_add(bytes_acked);
            } else {
                self.in_slow_start = false;
                self.ssthresh = self.max_window;
            }
        } else {
            // off_target in [-1, 1]; negative means self-induced
            // queueing was detected and the window shrinks
            let off_target = ((self.target_delay_us as f64 - queuing_delay_us as f64)
                / self.target_delay_us as f64)
                .clamp(-1.0, 1.0);

            let delta = self.gain * off_target * bytes_acked as f64 * MSS as f64
                / self.max_window.max(1) as f64;

            if delta >= 0.0 {
                self.max_window = self.max_window.saturating_add(delta as u32);
            } else {
                self.max_window = self.max_window.saturating_sub((-delta) as u32);
            }
        }

        self.max_window = self.max_window.clamp(MIN_WINDOW, self.window_ceiling);
    }

    /// Jacobson/Karels smoothing, alpha = 1/8, beta = 1/4
    fn update_rtt(&mut self, sample: Duration) {
        let sample_us = sample.as_micros().min(u128::from(u32::MAX)) as u32;

        if self.srtt_us == 0 {
            self.srtt_us = sample_us;
            self.rttvar_us = sample_us / 2;
        } else {
            let diff = sample_us.abs_diff(self.srtt_us);
            self.rttvar_us = self.rttvar_us - self.rttvar_us / 4 + diff / 4;
            self.srtt_us = self.srtt_us - self.srtt_us / 8 + sample_us / 8;
        }

        let rto_us = u64::from(self.srtt_us) + 4 * u64::from(self.rttvar_us);
        self.rto = Duration::from_micros(rto_us).clamp(MIN_RTO, MAX_RTO);
    }

    /// Retransmission timeout: collapse to one segment, double the RTO
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.max_window / 2).max(MIN_WINDOW);
        self.max_window = MIN_WINDOW;
        self.in_slow_start = false;
        self.rto = (self.rto * 2).min(MAX_RTO);
    }

    /// Duplicate-ack fast retransmit: halve the window, RTO untouched
    pub fn on_fast_retransmit(&mut self) {
        self.max_window = (self.max_window / 2).max(MIN_WINDOW);
        self.ssthresh = self.max_window;
        self.in_slow_start = false;
    }

    /// Refill the pacing quota at `max_window / srtt` bytes per second
    pub fn refill_quota(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;

        if self.srtt_us == 0 {
            // No RTT estimate yet; let the window alone gate sending
            self.quota = self.max_window as f64;
            return;
        }

        let rate = self.max_window as f64 / (self.srtt_us as f64 / 1_000_000.0);
        self.quota = (self.quota + rate * elapsed.as_secs_f64()).min(self.max_window as f64);
    }

    /// Whether pacing and the window allow `bytes` to leave now
    pub fn can_send(&self, bytes: u32) -> bool {
        self.available_window() >= bytes && self.quota >= bytes as f64
    }
}
