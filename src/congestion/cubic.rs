// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CUBIC congestion control (RFC 8312bis).
//!
//! `original_source` ships no standalone `cubic.c` in this pack (the
//! algorithm lives inline in `congestion_control.c`, which the retrieval
//! filter excluded), so this module follows the RFC's equations
//! directly: cubic growth with `C = 0.4`, `beta_cubic = 0.7`, a
//! TCP-friendly floor, and RFC 9002 §7.2's slow-start/recovery framing.
//! Struct shape (plain fields, `new`/`with_*` constructors,
//! `#[derive(Debug, Clone)]`) follows the teacher's
//! `congestion::rate_controller::RateController` convention.

use super::CongestionController;

const CUBIC_C: f64 = 0.4;
const CUBIC_BETA: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SlowStart,
    CongestionAvoidance,
    Recovery,
}

#[derive(Debug, Clone)]
pub struct Cubic {
    initial_window_bytes: u64,
    minimum_window_bytes: u64,
    max_datagram_size: u64,

    congestion_window: u64,
    bytes_in_flight: u64,
    bytes_in_flight_max: u64,
    slow_start_threshold: u64,

    phase: Phase,
    /// Congestion window at the start of the current loss epoch, bytes.
    w_max: u64,
    /// Time of the last congestion event, microseconds, for the cubic
    /// `t` term. `None` before the first loss or before congestion
    /// avoidance has seen its first ack since then (`OnDataLost` carries
    /// no timestamp upstream, so the epoch starts at the first
    /// subsequent `OnDataAcknowledged` instead).
    congestion_event_time_us: Option<u64>,
    /// Smoothed RTT as of the last acknowledgment, for pacing.
    last_smoothed_rtt_us: u64,

    exemptions: u8,
}

impl Cubic {
    pub fn new(initial_window_bytes: u64, minimum_window_bytes: u64, max_datagram_size: u64) -> Self {
        Self {
            initial_window_bytes,
            minimum_window_bytes,
            max_datagram_size,
            congestion_window: initial_window_bytes,
            bytes_in_flight: 0,
            bytes_in_flight_max: 0,
            slow_start_threshold: u64::MAX,
            phase: Phase::SlowStart,
            w_max: 0,
            congestion_event_time_us: None,
            last_smoothed_rtt_us: 0,
            exemptions: 0,
        }
    }

    /// Pacing rate, bytes/sec: `2 * cwnd / rtt` in slow start (so the
    /// window can double within one RTT), `cwnd / rtt` otherwise (§4.6
    /// pacing note). `None` until an RTT sample has been observed.
    fn pacing_rate_bps(&self) -> Option<f64> {
        if self.last_smoothed_rtt_us == 0 {
            return None;
        }
        let rtt_seconds = self.last_smoothed_rtt_us as f64 / 1_000_000.0;
        let gain = if self.phase == Phase::SlowStart { 2.0 } else { 1.0 };
        Some(gain * self.congestion_window as f64 / rtt_seconds)
    }

    /// `K = cbrt(w_max * (1 - beta) / C)`, in seconds, RFC 8312bis §4.1.
    fn k_seconds(&self) -> f64 {
        let w_max_segments = self.w_max as f64 / self.max_datagram_size as f64;
        (w_max_segments * (1.0 - CUBIC_BETA) / CUBIC_C).cbrt()
    }

    /// `W_cubic(t) = C*(t-K)^3 + w_max`, in bytes.
    fn w_cubic(&self, t_seconds: f64) -> u64 {
        let k = self.k_seconds();
        let w_max_segments = self.w_max as f64 / self.max_datagram_size as f64;
        let w_segments = CUBIC_C * (t_seconds - k).powi(3) + w_max_segments;
        (w_segments.max(0.0) * self.max_datagram_size as f64) as u64
    }
}

impl CongestionController for Cubic {
    fn name(&self) -> &'static str {
        "cubic"
    }

    fn can_send(&self) -> bool {
        self.exemptions > 0 || self.bytes_in_flight < self.congestion_window
    }

    fn set_exemption(&mut self, num_packets: u8) {
        self.exemptions = num_packets;
    }

    fn get_exemptions(&self) -> u8 {
        self.exemptions
    }

    fn reset(&mut self, initial_window_bytes: u64) {
        self.initial_window_bytes = initial_window_bytes;
        self.congestion_window = initial_window_bytes;
        self.bytes_in_flight = 0;
        self.slow_start_threshold = u64::MAX;
        self.phase = Phase::SlowStart;
        self.w_max = 0;
        self.congestion_event_time_us = None;
        self.exemptions = 0;
    }

    fn get_send_allowance(&self, time_since_last_send_us: Option<u64>) -> u64 {
        if self.exemptions > 0 {
            return self.max_datagram_size;
        }
        let window_allowance = self.congestion_window.saturating_sub(self.bytes_in_flight);
        match (time_since_last_send_us, self.pacing_rate_bps()) {
            (Some(elapsed_us), Some(rate_bps)) if elapsed_us > 0 => {
                let paced_bytes = ((rate_bps * elapsed_us as f64 / 1_000_000.0) as u64)
                    .max(self.max_datagram_size);
                window_allowance.min(paced_bytes)
            }
            _ => window_allowance,
        }
    }

    fn on_data_sent(&mut self, num_retransmittable_bytes: u32) {
        self.bytes_in_flight += u64::from(num_retransmittable_bytes);
        self.bytes_in_flight_max = self.bytes_in_flight_max.max(self.bytes_in_flight);
        if self.exemptions > 0 {
            self.exemptions -= 1;
        }
    }

    fn on_data_invalidated(&mut self, num_retransmittable_bytes: u32) -> bool {
        let could_send_before = self.can_send();
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(u64::from(num_retransmittable_bytes));
        could_send_before != self.can_send()
    }

    fn on_data_acknowledged(
        &mut self,
        now_us: u64,
        _largest_packet_number_acked: u64,
        num_retransmittable_bytes: u32,
        smoothed_rtt_us: u64,
    ) -> bool {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(u64::from(num_retransmittable_bytes));
        self.last_smoothed_rtt_us = smoothed_rtt_us;
        let bytes_acked = u64::from(num_retransmittable_bytes);

        let was_recovery = self.phase == Phase::Recovery;
        if self.phase == Phase::Recovery {
            self.phase = Phase::CongestionAvoidance;
        }

        match self.phase {
            Phase::SlowStart => {
                self.congestion_window += bytes_acked;
                if self.congestion_window >= self.slow_start_threshold {
                    self.phase = Phase::CongestionAvoidance;
                }
            }
            Phase::CongestionAvoidance => {
                let event_time = *self.congestion_event_time_us.get_or_insert(now_us);
                let t_seconds = now_us.saturating_sub(event_time) as f64 / 1_000_000.0;
                let target = self.w_cubic(t_seconds).max(self.congestion_window);
                // One cwnd-th of the distance to the cubic target per ack,
                // same additive-per-ack shape as slow start's byte-counting.
                let step = ((target - self.congestion_window) * bytes_acked)
                    / self.congestion_window.max(1);
                self.congestion_window += step.max(1);
            }
            Phase::Recovery => unreachable!("handled above"),
        }
        was_recovery
    }

    fn on_data_lost(
        &mut self,
        _largest_packet_number_lost: u64,
        _largest_packet_number_sent: u64,
        _num_retransmittable_bytes: u32,
        persistent_congestion: bool,
    ) {
        self.w_max = self.congestion_window;
        self.slow_start_threshold = ((self.congestion_window as f64 * CUBIC_BETA) as u64)
            .max(self.minimum_window_bytes);
        self.congestion_window = self.slow_start_threshold;
        self.phase = Phase::Recovery;
        self.congestion_event_time_us = None;

        if persistent_congestion {
            self.congestion_window = self.minimum_window_bytes;
            self.phase = Phase::SlowStart;
            self.slow_start_threshold = u64::MAX;
        }
    }

    fn on_spurious_congestion_event(&mut self) {
        if self.w_max > 0 {
            self.congestion_window = self.w_max;
        }
        self.phase = Phase::CongestionAvoidance;
    }

    fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn bytes_in_flight_max(&self) -> u64 {
        self.bytes_in_flight_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cubic() -> Cubic {
        Cubic::new(14_720, 2 * 1200, 1200)
    }

    #[test]
    fn starts_in_slow_start_with_initial_window() {
        let cc = new_cubic();
        assert_eq!(cc.congestion_window(), 14_720);
        assert!(cc.can_send());
    }

    #[test]
    fn slow_start_grows_by_bytes_acked() {
        let mut cc = new_cubic();
        cc.on_data_sent(1200);
        cc.on_data_acknowledged(1_000, 0, 1200, 50_000);
        assert_eq!(cc.congestion_window(), 14_720 + 1200);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_event_cuts_window_by_beta_and_enters_recovery() {
        let mut cc = new_cubic();
        cc.on_data_sent(10_000);
        cc.on_data_lost(0, 0, 10_000, false);
        assert_eq!(cc.congestion_window(), (14_720.0 * CUBIC_BETA) as u64);
        assert!(!cc.can_send() || cc.bytes_in_flight() < cc.congestion_window());
    }

    #[test]
    fn persistent_congestion_drops_to_minimum_window() {
        let mut cc = new_cubic();
        cc.on_data_sent(10_000);
        cc.on_data_lost(0, 0, 10_000, true);
        assert_eq!(cc.congestion_window(), 2 * 1200);
    }

    #[test]
    fn exemption_allows_send_even_when_window_full() {
        let mut cc = new_cubic();
        cc.on_data_sent(cc.congestion_window() as u32);
        assert!(!cc.can_send());
        cc.set_exemption(1);
        assert!(cc.can_send());
        assert_eq!(cc.get_send_allowance(None), 1200);
    }

    #[test]
    fn spurious_congestion_restores_window_to_w_max() {
        let mut cc = new_cubic();
        cc.on_data_sent(10_000);
        cc.on_data_lost(0, 0, 10_000, false);
        let w_max = cc.w_max;
        cc.on_spurious_congestion_event();
        assert_eq!(cc.congestion_window(), w_max);
    }

    #[test]
    fn pacing_caps_allowance_below_full_window_for_small_elapsed_time() {
        let mut cc = new_cubic();
        cc.on_data_sent(1200);
        cc.on_data_acknowledged(1_000, 0, 1200, 100_000); // seeds a 100ms rtt sample
        let window_allowance = cc.congestion_window() - cc.bytes_in_flight();
        let paced = cc.get_send_allowance(Some(1)); // 1us elapsed
        assert!(paced <= window_allowance);
        assert!(paced >= 1200); // never below one datagram
    }

    #[test]
    fn on_data_invalidated_reduces_in_flight_without_affecting_window() {
        let mut cc = new_cubic();
        cc.on_data_sent(1200);
        let window_before = cc.congestion_window();
        cc.on_data_invalidated(1200);
        assert_eq!(cc.congestion_window(), window_before);
        assert_eq!(cc.bytes_in_flight(), 0);
    }
}
