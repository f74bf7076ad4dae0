// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BBR v1 congestion control, behind the `bbr` feature.
//!
//! `original_source` carries no standalone `bbr.c` in this pack, so this
//! follows the public BBR v1 algorithm description directly: a
//! bandwidth-delay-product model driven by a windowed-max bandwidth
//! filter and a windowed-min RTT filter, cycling through Startup, Drain,
//! ProbeBW, and ProbeRTT states. Struct shape follows [`super::cubic::Cubic`].

use super::CongestionController;

const STARTUP_GAIN: f64 = 2.89; // 2/ln(2)
const DRAIN_GAIN: f64 = 1.0 / STARTUP_GAIN;
const PROBE_BW_GAIN_CYCLE: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const BTLBW_FILTER_WINDOW_ROUNDS: u32 = 10;
const MIN_RTT_FILTER_WINDOW_US: u64 = 10_000_000;
const PROBE_RTT_DURATION_US: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Debug, Clone)]
pub struct Bbr {
    max_datagram_size: u64,
    minimum_window_bytes: u64,

    state: State,
    round_count: u32,
    cycle_index: usize,
    full_bw_reached: bool,
    full_bw_count: u32,
    full_bw: f64,

    /// Windowed-max delivery rate, bytes/sec.
    btlbw_bps: f64,
    /// Windowed-min RTT, microseconds. `None` until the first sample.
    min_rtt_us: Option<u64>,
    min_rtt_stamp_us: u64,
    probe_rtt_done_stamp_us: Option<u64>,

    bytes_in_flight: u64,
    bytes_in_flight_max: u64,
    pacing_gain: f64,
    cwnd_gain: f64,
    exemptions: u8,
}

impl Bbr {
    pub fn new(initial_window_bytes: u64, minimum_window_bytes: u64, max_datagram_size: u64) -> Self {
        Self {
            max_datagram_size,
            minimum_window_bytes,
            state: State::Startup,
            round_count: 0,
            cycle_index: 0,
            full_bw_reached: false,
            full_bw_count: 0,
            full_bw: 0.0,
            btlbw_bps: initial_window_bytes as f64, // seed so early cwnd isn't zero
            min_rtt_us: None,
            min_rtt_stamp_us: 0,
            probe_rtt_done_stamp_us: None,
            bytes_in_flight: 0,
            bytes_in_flight_max: 0,
            pacing_gain: STARTUP_GAIN,
            cwnd_gain: STARTUP_GAIN,
            exemptions: 0,
        }
    }

    fn bdp_bytes(&self) -> u64 {
        let Some(min_rtt_us) = self.min_rtt_us else {
            return self.minimum_window_bytes;
        };
        (self.btlbw_bps * (min_rtt_us as f64 / 1_000_000.0)) as u64
    }

    fn target_cwnd(&self) -> u64 {
        ((self.bdp_bytes() as f64 * self.cwnd_gain) as u64).max(self.minimum_window_bytes)
    }

    fn enter_probe_bw(&mut self) {
        self.state = State::ProbeBw;
        self.cycle_index = 1; // start at the non-probing gain of the cycle
        self.pacing_gain = PROBE_BW_GAIN_CYCLE[self.cycle_index];
        self.cwnd_gain = 2.0;
    }

    fn update_round(&mut self, now_us: u64, delivery_rate_bps: f64) {
        self.round_count += 1;
        if delivery_rate_bps > self.btlbw_bps {
            self.btlbw_bps = delivery_rate_bps;
        }

        if self.state == State::Startup {
            if self.btlbw_bps >= self.full_bw * 1.25 || self.full_bw == 0.0 {
                self.full_bw = self.btlbw_bps;
                self.full_bw_count = 0;
            } else {
                self.full_bw_count += 1;
                if self.full_bw_count >= 3 {
                    self.full_bw_reached = true;
                    self.state = State::Drain;
                    self.pacing_gain = DRAIN_GAIN;
                    self.cwnd_gain = STARTUP_GAIN;
                }
            }
        } else if self.state == State::Drain && self.bytes_in_flight <= self.target_cwnd() {
            self.enter_probe_bw();
        } else if self.state == State::ProbeBw {
            self.cycle_index = (self.cycle_index + 1) % PROBE_BW_GAIN_CYCLE.len();
            self.pacing_gain = PROBE_BW_GAIN_CYCLE[self.cycle_index];
        }

        let _ = now_us;
    }

    fn check_probe_rtt(&mut self, now_us: u64, rtt_sample_us: u64) {
        let expired = now_us.saturating_sub(self.min_rtt_stamp_us) > MIN_RTT_FILTER_WINDOW_US;
        if self.min_rtt_us.is_none_or(|m| rtt_sample_us <= m) {
            self.min_rtt_us = Some(rtt_sample_us);
            self.min_rtt_stamp_us = now_us;
        } else if expired && self.state != State::ProbeRtt {
            self.state = State::ProbeRtt;
            self.pacing_gain = 1.0;
            self.cwnd_gain = 1.0;
            self.probe_rtt_done_stamp_us = None;
        }

        if self.state == State::ProbeRtt {
            if self.probe_rtt_done_stamp_us.is_none() && self.bytes_in_flight <= self.minimum_window_bytes {
                self.probe_rtt_done_stamp_us = Some(now_us + PROBE_RTT_DURATION_US);
            }
            if let Some(done) = self.probe_rtt_done_stamp_us {
                if now_us >= done {
                    self.min_rtt_stamp_us = now_us;
                    if self.full_bw_reached {
                        self.enter_probe_bw();
                    } else {
                        self.state = State::Startup;
                        self.pacing_gain = STARTUP_GAIN;
                        self.cwnd_gain = STARTUP_GAIN;
                    }
                }
            }
        }
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &'static str {
        "bbr"
    }

    fn can_send(&self) -> bool {
        self.exemptions > 0 || self.bytes_in_flight < self.target_cwnd()
    }

    fn set_exemption(&mut self, num_packets: u8) {
        self.exemptions = num_packets;
    }

    fn get_exemptions(&self) -> u8 {
        self.exemptions
    }

    fn reset(&mut self, initial_window_bytes: u64) {
        *self = Bbr::new(initial_window_bytes, self.minimum_window_bytes, self.max_datagram_size);
    }

    fn get_send_allowance(&self, time_since_last_send_us: Option<u64>) -> u64 {
        if self.exemptions > 0 {
            return self.max_datagram_size;
        }
        let window_allowance = self.target_cwnd().saturating_sub(self.bytes_in_flight);
        match time_since_last_send_us {
            Some(elapsed_us) if elapsed_us > 0 => {
                let pacing_rate_bps = self.pacing_gain * self.btlbw_bps;
                let paced_bytes =
                    ((pacing_rate_bps * elapsed_us as f64 / 1_000_000.0) as u64).max(self.max_datagram_size);
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
        self.check_probe_rtt(now_us, smoothed_rtt_us);

        let delivery_rate_bps = if smoothed_rtt_us > 0 {
            num_retransmittable_bytes as f64 / (smoothed_rtt_us as f64 / 1_000_000.0)
        } else {
            self.btlbw_bps
        };
        if self.round_count % BTLBW_FILTER_WINDOW_ROUNDS == 0 {
            self.btlbw_bps = delivery_rate_bps.max(self.btlbw_bps * 0.9);
        }
        self.update_round(now_us, delivery_rate_bps);
        false
    }

    fn on_data_lost(
        &mut self,
        _largest_packet_number_lost: u64,
        _largest_packet_number_sent: u64,
        _num_retransmittable_bytes: u32,
        persistent_congestion: bool,
    ) {
        if persistent_congestion {
            self.btlbw_bps = (self.minimum_window_bytes as f64) / 0.1;
            self.state = State::Startup;
            self.full_bw_reached = false;
            self.full_bw = 0.0;
            self.full_bw_count = 0;
            self.pacing_gain = STARTUP_GAIN;
            self.cwnd_gain = STARTUP_GAIN;
        }
    }

    fn on_spurious_congestion_event(&mut self) {}

    fn congestion_window(&self) -> u64 {
        self.target_cwnd()
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

    fn new_bbr() -> Bbr {
        Bbr::new(14_720, 2 * 1200, 1200)
    }

    #[test]
    fn starts_in_startup_with_seeded_bandwidth() {
        let bbr = new_bbr();
        assert_eq!(bbr.state, State::Startup);
        assert!(bbr.can_send());
    }

    #[test]
    fn acking_data_grows_bandwidth_estimate_and_shrinks_in_flight() {
        let mut bbr = new_bbr();
        bbr.on_data_sent(1200);
        bbr.on_data_acknowledged(10_000, 0, 1200, 5_000);
        assert_eq!(bbr.bytes_in_flight(), 0);
        assert!(bbr.min_rtt_us.is_some());
    }

    #[test]
    fn persistent_congestion_resets_to_startup() {
        let mut bbr = new_bbr();
        bbr.state = State::ProbeBw;
        bbr.full_bw_reached = true;
        bbr.on_data_lost(0, 0, 0, true);
        assert_eq!(bbr.state, State::Startup);
        assert!(!bbr.full_bw_reached);
    }

    #[test]
    fn exemption_grants_one_datagram_of_allowance() {
        let mut bbr = new_bbr();
        bbr.set_exemption(2);
        assert_eq!(bbr.get_exemptions(), 2);
        assert_eq!(bbr.get_send_allowance(None), 1200);
    }

    #[test]
    fn target_cwnd_uses_bandwidth_delay_product_once_rtt_known() {
        let mut bbr = new_bbr();
        bbr.min_rtt_us = Some(50_000);
        bbr.btlbw_bps = 1_000_000.0; // 1 MB/s
        bbr.cwnd_gain = 2.0;
        // bdp = 1_000_000 * 0.05 = 50_000 bytes, target = 100_000
        assert_eq!(bbr.target_cwnd(), 100_000);
    }
}
