// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-packet-number-space received/to-ack tracking.
//!
//! Grounded on `original_source/src/core/ack_tracker.h`: two
//! [`RangeSet`]s track duplicate detection (`packet_numbers_received`)
//! and the backlog awaiting an ACK frame (`packet_numbers_to_ack`)
//! independently, since a packet can be a known duplicate long after it
//! has already been acknowledged and dropped from the to-ack set.

use crate::frame::{AckEcnCounts, AckFrame, AckRange};
use crate::range_set::RangeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    NonAckEliciting,
    AckEliciting,
    AckImmediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnType {
    NotEct,
    Ect0,
    Ect1,
    Ce,
}

pub struct AckTracker {
    packet_numbers_received: RangeSet,
    packet_numbers_to_ack: RangeSet,
    received_ecn: AckEcnCounts,
    largest_packet_number_acknowledged: Option<u64>,
    largest_packet_number_seen: Option<u64>,
    largest_packet_number_recv_time_us: u64,
    ack_eliciting_packets_to_acknowledge: u16,
    already_written_ack_frame: bool,
    non_zero_recv_ecn: bool,
    immediate_ack_requested: bool,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            packet_numbers_received: RangeSet::new(),
            packet_numbers_to_ack: RangeSet::new(),
            received_ecn: AckEcnCounts::default(),
            largest_packet_number_acknowledged: None,
            largest_packet_number_seen: None,
            largest_packet_number_recv_time_us: 0,
            ack_eliciting_packets_to_acknowledge: 0,
            already_written_ack_frame: false,
            non_zero_recv_ecn: false,
            immediate_ack_requested: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record receipt of `packet_number` in the duplicate-detection set.
    /// Returns `true` if it is a duplicate (already seen).
    pub fn add_packet_number(&mut self, packet_number: u64) -> bool {
        if self.packet_numbers_received.contains(packet_number) {
            return true;
        }
        self.packet_numbers_received.add_value(packet_number);
        false
    }

    /// Queue `packet_number` for acknowledgment.
    pub fn ack_packet(
        &mut self,
        packet_number: u64,
        recv_time_us: u64,
        ecn: EcnType,
        ack_type: AckType,
    ) {
        self.packet_numbers_to_ack.add_value(packet_number);
        self.already_written_ack_frame = false;

        if self.largest_packet_number_seen.is_none_or(|l| packet_number > l) {
            self.largest_packet_number_seen = Some(packet_number);
            self.largest_packet_number_recv_time_us = recv_time_us;
        }

        match ecn {
            EcnType::NotEct => {}
            EcnType::Ect0 => {
                self.received_ecn.ect0 += 1;
                self.non_zero_recv_ecn = true;
            }
            EcnType::Ect1 => {
                self.received_ecn.ect1 += 1;
                self.non_zero_recv_ecn = true;
            }
            EcnType::Ce => {
                self.received_ecn.ce += 1;
                self.non_zero_recv_ecn = true;
            }
        }

        match ack_type {
            AckType::NonAckEliciting => {}
            AckType::AckEliciting => self.ack_eliciting_packets_to_acknowledge += 1,
            AckType::AckImmediate => {
                self.ack_eliciting_packets_to_acknowledge += 1;
                self.immediate_ack_requested = true;
            }
        }
    }

    /// `true` if any packet, ack-eliciting or not, is queued for ack.
    pub fn has_packets_to_ack(&self) -> bool {
        !self.packet_numbers_to_ack.is_empty()
    }

    /// `true` if an ACK should be sent promptly rather than coalesced
    /// with the next outgoing packet (§3 immediate-ack policy:
    /// `IMMEDIATE_ACK` frame seen, or the ack-eliciting backlog is large
    /// enough that further delay risks a spurious retransmission).
    pub fn should_ack_immediately(&self, packet_threshold: u64) -> bool {
        self.immediate_ack_requested
            || u64::from(self.ack_eliciting_packets_to_acknowledge) >= packet_threshold
    }

    /// Build the ACK frame for everything currently queued. Returns
    /// `None` if nothing is queued.
    pub fn build_ack_frame(&mut self, ack_delay_us: u64, ack_delay_exponent: u8) -> Option<AckFrame> {
        let largest = self.packet_numbers_to_ack.get_max()?;
        let mut ranges: Vec<(u64, u64)> = self
            .packet_numbers_to_ack
            .iter()
            .map(|s| (s.low, s.high()))
            .collect();
        ranges.reverse(); // encode from largest to smallest, per RFC 9000 §19.3

        let (first_low, first_high) = ranges[0];
        let first_ack_range = first_high - first_low;
        let mut additional_ranges = Vec::new();
        let mut prev_low = first_low;
        for &(low, high) in &ranges[1..] {
            let gap = prev_low - high - 2;
            let ack_block = high - low;
            additional_ranges.push(AckRange { gap, ack_block });
            prev_low = low;
        }

        let ack_delay = ack_delay_us >> ack_delay_exponent;
        let ecn = if self.non_zero_recv_ecn {
            Some(self.received_ecn.clone())
        } else {
            None
        };

        self.already_written_ack_frame = true;
        self.ack_eliciting_packets_to_acknowledge = 0;
        self.immediate_ack_requested = false;

        Some(AckFrame {
            largest_acknowledged: largest,
            ack_delay,
            first_ack_range,
            additional_ranges,
            ecn,
        })
    }

    /// Called once the peer has acknowledged our ACK frame covering up to
    /// `largest_acked_pn`: everything at or below it can be dropped from
    /// the to-ack backlog, since retransmitting an ack the peer already
    /// has would be wasted work.
    pub fn on_ack_frame_acked(&mut self, largest_acked_pn: u64) {
        self.largest_packet_number_acknowledged =
            Some(self.largest_packet_number_acknowledged.unwrap_or(0).max(largest_acked_pn));
        self.packet_numbers_to_ack.set_min(largest_acked_pn + 1);
    }

    pub fn largest_recv_time_us(&self) -> u64 {
        self.largest_packet_number_recv_time_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection_flags_repeat_packet_numbers() {
        let mut t = AckTracker::new();
        assert!(!t.add_packet_number(5));
        assert!(t.add_packet_number(5));
        assert!(!t.add_packet_number(6));
    }

    #[test]
    fn ack_frame_encodes_single_contiguous_range() {
        let mut t = AckTracker::new();
        for pn in 0..5u64 {
            t.ack_packet(pn, 1000, EcnType::NotEct, AckType::AckEliciting);
        }
        let frame = t.build_ack_frame(0, 3).unwrap();
        assert_eq!(frame.largest_acknowledged, 4);
        assert_eq!(frame.first_ack_range, 4);
        assert!(frame.additional_ranges.is_empty());
    }

    #[test]
    fn ack_frame_encodes_gaps_between_ranges() {
        // §8 scenario: {[2,2], [5,7], [10,12]}
        let mut t = AckTracker::new();
        for pn in [2, 5, 6, 7, 10, 11, 12] {
            t.ack_packet(pn, 1000, EcnType::NotEct, AckType::AckEliciting);
        }
        let frame = t.build_ack_frame(0, 3).unwrap();
        assert_eq!(frame.largest_acknowledged, 12);
        assert_eq!(frame.first_ack_range, 2); // [10,12]
        assert_eq!(frame.additional_ranges.len(), 2);
        // gap between [10,12] and [5,7]: packets 8,9 missing -> gap = 10-7-2 = 1
        assert_eq!(frame.additional_ranges[0].gap, 1);
        assert_eq!(frame.additional_ranges[0].ack_block, 2); // [5,7]
        // gap between [5,7] and [2,2]: packets 3,4 missing -> gap = 5-2-2 = 1
        assert_eq!(frame.additional_ranges[1].gap, 1);
        assert_eq!(frame.additional_ranges[1].ack_block, 0); // [2,2]
    }

    #[test]
    fn ecn_counts_accumulate_and_surface_only_when_nonzero() {
        let mut t = AckTracker::new();
        t.ack_packet(0, 0, EcnType::NotEct, AckType::AckEliciting);
        assert!(t.build_ack_frame(0, 3).unwrap().ecn.is_none());

        let mut t2 = AckTracker::new();
        t2.ack_packet(0, 0, EcnType::Ect0, AckType::AckEliciting);
        t2.ack_packet(1, 0, EcnType::Ce, AckType::AckEliciting);
        let frame = t2.build_ack_frame(0, 3).unwrap();
        let ecn = frame.ecn.unwrap();
        assert_eq!(ecn.ect0, 1);
        assert_eq!(ecn.ce, 1);
    }

    #[test]
    fn immediate_ack_policy_triggers_on_threshold_or_explicit_request() {
        let mut t = AckTracker::new();
        for pn in 0..2u64 {
            t.ack_packet(pn, 0, EcnType::NotEct, AckType::AckEliciting);
        }
        assert!(!t.should_ack_immediately(3));
        t.ack_packet(2, 0, EcnType::NotEct, AckType::AckEliciting);
        assert!(t.should_ack_immediately(3));

        let mut t2 = AckTracker::new();
        t2.ack_packet(0, 0, EcnType::NotEct, AckType::AckImmediate);
        assert!(t2.should_ack_immediately(100));
    }

    #[test]
    fn on_ack_frame_acked_trims_to_ack_backlog() {
        let mut t = AckTracker::new();
        for pn in 0..5u64 {
            t.ack_packet(pn, 0, EcnType::NotEct, AckType::AckEliciting);
        }
        t.on_ack_frame_acked(2);
        assert!(!t.packet_numbers_to_ack.contains(0));
        assert!(!t.packet_numbers_to_ack.contains(2));
        assert!(t.packet_numbers_to_ack.contains(3));
    }
}
