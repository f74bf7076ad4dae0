// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-encryption-level packet-number space.
//!
//! Grounded on `original_source/src/core/packet_space.h`/`.c`: one
//! `PacketNumberSpace` exists per [`EncryptLevel`] (Initial, Handshake,
//! 1-RTT — 0-RTT shares the 1-RTT space's packet-number sequence per RFC
//! 9001 §4). Tracks the next outgoing packet number, decompresses
//! incoming truncated packet numbers (RFC 9000 §17.1), and holds packets
//! that arrived before this level's decryption keys did.

use crate::config::MAX_DEFERRED_PACKETS_PER_SPACE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptLevel {
    Initial,
    Handshake,
    OneRtt,
}

/// Decompress a truncated packet number given the largest packet number
/// acknowledged so far on this space (RFC 9000 §17.1, "Sample Packet
/// Number Decoding Algorithm").
pub fn decode_packet_number(largest_pn: i64, truncated: u32, pn_len_bits: u32) -> u64 {
    let pn_win = 1i64 << pn_len_bits;
    let pn_hwin = pn_win / 2;
    let pn_mask = !(pn_win - 1);
    let expected = largest_pn + 1;
    let candidate = (expected & pn_mask) | i64::from(truncated);
    let candidate = if candidate <= expected - pn_hwin && candidate < (1i64 << 62) - pn_win {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    };
    candidate.max(0) as u64
}

/// Smallest number of bytes needed to encode `packet_number` such that it
/// decodes unambiguously given `largest_acked` (RFC 9000 §17.1, encoder
/// side: at least one more than the bit distance to the largest acked).
pub fn required_packet_number_len(packet_number: u64, largest_acked: Option<u64>) -> u8 {
    let range = match largest_acked {
        Some(acked) => packet_number.saturating_sub(acked),
        None => packet_number + 1,
    };
    let needed_bits = 64 - (2 * (range + 1)).leading_zeros().min(63);
    let needed_bytes = needed_bits.div_ceil(8).max(1);
    needed_bytes.min(4) as u8
}

/// Key-phase bookkeeping for the 1-RTT space (RFC 9001 §6 key update).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyPhaseState {
    pub current_key_phase: bool,
    pub awaiting_confirmation: bool,
    pub write_key_phase_start_pn: u64,
    pub read_key_phase_start_pn: u64,
    pub current_key_phase_bytes_sent: u64,
}

/// A packet that arrived before this space's decryption keys were ready.
pub struct DeferredPacket {
    pub datagram: Vec<u8>,
}

/// Per-space tracking: next expected receive packet number (for
/// decompression), ECN counters, and the deferred-packet queue.
pub struct PacketNumberSpace {
    pub level: EncryptLevel,
    pub next_send_packet_number: u64,
    /// Largest packet number received so far on this space, or `-1` if
    /// none yet (matches the decoder's "largest_pn" input convention).
    pub largest_recv_packet_number: i64,
    pub ecn_ect_counter: u64,
    pub ecn_ce_counter: u64,
    pub key_phase: KeyPhaseState,
    deferred: Vec<DeferredPacket>,
}

impl PacketNumberSpace {
    pub fn new(level: EncryptLevel) -> Self {
        Self {
            level,
            next_send_packet_number: 0,
            largest_recv_packet_number: -1,
            ecn_ect_counter: 0,
            ecn_ce_counter: 0,
            key_phase: KeyPhaseState::default(),
            deferred: Vec::new(),
        }
    }

    /// Allocate the next outgoing packet number.
    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.next_send_packet_number;
        self.next_send_packet_number += 1;
        pn
    }

    /// Decode a truncated receive packet number and, if it becomes the
    /// new largest, update tracking.
    pub fn decode_and_observe(&mut self, truncated: u32, pn_len_bits: u32) -> u64 {
        let decoded = decode_packet_number(self.largest_recv_packet_number, truncated, pn_len_bits);
        if decoded as i64 > self.largest_recv_packet_number {
            self.largest_recv_packet_number = decoded as i64;
        }
        decoded
    }

    /// Queue a datagram whose keys aren't available yet. Evicts the
    /// oldest deferred packet if the cap is exceeded (§9 open question 3
    /// — no explicit cap exists upstream, so we degrade gracefully the
    /// same way the range set does under pressure).
    pub fn defer(&mut self, datagram: Vec<u8>) {
        if self.deferred.len() >= MAX_DEFERRED_PACKETS_PER_SPACE {
            log::warn!(
                "packet space {:?}: deferred-packet cap reached, dropping oldest",
                self.level
            );
            self.deferred.remove(0);
        }
        self.deferred.push(DeferredPacket { datagram });
    }

    pub fn take_deferred(&mut self) -> Vec<DeferredPacket> {
        std::mem::take(&mut self.deferred)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_packet_number_matches_rfc9000_worked_style_example() {
        // largest_pn = 0xa82f30ea, truncated = 0x9b32, 2-byte encoding
        let largest_pn = 0xa82f_30ea_i64;
        let decoded = decode_packet_number(largest_pn, 0x9b32, 16);
        assert_eq!(decoded, 0xa82f_9b32);
    }

    #[test]
    fn decode_stays_within_window_when_truncated_value_is_close() {
        let largest_pn = 0xabe8_bc_i64;
        let decoded = decode_packet_number(largest_pn, 0xbe9e, 16);
        assert_eq!(decoded, 0xab_be9e);
    }

    #[test]
    fn decode_wraps_forward_past_a_window_boundary() {
        let largest_pn = 0x1_0000_i64; // 65536
        let decoded = decode_packet_number(largest_pn, 0x0001, 16);
        assert_eq!(decoded, 0x1_0001);
    }

    #[test]
    fn required_len_grows_with_distance_from_largest_acked() {
        assert_eq!(required_packet_number_len(1, None), 1);
        assert_eq!(required_packet_number_len(300, Some(0)), 2);
        assert_eq!(required_packet_number_len(100_000, Some(0)), 3);
    }

    #[test]
    fn next_packet_number_increments_monotonically() {
        let mut space = PacketNumberSpace::new(EncryptLevel::Initial);
        assert_eq!(space.next_packet_number(), 0);
        assert_eq!(space.next_packet_number(), 1);
        assert_eq!(space.next_packet_number(), 2);
    }

    #[test]
    fn defer_evicts_oldest_once_cap_exceeded() {
        let mut space = PacketNumberSpace::new(EncryptLevel::Handshake);
        for i in 0..MAX_DEFERRED_PACKETS_PER_SPACE {
            space.defer(vec![i as u8]);
        }
        assert_eq!(space.deferred_count(), MAX_DEFERRED_PACKETS_PER_SPACE);
        space.defer(vec![0xff]);
        assert_eq!(space.deferred_count(), MAX_DEFERRED_PACKETS_PER_SPACE);
        let drained = space.take_deferred();
        assert_eq!(drained[0].datagram, vec![1]); // oldest (index 0) was evicted
        assert_eq!(space.deferred_count(), 0);
    }
}
