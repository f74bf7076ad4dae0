// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-wide send scheduler: control send flags and deadline-aware
//! stream admission.
//!
//! Grounded on `original_source/src/core/send.h` (the flag taxonomy) and
//! `deadline_engine.c` (`DrainBeforeDeadlineEngine`). The per-stream
//! priority list itself lives on [`crate::stream::StreamSet`]; this
//! module owns the connection-wide control flags that don't belong to
//! any one stream.

/// Connection-wide control send flags (`QUIC_CONN_SEND_FLAG_*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    pub ack: bool,
    pub crypto: bool,
    pub connection_close: bool,
    pub max_data: bool,
    pub max_streams_bidi: bool,
    pub max_streams_uni: bool,
    pub new_connection_id: bool,
    pub retire_connection_id: bool,
    pub path_challenge: bool,
    pub path_response: bool,
    pub ping: bool,
    pub handshake_done: bool,
    pub datagram: bool,
    pub ack_frequency: bool,
    pub dplpmtud: bool,
}

impl SendFlags {
    /// Flags allowed to send even when congestion control denies further
    /// in-flight bytes (`BYPASS_CC`).
    pub fn bypass_cc(self) -> Self {
        Self {
            ack: self.ack,
            connection_close: self.connection_close,
            ..Self::default()
        }
    }

    /// Flags legal to send in Initial/Handshake packets (`ALLOWED_HANDSHAKE`).
    pub fn allowed_in_handshake(self) -> Self {
        Self {
            ack: self.ack,
            crypto: self.crypto,
            connection_close: self.connection_close,
            ping: self.ping,
            ..Self::default()
        }
    }

    /// Cleared on entering the closing state (`CONN_CLOSED_MASK`): only
    /// `connection_close` survives.
    pub fn mask_for_closing(self) -> Self {
        Self {
            connection_close: self.connection_close,
            ..Self::default()
        }
    }

    pub fn is_empty(self) -> bool {
        self == Self::default()
    }

    pub fn any_bypass_cc(self) -> bool {
        self.ack || self.connection_close
    }
}

/// Highest-priority thing for the send loop to do next (§4.7 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendItem {
    Control,
    Stream(u64),
    PmtuProbe,
}

/// Picks the next thing to send: a pending control flag first, then the
/// highest-priority stream with something queued, then a PMTU probe if
/// one is ripe. Mirrors the ordering in §4.7 step 2.
pub fn next_send_item(
    pending_control: bool,
    stream_send_order: &[u64],
    pmtu_probe_ripe: bool,
) -> Option<SendItem> {
    if pending_control {
        return Some(SendItem::Control);
    }
    if let Some(&id) = stream_send_order.first() {
        return Some(SendItem::Stream(id));
    }
    if pmtu_probe_ripe {
        return Some(SendItem::PmtuProbe);
    }
    None
}

/// Output of amplification-limit capping for a server that hasn't
/// validated the peer's address yet (§4.7 step 1): a server may send at
/// most `3x` what it has received from an unvalidated address.
pub fn amplification_limit(bytes_received_from_peer: u64, validated: bool) -> Option<u64> {
    if validated {
        None
    } else {
        Some(3 * bytes_received_from_peer)
    }
}

/// `DrainBeforeDeadlineEngine`: whether a deadline-scheduled stream
/// should be admitted to this send pass now, so it still drains before
/// its deadline. `bbr_in_startup` models the BBR-specific bypass (no
/// bandwidth estimate yet, so admission defaults to allowed).
pub fn drain_before_deadline(
    now_us: u64,
    deadline_us: u64,
    bbr_in_startup: bool,
    bandwidth_bytes_per_sec: Option<u64>,
    bytes_in_flight: u64,
    queued_send_offset: u64,
    next_send_offset: u64,
    smoothed_rtt_us: u64,
) -> bool {
    if deadline_us < now_us {
        return false;
    }
    if bbr_in_startup {
        return true;
    }
    let Some(bandwidth) = bandwidth_bytes_per_sec.filter(|&b| b > 0) else {
        return true;
    };

    let transmission_delay_in_flight_us = (bytes_in_flight / bandwidth) * 1_000_000;
    let bytes_to_drain = queued_send_offset.saturating_sub(next_send_offset);
    let transmission_delay_to_drain_us = (bytes_to_drain / bandwidth) * 1_000_000;
    let total_delay_us =
        transmission_delay_in_flight_us + transmission_delay_to_drain_us + smoothed_rtt_us / 2;

    total_delay_us < deadline_us - now_us
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_cc_keeps_only_ack_and_close() {
        let flags = SendFlags { ack: true, ping: true, connection_close: true, ..Default::default() };
        let bypass = flags.bypass_cc();
        assert!(bypass.ack && bypass.connection_close);
        assert!(!bypass.ping);
    }

    #[test]
    fn allowed_in_handshake_drops_application_level_flags() {
        let flags = SendFlags { crypto: true, max_data: true, ..Default::default() };
        let allowed = flags.allowed_in_handshake();
        assert!(allowed.crypto);
        assert!(!allowed.max_data);
    }

    #[test]
    fn next_send_item_prefers_control_then_stream_then_pmtu() {
        assert_eq!(next_send_item(true, &[5], true), Some(SendItem::Control));
        assert_eq!(next_send_item(false, &[5], true), Some(SendItem::Stream(5)));
        assert_eq!(next_send_item(false, &[], true), Some(SendItem::PmtuProbe));
        assert_eq!(next_send_item(false, &[], false), None);
    }

    #[test]
    fn amplification_limit_caps_unvalidated_server_output() {
        assert_eq!(amplification_limit(1000, false), Some(3000));
        assert_eq!(amplification_limit(1000, true), None);
    }

    #[test]
    fn deadline_engine_rejects_past_deadlines() {
        assert!(!drain_before_deadline(100, 50, false, Some(1000), 0, 0, 0, 0));
    }

    #[test]
    fn deadline_engine_defaults_to_allow_without_bandwidth_estimate() {
        assert!(drain_before_deadline(0, 1000, false, None, 0, 0, 0, 0));
    }

    #[test]
    fn deadline_engine_bypasses_estimate_during_bbr_startup() {
        assert!(drain_before_deadline(0, 1, true, Some(1), u64::MAX, u64::MAX, 0, 0));
    }

    #[test]
    fn deadline_engine_admits_when_transmission_fits_before_deadline() {
        // 1000 bytes in flight + 1000 queued at 1_000_000 bytes/sec bandwidth
        // -> 1ms + 1ms = 2ms transmission delay, well under a 100ms deadline.
        assert!(drain_before_deadline(0, 100_000, false, Some(1_000_000), 1000, 1000, 0, 0));
    }

    #[test]
    fn deadline_engine_rejects_when_transmission_exceeds_deadline() {
        assert!(!drain_before_deadline(0, 500, false, Some(1_000_000), 1_000_000, 0, 0, 0));
    }
}
