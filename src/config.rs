// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-level tunables.
//!
//! Centralizes every numeric knob the rest of the crate reads so values
//! are never duplicated or hardcoded at call sites. Mirrors `QUIC_SETTINGS`
//! from the original implementation, collapsed into one `Settings` struct
//! constructed with `..Default::default()` overrides.

/// Stateless-retry key rotation interval, in milliseconds.
pub const DEFAULT_RETRY_KEY_ROTATION_MS: u64 = 60_000;

/// Minimum UDP payload size a QUIC endpoint must support (RFC 9000 §14).
pub const MIN_UDP_PAYLOAD_SIZE: u16 = 1200;

/// Maximum UDP payload size representable in a transport parameter.
pub const MAX_UDP_PAYLOAD_SIZE: u16 = 65527;

/// Packet-number reordering threshold before a packet is declared lost
/// (RFC 9002 §6.1.1, `kPacketThreshold`).
pub const DEFAULT_PACKET_THRESHOLD: u64 = 3;

/// Time-based loss threshold multiplier (RFC 9002 §6.1.2, `kTimeThreshold`
/// expressed as a 9/8 fraction applied to `max(srtt, latest_rtt)`).
pub const TIME_THRESHOLD_NUMERATOR: u64 = 9;
pub const TIME_THRESHOLD_DENOMINATOR: u64 = 8;

/// Multiplier of PTO defining the persistent congestion window
/// (RFC 9002 §7.6.1, `kPersistentCongestionThreshold`).
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Granularity floor used in PTO computation (RFC 9002 §6.2.1, `kGranularity`).
pub const GRANULARITY_US: u64 = 1_000;

/// Maximum number of frames coalesced into a single packet (§4.4).
pub const MAX_FRAMES_PER_PACKET: usize = 12;

/// Maximum number of header-protection operations batched per XOR call (§4.4).
pub const MAX_CRYPTO_BATCH_COUNT: usize = 16;

/// Maximum operations a worker drains for one connection before rotating
/// to the next connection in its set (§4.10).
pub const DEFAULT_MAX_OPERATIONS_PER_DRAIN: usize = 16;

/// Bound on deferred (keys-not-yet-available) packets retained per space,
/// see DESIGN.md "Open Question decisions".
pub const MAX_DEFERRED_PACKETS_PER_SPACE: usize = 32;

/// Maximum queued stateless operations (retry/version-neg/reset) per binding
/// before new datagrams requiring one are dropped (§4.9).
pub const MAX_STATELESS_OPERATIONS: usize = 256;

/// Smoothed per-connection queue delay above which a worker is considered
/// overloaded and stops taking new connections (§4.10, `MaxWorkerQueueDelayUs`).
pub const DEFAULT_MAX_WORKER_QUEUE_DELAY_US: u64 = 100_000;

/// Divisor applied to the connection-wide receive window: once the
/// high-water mark of received stream bytes crosses
/// `local_max_data / CONN_FLOW_CONTROL_DRAIN_RATIO`, a new `MAX_DATA` is
/// queued that doubles the window. Mirrors the per-stream auto-tuning
/// ratio the original implementation uses for `MAX_STREAM_DATA`.
pub const CONN_FLOW_CONTROL_DRAIN_RATIO: u64 = 2;

/// Connection-level tunables, analogous to `QUIC_SETTINGS`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Idle timeout, in milliseconds. `0` disables the idle timer.
    pub idle_timeout_ms: u64,
    /// Keep-alive interval, in milliseconds. `0` disables keep-alive.
    pub keep_alive_interval_ms: u64,
    /// Disconnect/draining linger, expressed as a PTO multiplier (§5).
    pub disconnect_timeout_pto_multiplier: u32,
    /// Local initial connection-wide flow-control window, in bytes.
    pub initial_max_data: u64,
    /// Local initial per-stream flow-control window, in bytes (applies
    /// uniformly to bidi-local/bidi-remote/uni for simplicity; a full
    /// implementation could split these).
    pub initial_max_stream_data: u64,
    /// Local initial max bidirectional streams the peer may open.
    pub initial_max_streams_bidi: u64,
    /// Local initial max unidirectional streams the peer may open.
    pub initial_max_streams_uni: u64,
    /// Maximum UDP payload this endpoint is willing to receive.
    pub max_udp_payload_size: u16,
    /// ACK delay exponent advertised to the peer (`<= 20`).
    pub ack_delay_exponent: u8,
    /// Maximum delay, in milliseconds, this endpoint will hold an
    /// ack-eliciting packet before sending an ACK (`<= 2^14 - 1`).
    pub max_ack_delay_ms: u16,
    /// Active connection-ID limit advertised to the peer (`>= 2`).
    pub active_connection_id_limit: u16,
    /// Initial congestion window, in bytes (RFC 9002 §B.3 default is
    /// `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`).
    pub initial_window_bytes: u64,
    /// Minimum congestion window, in bytes (RFC 9002 §B.3).
    pub minimum_window_bytes: u64,
    /// Reordering threshold before declaring a packet lost.
    pub packet_threshold: u64,
    /// Stateless-retry AEAD key rotation interval, in milliseconds.
    pub retry_key_rotation_ms: u64,
    /// Maximum operations drained per connection per worker pass.
    pub max_operations_per_drain: usize,
    /// Smoothed queue delay, in microseconds, above which a worker reports
    /// itself overloaded.
    pub max_worker_queue_delay_us: u64,
    /// Disable active migration (advertised transport parameter).
    pub disable_active_migration: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            keep_alive_interval_ms: 0,
            disconnect_timeout_pto_multiplier: 3,
            initial_max_data: 1 << 20,
            initial_max_stream_data: 1 << 18,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_udp_payload_size: MAX_UDP_PAYLOAD_SIZE,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            active_connection_id_limit: 4,
            initial_window_bytes: 14_720,
            minimum_window_bytes: 2 * 1200,
            packet_threshold: DEFAULT_PACKET_THRESHOLD,
            retry_key_rotation_ms: DEFAULT_RETRY_KEY_ROTATION_MS,
            max_operations_per_drain: DEFAULT_MAX_OPERATIONS_PER_DRAIN,
            max_worker_queue_delay_us: DEFAULT_MAX_WORKER_QUEUE_DELAY_US,
            disable_active_migration: false,
        }
    }
}

impl Settings {
    /// Validate the cross-field bounds named in the transport-parameter
    /// table (§6). Returns the first violated bound, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_udp_payload_size < MIN_UDP_PAYLOAD_SIZE {
            return Err("max_udp_payload_size below RFC 9000 minimum (1200)");
        }
        if self.ack_delay_exponent > 20 {
            return Err("ack_delay_exponent exceeds 20");
        }
        if self.max_ack_delay_ms > 0x3FFF {
            return Err("max_ack_delay_ms exceeds 2^14 - 1");
        }
        if self.active_connection_id_limit < 2 {
            return Err("active_connection_id_limit must be >= 2");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_undersized_udp_payload() {
        let mut s = Settings::default();
        s.max_udp_payload_size = 1199;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_oversized_ack_delay_exponent() {
        let mut s = Settings::default();
        s.ack_delay_exponent = 21;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_small_active_cid_limit() {
        let mut s = Settings::default();
        s.active_connection_id_limit = 1;
        assert!(s.validate().is_err());
    }
}
