// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pluggable congestion control.
//!
//! Grounded on `original_source/src/core/congestion_control.h`'s
//! `QUIC_CONGESTION_CONTROL` vtable: a fixed dispatch surface the send
//! path calls into without caring which algorithm is behind it. A Rust
//! trait replaces the C struct-of-function-pointers directly — no `Ctx`
//! byte buffer is needed since each implementation just owns its state.

pub mod cubic;
#[cfg(feature = "bbr")]
pub mod bbr;

/// One congestion-control algorithm's view of a single path.
///
/// Every method corresponds 1:1 to an entry in the original vtable.
/// Byte counts and packet numbers mirror the wire types; `now_us` and
/// `smoothed_rtt_us` are always microseconds, matching
/// [`crate::loss_detection::RttEstimator`].
pub trait CongestionController {
    fn name(&self) -> &'static str;

    /// `true` if the congestion window has room for more in-flight bytes.
    fn can_send(&self) -> bool;

    /// Grant a temporary allowance of `num_packets` sendable even if the
    /// window is otherwise exhausted (used for PTO probes).
    fn set_exemption(&mut self, num_packets: u8);

    fn get_exemptions(&self) -> u8;

    fn reset(&mut self, initial_window_bytes: u64);

    /// Bytes sendable right now, `0` if the window and any exemption are
    /// exhausted. `time_since_last_send_us` is `None` before the first
    /// packet of a burst to avoid pacing penalizing idle-then-burst.
    fn get_send_allowance(&self, time_since_last_send_us: Option<u64>) -> u64;

    fn on_data_sent(&mut self, num_retransmittable_bytes: u32);

    /// Data removed from in-flight accounting without being lost or
    /// acked (e.g. a probe packet superseded before it could be judged).
    /// Returns `true` if this changes whether [`can_send`] would answer
    /// differently.
    ///
    /// [`can_send`]: CongestionController::can_send
    fn on_data_invalidated(&mut self, num_retransmittable_bytes: u32) -> bool;

    /// Returns `true` if the acknowledgment moves the controller out of
    /// recovery.
    fn on_data_acknowledged(
        &mut self,
        now_us: u64,
        largest_packet_number_acked: u64,
        num_retransmittable_bytes: u32,
        smoothed_rtt_us: u64,
    ) -> bool;

    fn on_data_lost(
        &mut self,
        largest_packet_number_lost: u64,
        largest_packet_number_sent: u64,
        num_retransmittable_bytes: u32,
        persistent_congestion: bool,
    );

    /// A congestion event is reversed because everything considered
    /// lost during it was actually acknowledged later (spurious loss).
    fn on_spurious_congestion_event(&mut self);

    fn congestion_window(&self) -> u64;
    fn bytes_in_flight(&self) -> u64;
    fn bytes_in_flight_max(&self) -> u64;
}
