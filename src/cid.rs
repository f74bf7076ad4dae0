// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection ID generation, flags, and source/destination list entries.
//!
//! Grounded on `original_source/src/core/cid.h`. A generated CID is laid
//! out `[server_id_prefix][partition_id: 2 bytes][random payload: 7 bytes]`
//! so that a partitioned binding (§4.9) can route purely by inspecting
//! fixed byte offsets without a full lookup-table hit.

use rand::RngCore;

pub const MAX_CID_SID_LENGTH: usize = 5;
pub const CID_PID_LENGTH: usize = 2;
pub const CID_PAYLOAD_LENGTH: usize = 7;
pub const CID_MIN_RANDOM_BYTES: usize = 4;
pub const CID_MIN_LENGTH: usize = CID_PID_LENGTH + CID_PAYLOAD_LENGTH;
pub const CID_MAX_LENGTH: usize = MAX_CID_SID_LENGTH + CID_PID_LENGTH + CID_PAYLOAD_LENGTH;

/// Largest app-configurable server-id prefix that still leaves
/// [`CID_MIN_RANDOM_BYTES`] of randomness in the payload (§9 open question
/// 1, see DESIGN.md).
pub const CID_MAX_APP_PREFIX: usize = CID_PAYLOAD_LENGTH - CID_MIN_RANDOM_BYTES;

const _: () = assert!(CID_MAX_APP_PREFIX + CID_MIN_RANDOM_BYTES == CID_PAYLOAD_LENGTH);

pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

/// Maximum number of collisions tolerated before CID generation gives up
/// and returns an error to the caller.
pub const CID_MAX_COLLISION_RETRY: u32 = 8;

/// Flags tracked per connection ID, mirroring the bitfield in
/// `QUIC_CID` (split into `bool`s; there is no packing benefit in Rust
/// and packing would cost readability).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CidFlags {
    /// This is the CID the client used in its first Initial packet.
    pub is_initial: bool,
    /// Needs to be announced via `NEW_CONNECTION_ID`/`RETIRE_CONNECTION_ID`.
    pub needs_to_send: bool,
    /// Source CID: peer has acked our `NEW_CONNECTION_ID` for this entry.
    pub acknowledged: bool,
    /// Destination CID: bound to a path, unavailable for others.
    pub used_locally: bool,
    /// Source CID: peer has sent a packet using this CID.
    pub used_by_peer: bool,
    /// Source: queued for retirement. Destination: already retired locally.
    pub retired: bool,
    /// Destination CID: carries a stateless reset token from the peer.
    pub has_reset_token: bool,
    /// Source CID: currently registered in the binding's lookup table.
    pub is_in_lookup_table: bool,
}

/// A single connection ID plus its lifecycle flags and sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionId {
    pub sequence_number: u64,
    pub data: Vec<u8>,
    pub flags: CidFlags,
    /// Present only for destination CIDs carrying a peer-issued reset token.
    pub reset_token: Option<[u8; STATELESS_RESET_TOKEN_LENGTH]>,
}

impl ConnectionId {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The 2-byte partition id embedded at a fixed offset after the server
    /// prefix, used by the binding's routing table (§4.9). Returns `None`
    /// if `data` is shorter than [`CID_PID_LENGTH`] + `prefix_len`.
    pub fn partition_id(&self, prefix_len: usize) -> Option<u16> {
        let start = prefix_len;
        let end = start + CID_PID_LENGTH;
        if self.data.len() < end {
            return None;
        }
        Some(u16::from_be_bytes([self.data[start], self.data[end - 1]]))
    }
}

/// Generates connection IDs for this endpoint: a fixed server-id prefix
/// (at most [`CID_MAX_APP_PREFIX`] bytes) followed by a partition id and
/// a random payload.
pub struct CidGenerator {
    prefix: Vec<u8>,
    partition_id: u16,
}

impl CidGenerator {
    /// `prefix` is truncated to [`CID_MAX_APP_PREFIX`] bytes if longer,
    /// mirroring the original's silent clamp rather than an error — the
    /// prefix is a routing hint, not a protocol-critical value.
    pub fn new(mut prefix: Vec<u8>, partition_id: u16) -> Self {
        prefix.truncate(CID_MAX_APP_PREFIX);
        Self {
            prefix,
            partition_id,
        }
    }

    pub fn generate(&self, sequence_number: u64) -> ConnectionId {
        let mut data = Vec::with_capacity(self.prefix.len() + CID_PID_LENGTH + CID_PAYLOAD_LENGTH);
        data.extend_from_slice(&self.prefix);
        data.extend_from_slice(&self.partition_id.to_be_bytes());
        let mut random = [0u8; CID_PAYLOAD_LENGTH];
        rand::thread_rng().fill_bytes(&mut random);
        data.extend_from_slice(&random);
        ConnectionId {
            sequence_number,
            data,
            flags: CidFlags::default(),
            reset_token: None,
        }
    }

    /// Generate a CID that has not collided with anything in `existing`,
    /// retrying up to [`CID_MAX_COLLISION_RETRY`] times.
    pub fn generate_unique(
        &self,
        sequence_number: u64,
        existing: &[ConnectionId],
    ) -> Option<ConnectionId> {
        for _ in 0..CID_MAX_COLLISION_RETRY {
            let candidate = self.generate(sequence_number);
            if !existing.iter().any(|c| c.data == candidate.data) {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_app_prefix_leaves_minimum_randomness() {
        assert_eq!(CID_MAX_APP_PREFIX, 3);
    }

    #[test]
    fn generator_clamps_oversized_prefix() {
        let gen = CidGenerator::new(vec![1, 2, 3, 4, 5, 6], 7);
        let cid = gen.generate(0);
        assert_eq!(cid.len(), CID_MAX_APP_PREFIX + CID_PID_LENGTH + CID_PAYLOAD_LENGTH);
    }

    #[test]
    fn generated_cid_is_within_min_max_length() {
        let gen = CidGenerator::new(vec![9, 9], 42);
        let cid = gen.generate(0);
        assert!(cid.len() >= CID_MIN_LENGTH);
        assert!(cid.len() <= CID_MAX_LENGTH);
    }

    #[test]
    fn partition_id_round_trips_through_generated_cid() {
        let prefix = vec![1, 2];
        let gen = CidGenerator::new(prefix.clone(), 0xBEEF);
        let cid = gen.generate(0);
        assert_eq!(cid.partition_id(prefix.len()), Some(0xBEEF));
    }

    #[test]
    fn generate_unique_avoids_existing_collisions() {
        let gen = CidGenerator::new(vec![], 1);
        let first = gen.generate(0);
        let existing = vec![first.clone()];
        let second = gen.generate_unique(1, &existing).unwrap();
        assert_ne!(first.data, second.data);
    }
}
