// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QUIC transport parameters TLV codec (RFC 9000 §18.2).
//!
//! Grounded on `original_source/src/core/transport_params.h`: the wire
//! format is `{varint id}{varint length}{value}` repeated, carried inside
//! the TLS handshake as an extension. The C struct uses a `Flags` bitmask
//! to track which optional fields are present; we use `Option<T>` fields
//! instead, which is the idiomatic Rust equivalent and removes an entire
//! class of "flag set but field never written" bugs.

use crate::varint::{self, Cursor};

/// Parameter id values (RFC 9000 §18.2).
mod id {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
    pub const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
}

/// Max value of a `MAX_STREAMS` frame or transport parameter (largest
/// stream count expressible as a varint-encoded stream id).
pub const MAX_STREAMS_MAX: u64 = (1u64 << 60) - 1;

/// Negotiated/advertised transport parameters. Server-only fields
/// (`preferred_address` is intentionally omitted; out of scope per the
/// connection-migration Non-goal) use `Option`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<Vec<u8>>,
    pub max_idle_timeout: Option<u64>,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    pub max_ack_delay: Option<u64>,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: Option<u64>,
    pub initial_source_connection_id: Option<Vec<u8>>,
    pub retry_source_connection_id: Option<Vec<u8>>,
}

fn put_varint_param(out: &mut Vec<u8>, param_id: u64, value: u64) {
    varint::encode(param_id, out);
    varint::encode(varint::encoded_len(value) as u64, out);
    varint::encode(value, out);
}

fn put_bytes_param(out: &mut Vec<u8>, param_id: u64, bytes: &[u8]) {
    varint::encode(param_id, out);
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn put_empty_param(out: &mut Vec<u8>, param_id: u64) {
    varint::encode(param_id, out);
    varint::encode(0, out);
}

impl TransportParameters {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(v) = &self.original_destination_connection_id {
            put_bytes_param(&mut out, id::ORIGINAL_DESTINATION_CONNECTION_ID, v);
        }
        if let Some(v) = self.max_idle_timeout {
            put_varint_param(&mut out, id::MAX_IDLE_TIMEOUT, v);
        }
        if let Some(v) = &self.stateless_reset_token {
            put_bytes_param(&mut out, id::STATELESS_RESET_TOKEN, v);
        }
        if let Some(v) = self.max_udp_payload_size {
            put_varint_param(&mut out, id::MAX_UDP_PAYLOAD_SIZE, v);
        }
        if let Some(v) = self.initial_max_data {
            put_varint_param(&mut out, id::INITIAL_MAX_DATA, v);
        }
        if let Some(v) = self.initial_max_stream_data_bidi_local {
            put_varint_param(&mut out, id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, v);
        }
        if let Some(v) = self.initial_max_stream_data_bidi_remote {
            put_varint_param(&mut out, id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, v);
        }
        if let Some(v) = self.initial_max_stream_data_uni {
            put_varint_param(&mut out, id::INITIAL_MAX_STREAM_DATA_UNI, v);
        }
        if let Some(v) = self.initial_max_streams_bidi {
            put_varint_param(&mut out, id::INITIAL_MAX_STREAMS_BIDI, v);
        }
        if let Some(v) = self.initial_max_streams_uni {
            put_varint_param(&mut out, id::INITIAL_MAX_STREAMS_UNI, v);
        }
        if let Some(v) = self.ack_delay_exponent {
            put_varint_param(&mut out, id::ACK_DELAY_EXPONENT, v);
        }
        if let Some(v) = self.max_ack_delay {
            put_varint_param(&mut out, id::MAX_ACK_DELAY, v);
        }
        if self.disable_active_migration {
            put_empty_param(&mut out, id::DISABLE_ACTIVE_MIGRATION);
        }
        if let Some(v) = self.active_connection_id_limit {
            put_varint_param(&mut out, id::ACTIVE_CONNECTION_ID_LIMIT, v);
        }
        if let Some(v) = &self.initial_source_connection_id {
            put_bytes_param(&mut out, id::INITIAL_SOURCE_CONNECTION_ID, v);
        }
        if let Some(v) = &self.retry_source_connection_id {
            put_bytes_param(&mut out, id::RETRY_SOURCE_CONNECTION_ID, v);
        }
        out
    }

    /// Decode a TLV sequence. Unrecognized parameter ids are skipped per
    /// RFC 9000 §18.1 ("MUST ignore an unknown transport parameter").
    pub fn decode(buf: &[u8]) -> Result<Self, &'static str> {
        let mut tp = TransportParameters::default();
        let mut cursor = Cursor::new(buf);
        while !cursor.is_empty() {
            let param_id = cursor.get_varint().ok_or("truncated parameter id")?;
            let len = cursor.get_varint().ok_or("truncated parameter length")? as usize;
            let value = cursor.get_bytes(len).ok_or("truncated parameter value")?;
            match param_id {
                id::ORIGINAL_DESTINATION_CONNECTION_ID => {
                    tp.original_destination_connection_id = Some(value.to_vec());
                }
                id::MAX_IDLE_TIMEOUT => tp.max_idle_timeout = Some(decode_varint_param(value)?),
                id::STATELESS_RESET_TOKEN => {
                    let token: [u8; 16] = value.try_into().map_err(|_| "bad reset token length")?;
                    tp.stateless_reset_token = Some(token);
                }
                id::MAX_UDP_PAYLOAD_SIZE => {
                    tp.max_udp_payload_size = Some(decode_varint_param(value)?)
                }
                id::INITIAL_MAX_DATA => tp.initial_max_data = Some(decode_varint_param(value)?),
                id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    tp.initial_max_stream_data_bidi_local = Some(decode_varint_param(value)?)
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    tp.initial_max_stream_data_bidi_remote = Some(decode_varint_param(value)?)
                }
                id::INITIAL_MAX_STREAM_DATA_UNI => {
                    tp.initial_max_stream_data_uni = Some(decode_varint_param(value)?)
                }
                id::INITIAL_MAX_STREAMS_BIDI => {
                    let v = decode_varint_param(value)?;
                    if v > MAX_STREAMS_MAX {
                        return Err("initial_max_streams_bidi exceeds MAX_STREAMS_MAX");
                    }
                    tp.initial_max_streams_bidi = Some(v);
                }
                id::INITIAL_MAX_STREAMS_UNI => {
                    let v = decode_varint_param(value)?;
                    if v > MAX_STREAMS_MAX {
                        return Err("initial_max_streams_uni exceeds MAX_STREAMS_MAX");
                    }
                    tp.initial_max_streams_uni = Some(v);
                }
                id::ACK_DELAY_EXPONENT => {
                    let v = decode_varint_param(value)?;
                    if v > 20 {
                        return Err("ack_delay_exponent exceeds 20");
                    }
                    tp.ack_delay_exponent = Some(v);
                }
                id::MAX_ACK_DELAY => {
                    let v = decode_varint_param(value)?;
                    if v > (1 << 14) - 1 {
                        return Err("max_ack_delay exceeds 2^14 - 1");
                    }
                    tp.max_ack_delay = Some(v);
                }
                id::DISABLE_ACTIVE_MIGRATION => tp.disable_active_migration = true,
                id::ACTIVE_CONNECTION_ID_LIMIT => {
                    let v = decode_varint_param(value)?;
                    if v < 2 {
                        return Err("active_connection_id_limit below minimum of 2");
                    }
                    tp.active_connection_id_limit = Some(v);
                }
                id::INITIAL_SOURCE_CONNECTION_ID => {
                    tp.initial_source_connection_id = Some(value.to_vec());
                }
                id::RETRY_SOURCE_CONNECTION_ID => {
                    tp.retry_source_connection_id = Some(value.to_vec());
                }
                _ => {} // unknown parameter: ignore per RFC 9000 §18.1
            }
        }
        Ok(tp)
    }
}

fn decode_varint_param(value: &[u8]) -> Result<u64, &'static str> {
    let (v, consumed) = varint::decode(value).ok_or("empty varint parameter")?;
    if consumed != value.len() {
        return Err("trailing bytes after varint parameter value");
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_typical_client_parameters() {
        let tp = TransportParameters {
            max_idle_timeout: Some(30_000),
            initial_max_data: Some(1 << 20),
            initial_max_stream_data_bidi_local: Some(1 << 16),
            initial_max_streams_bidi: Some(100),
            ack_delay_exponent: Some(3),
            active_connection_id_limit: Some(4),
            initial_source_connection_id: Some(vec![1, 2, 3, 4]),
            ..Default::default()
        };
        let encoded = tp.encode();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert_eq!(tp, decoded);
    }

    #[test]
    fn disable_active_migration_round_trips_as_empty_value() {
        let tp = TransportParameters {
            disable_active_migration: true,
            ..Default::default()
        };
        let encoded = tp.encode();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert!(decoded.disable_active_migration);
    }

    #[test]
    fn unknown_parameter_id_is_skipped_not_rejected() {
        let mut buf = Vec::new();
        varint::encode(0xBEEF, &mut buf); // unrecognized id
        varint::encode(3, &mut buf);
        buf.extend_from_slice(b"abc");
        varint::encode(id::MAX_IDLE_TIMEOUT as u64, &mut buf);
        varint::encode(2, &mut buf);
        varint::encode(5000, &mut buf);
        let decoded = TransportParameters::decode(&buf).unwrap();
        assert_eq!(decoded.max_idle_timeout, Some(5000));
    }

    #[test]
    fn rejects_ack_delay_exponent_above_20() {
        let mut buf = Vec::new();
        varint::encode(id::ACK_DELAY_EXPONENT as u64, &mut buf);
        varint::encode(1, &mut buf);
        varint::encode(21, &mut buf);
        assert!(TransportParameters::decode(&buf).is_err());
    }

    #[test]
    fn rejects_active_cid_limit_below_two() {
        let mut buf = Vec::new();
        varint::encode(id::ACTIVE_CONNECTION_ID_LIMIT as u64, &mut buf);
        varint::encode(1, &mut buf);
        varint::encode(1, &mut buf);
        assert!(TransportParameters::decode(&buf).is_err());
    }

    #[test]
    fn rejects_truncated_value() {
        let mut buf = Vec::new();
        varint::encode(id::INITIAL_MAX_DATA as u64, &mut buf);
        varint::encode(4, &mut buf); // claims 4 bytes
        buf.push(0); // only supplies 1
        assert!(TransportParameters::decode(&buf).is_err());
    }
}
