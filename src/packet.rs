// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QUIC packet header parsing and building (RFC 9000 §17).
//!
//! Grounded on `original_source/src/core/packet.h`: the invariant header
//! (long-header bit + version + DCID) is parsed first to route the
//! datagram to a connection or the stateless path, then the
//! version-specific long/short header is parsed. Header protection
//! removal and AEAD are a [`crate::tls`] collaborator's job — this module
//! only handles the cleartext structural fields, matching the header's
//! own note that "the 4 least significant bits are protected by header
//! protection" (stripped before these functions run).

use crate::varint::{self, Cursor};

pub const QUIC_VERSION_1: u32 = 0x0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongHeaderType {
    fn from_bits(version: u32, bits: u8) -> Option<Self> {
        // Version 1 and the one other supported version use different
        // mappings of the 2-bit packet-type field (§core/packet.h).
        match (version, bits) {
            (QUIC_VERSION_1, 0) => Some(Self::Initial),
            (QUIC_VERSION_1, 1) => Some(Self::ZeroRtt),
            (QUIC_VERSION_1, 2) => Some(Self::Handshake),
            (QUIC_VERSION_1, 3) => Some(Self::Retry),
            _ => None,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::ZeroRtt => 1,
            Self::Handshake => 2,
            Self::Retry => 3,
        }
    }
}

/// The invariant prefix shared by every long-header packet, used to route
/// before version-specific parsing (§core/packet.h `QUIC_HEADER_INVARIANT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantHeader {
    pub is_long_header: bool,
    pub version: u32,
    pub dest_cid: Vec<u8>,
}

impl InvariantHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, &'static str> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.get_u8().ok_or("empty datagram")?;
        let is_long_header = first & 0x80 != 0;
        if !is_long_header {
            return Err("short header has no self-describing invariant beyond the first byte");
        }
        let version_bytes = cursor.get_bytes(4).ok_or("truncated version")?;
        let version = u32::from_be_bytes(version_bytes.try_into().unwrap());
        let dcid_len = cursor.get_u8().ok_or("truncated dcid length")? as usize;
        let dest_cid = cursor.get_bytes(dcid_len).ok_or("truncated dcid")?.to_vec();
        Ok(Self {
            is_long_header,
            version,
            dest_cid,
        })
    }
}

/// A parsed long-header packet (cleartext fields only; packet-number
/// decompression happens in [`crate::packet_number`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub packet_type: LongHeaderType,
    pub version: u32,
    pub dest_cid: Vec<u8>,
    pub src_cid: Vec<u8>,
    /// Initial packets only.
    pub token: Vec<u8>,
    /// Truncated packet number, `packet_number_len` bytes wide.
    pub packet_number: u32,
    pub packet_number_len: u8,
    /// Byte length of the packet-number field plus protected payload
    /// (the `Length` varint in Initial/0-RTT/Handshake packets).
    pub remainder_len: u64,
}

impl LongHeader {
    pub fn build_first_byte(packet_type: LongHeaderType, packet_number_len: u8) -> u8 {
        debug_assert!((1..=4).contains(&packet_number_len));
        0x80 | 0x40 | (packet_type.to_bits() << 4) | (packet_number_len - 1)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(Self::build_first_byte(self.packet_type, self.packet_number_len));
        out.extend_from_slice(&self.version.to_be_bytes());
        out.push(self.dest_cid.len() as u8);
        out.extend_from_slice(&self.dest_cid);
        out.push(self.src_cid.len() as u8);
        out.extend_from_slice(&self.src_cid);
        if self.packet_type == LongHeaderType::Initial {
            varint::encode(self.token.len() as u64, out);
            out.extend_from_slice(&self.token);
        }
        varint::encode(self.remainder_len, out);
        out.extend_from_slice(&self.packet_number.to_be_bytes()[4 - self.packet_number_len as usize..]);
    }

    /// Parse a long header whose first byte has already had header
    /// protection removed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), &'static str> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.get_u8().ok_or("empty datagram")?;
        if first & 0x80 == 0 {
            return Err("not a long header packet");
        }
        let version_bytes = cursor.get_bytes(4).ok_or("truncated version")?;
        let version = u32::from_be_bytes(version_bytes.try_into().unwrap());
        let type_bits = (first >> 4) & 0x3;
        let packet_type =
            LongHeaderType::from_bits(version, type_bits).ok_or("unrecognized long header type")?;
        let packet_number_len = (first & 0x3) + 1;

        let dcid_len = cursor.get_u8().ok_or("truncated dcid length")? as usize;
        let dest_cid = cursor.get_bytes(dcid_len).ok_or("truncated dcid")?.to_vec();
        let scid_len = cursor.get_u8().ok_or("truncated scid length")? as usize;
        let src_cid = cursor.get_bytes(scid_len).ok_or("truncated scid")?.to_vec();

        let token = if packet_type == LongHeaderType::Initial {
            let token_len = cursor.get_varint().ok_or("truncated token length")? as usize;
            cursor.get_bytes(token_len).ok_or("truncated token")?.to_vec()
        } else {
            Vec::new()
        };

        let remainder_len = cursor.get_varint().ok_or("truncated length field")?;
        let pn_bytes = cursor
            .get_bytes(packet_number_len as usize)
            .ok_or("truncated packet number")?;
        let mut pn_buf = [0u8; 4];
        pn_buf[4 - pn_bytes.len()..].copy_from_slice(pn_bytes);
        let packet_number = u32::from_be_bytes(pn_buf);

        Ok((
            Self {
                packet_type,
                version,
                dest_cid,
                src_cid,
                token,
                packet_number,
                packet_number_len,
                remainder_len,
            },
            cursor.position(),
        ))
    }
}

/// A parsed short-header (1-RTT) packet. `dest_cid` length is not
/// self-describing on the wire; the caller supplies it from the local
/// CID registry (§4.9 binding/lookup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub spin_bit: bool,
    pub key_phase: bool,
    pub dest_cid: Vec<u8>,
    pub packet_number: u32,
    pub packet_number_len: u8,
}

impl ShortHeader {
    pub fn build_first_byte(spin_bit: bool, key_phase: bool, packet_number_len: u8) -> u8 {
        debug_assert!((1..=4).contains(&packet_number_len));
        let mut b = 0x40; // fixed bit
        if spin_bit {
            b |= 0x20;
        }
        if key_phase {
            b |= 0x04;
        }
        b |= packet_number_len - 1;
        b
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(Self::build_first_byte(self.spin_bit, self.key_phase, self.packet_number_len));
        out.extend_from_slice(&self.dest_cid);
        out.extend_from_slice(
            &self.packet_number.to_be_bytes()[4 - self.packet_number_len as usize..],
        );
    }

    pub fn parse(buf: &[u8], dest_cid_len: usize) -> Result<(Self, usize), &'static str> {
        let mut cursor = Cursor::new(buf);
        let first = cursor.get_u8().ok_or("empty datagram")?;
        if first & 0x80 != 0 {
            return Err("not a short header packet");
        }
        let spin_bit = first & 0x20 != 0;
        let key_phase = first & 0x04 != 0;
        let packet_number_len = (first & 0x3) + 1;
        let dest_cid = cursor.get_bytes(dest_cid_len).ok_or("truncated dcid")?.to_vec();
        let pn_bytes = cursor
            .get_bytes(packet_number_len as usize)
            .ok_or("truncated packet number")?;
        let mut pn_buf = [0u8; 4];
        pn_buf[4 - pn_bytes.len()..].copy_from_slice(pn_bytes);
        let packet_number = u32::from_be_bytes(pn_buf);
        Ok((
            Self {
                spin_bit,
                key_phase,
                dest_cid,
                packet_number,
                packet_number_len,
            },
            cursor.position(),
        ))
    }
}

/// Outcome of the version-negotiation decision an endpoint makes on
/// receipt of an unsupported-version long header.
pub fn negotiate_version(supported: &[u32], offered: u32) -> bool {
    supported.contains(&offered)
}

/// Build a Version Negotiation packet body (§core/packet.h
/// `QUIC_VERSION_NEGOTIATION_PACKET`): echoes the client's CIDs back with
/// the server's supported version list, under a randomized first byte
/// (the long-header bit is the only meaningful bit; §17.2.1 requires the
/// rest be unpredictable so middleboxes don't key off it).
pub fn build_version_negotiation(
    first_byte_random: u8,
    dest_cid: &[u8],
    src_cid: &[u8],
    supported_versions: &[u32],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(first_byte_random | 0x80);
    out.extend_from_slice(&0u32.to_be_bytes()); // version 0 signals negotiation
    out.push(dest_cid.len() as u8);
    out.extend_from_slice(dest_cid);
    out.push(src_cid.len() as u8);
    out.extend_from_slice(src_cid);
    for v in supported_versions {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_header_round_trips() {
        let hdr = LongHeader {
            packet_type: LongHeaderType::Initial,
            version: QUIC_VERSION_1,
            dest_cid: vec![1, 2, 3, 4],
            src_cid: vec![5, 6],
            token: vec![],
            packet_number: 42,
            packet_number_len: 2,
            remainder_len: 20,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let (parsed, consumed) = LongHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn long_header_with_token_round_trips() {
        let hdr = LongHeader {
            packet_type: LongHeaderType::Initial,
            version: QUIC_VERSION_1,
            dest_cid: vec![9; 8],
            src_cid: vec![1; 8],
            token: b"retrytoken".to_vec(),
            packet_number: 1,
            packet_number_len: 1,
            remainder_len: 100,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let (parsed, _) = LongHeader::parse(&buf).unwrap();
        assert_eq!(parsed.token, b"retrytoken");
    }

    #[test]
    fn handshake_packet_carries_no_token() {
        let hdr = LongHeader {
            packet_type: LongHeaderType::Handshake,
            version: QUIC_VERSION_1,
            dest_cid: vec![1, 2],
            src_cid: vec![3, 4],
            token: vec![],
            packet_number: 7,
            packet_number_len: 1,
            remainder_len: 50,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let (parsed, _) = LongHeader::parse(&buf).unwrap();
        assert_eq!(parsed.packet_type, LongHeaderType::Handshake);
        assert!(parsed.token.is_empty());
    }

    #[test]
    fn short_header_round_trips_given_known_cid_len() {
        let hdr = ShortHeader {
            spin_bit: true,
            key_phase: false,
            dest_cid: vec![1, 2, 3, 4, 5, 6, 7, 8],
            packet_number: 1000,
            packet_number_len: 2,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let (parsed, consumed) = ShortHeader::parse(&buf, 8).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn invariant_header_extracts_dcid_before_version_specific_parse() {
        let hdr = LongHeader {
            packet_type: LongHeaderType::Initial,
            version: QUIC_VERSION_1,
            dest_cid: vec![0xaa, 0xbb],
            src_cid: vec![],
            token: vec![],
            packet_number: 0,
            packet_number_len: 1,
            remainder_len: 10,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        let inv = InvariantHeader::parse(&buf).unwrap();
        assert!(inv.is_long_header);
        assert_eq!(inv.version, QUIC_VERSION_1);
        assert_eq!(inv.dest_cid, vec![0xaa, 0xbb]);
    }

    #[test]
    fn unsupported_version_is_not_negotiated() {
        assert!(!negotiate_version(&[QUIC_VERSION_1], 0xdead_beef));
        assert!(negotiate_version(&[QUIC_VERSION_1], QUIC_VERSION_1));
    }

    #[test]
    fn version_negotiation_packet_echoes_cids() {
        let pkt = build_version_negotiation(0x55, &[1, 2], &[3, 4, 5], &[QUIC_VERSION_1]);
        assert_eq!(pkt[0] & 0x80, 0x80);
        assert_eq!(&pkt[1..5], &0u32.to_be_bytes());
        assert_eq!(pkt[5], 2);
        assert_eq!(&pkt[6..8], &[1, 2]);
    }
}
