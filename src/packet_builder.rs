// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Assembles frames into encrypted, header-protected QUIC packets and
//! coalesces them into one UDP datagram.
//!
//! Grounded on `original_source/src/core/packet_builder.h`: one builder
//! instance accumulates a single in-progress packet's payload bytes plus
//! its [`SentPacketMetadata`], and tracks a running datagram buffer that
//! several packets (Initial, Handshake, 1-RTT) can coalesce into before
//! being handed to the transport. The `CipherBatch`/`HpMask` batching
//! fields in the original are a fixed-size stack buffer feeding one XOR
//! call across several packet headers; `pending_headers` below is the
//! Rust equivalent, a `Vec` of header byte ranges collected until
//! [`MAX_CRYPTO_BATCH_COUNT`] is reached or the datagram flushes.
//!
//! A long header's `Length` field must be known before the header itself
//! is encoded (it covers the packet-number field plus the encrypted
//! payload), so frames are first collected into a scratch `payload`
//! buffer; only at [`PacketBuilder::finalize_packet`] is the real header
//! encoded, once the sealed payload length is known.

use crate::cid::ConnectionId;
use crate::config::{MAX_CRYPTO_BATCH_COUNT, MAX_FRAMES_PER_PACKET, MIN_UDP_PAYLOAD_SIZE};
use crate::error::QuicoreError;
use crate::frame::Frame;
use crate::packet::{LongHeader, LongHeaderType, ShortHeader};
use crate::packet_number::EncryptLevel;
use crate::sent_packet::{SentFrame, SentPacketFlags, SentPacketMetadata};
use crate::tls::TlsEngine;

enum HeaderKind {
    Long { packet_type: LongHeaderType, version: u32, token: Vec<u8> },
    Short { spin_bit: bool, key_phase: bool },
}

/// A header byte range within [`PacketBuilder::datagram`] still needing
/// header protection applied, batched up to `MAX_CRYPTO_BATCH_COUNT`.
struct PendingHeader {
    packet_start: usize,
    pn_offset: usize,
    pn_len: usize,
    level: EncryptLevel,
    sample_offset: usize,
}

struct CurrentPacket {
    level: EncryptLevel,
    packet_number: u64,
    packet_number_len: u8,
    header_kind: HeaderKind,
    payload: Vec<u8>,
    metadata: SentPacketMetadata,
}

pub struct PacketBuilder {
    dest_cid: ConnectionId,
    src_cid: ConnectionId,
    max_udp_payload_size: u16,
    is_client_initial_flight: bool,

    /// Bytes of the datagram assembled so far (may hold >1 coalesced packet).
    datagram: Vec<u8>,
    pending_headers: Vec<PendingHeader>,
    total_datagrams_sent: u32,
    total_bytes_sent: u64,

    current: Option<CurrentPacket>,
}

impl PacketBuilder {
    pub fn new(
        dest_cid: ConnectionId,
        src_cid: ConnectionId,
        max_udp_payload_size: u16,
        is_client_initial_flight: bool,
    ) -> Self {
        Self {
            dest_cid,
            src_cid,
            max_udp_payload_size,
            is_client_initial_flight,
            datagram: Vec::with_capacity(max_udp_payload_size as usize),
            pending_headers: Vec::new(),
            total_datagrams_sent: 0,
            total_bytes_sent: 0,
            current: None,
        }
    }

    pub fn has_open_packet(&self) -> bool {
        self.current.is_some()
    }

    fn header_len_estimate(&self, header_kind: &HeaderKind, packet_number_len: u8) -> usize {
        match header_kind {
            HeaderKind::Long { token, .. } => {
                1 + 4 + 1 + self.dest_cid.len() + 1 + self.src_cid.len()
                    + if matches!(header_kind, HeaderKind::Long { packet_type: LongHeaderType::Initial, .. }) {
                        2 + token.len()
                    } else {
                        0
                    }
                    + 2 // Length varint, worst case small
                    + packet_number_len as usize
            }
            HeaderKind::Short { .. } => 1 + self.dest_cid.len() + packet_number_len as usize,
        }
    }

    /// Remaining room for payload bytes in the current packet, leaving
    /// space for the header and the AEAD tag. Exposed at crate visibility
    /// so the connection's send loop can size stream/crypto chunks before
    /// framing them, rather than discovering the limit only via
    /// [`Self::can_add_frame`] after the bytes are already taken from a
    /// stream's send buffer.
    pub(crate) fn remaining_payload_space(&self, aead_overhead: usize) -> usize {
        let Some(current) = &self.current else { return 0 };
        let header_len = self.header_len_estimate(&current.header_kind, current.packet_number_len);
        (self.max_udp_payload_size as usize)
            .saturating_sub(self.datagram.len())
            .saturating_sub(header_len)
            .saturating_sub(aead_overhead)
            .saturating_sub(current.payload.len())
    }

    /// Starts a new packet at `level`. `token` is only meaningful for
    /// Initial packets; `spin_bit`/`key_phase` only for 1-RTT.
    pub fn prepare(
        &mut self,
        level: EncryptLevel,
        packet_number: u64,
        packet_number_len: u8,
        version: u32,
        token: Vec<u8>,
        spin_bit: bool,
        key_phase: bool,
    ) -> Result<(), QuicoreError> {
        if self.current.is_some() {
            return Err(QuicoreError::Internal {
                context: "prepare called with a packet already open",
            });
        }
        let header_kind = match level {
            EncryptLevel::Initial => HeaderKind::Long {
                packet_type: LongHeaderType::Initial,
                version,
                token,
            },
            EncryptLevel::Handshake => HeaderKind::Long {
                packet_type: LongHeaderType::Handshake,
                version,
                token: Vec::new(),
            },
            EncryptLevel::OneRtt => HeaderKind::Short { spin_bit, key_phase },
        };

        self.current = Some(CurrentPacket {
            level,
            packet_number,
            packet_number_len,
            header_kind,
            payload: Vec::new(),
            metadata: SentPacketMetadata::new(
                packet_number,
                0,
                0,
                SentPacketFlags {
                    key_level: level,
                    is_ack_eliciting: false,
                    is_mtu_probe: false,
                    key_phase,
                    suspected_lost: false,
                },
            ),
        });
        Ok(())
    }

    /// `true` if the current packet has room for another frame of
    /// `encoded_len` bytes (assuming 16-byte AEAD overhead) and hasn't
    /// hit the per-packet frame cap.
    pub fn can_add_frame(&self, encoded_len: usize) -> bool {
        let Some(current) = &self.current else { return false };
        current.metadata.can_add_frame() && encoded_len <= self.remaining_payload_space(16)
    }

    /// Appends `frame`'s wire bytes to the current packet's payload and
    /// records `sent_frame` in its metadata for retransmission on loss.
    /// Returns `true` once the packet has reached [`MAX_FRAMES_PER_PACKET`].
    pub fn add_frame(
        &mut self,
        frame: Frame,
        sent_frame: SentFrame,
        is_ack_eliciting: bool,
    ) -> Result<bool, QuicoreError> {
        let mut encoded = Vec::new();
        frame.encode(&mut encoded);
        if !self.can_add_frame(encoded.len()) {
            return Err(QuicoreError::ResourceExhausted {
                context: "packet has no room for another frame",
            });
        }
        let current = self.current.as_mut().ok_or(QuicoreError::Internal {
            context: "add_frame called with no packet open",
        })?;
        current.payload.extend_from_slice(&encoded);
        current.metadata.flags.is_ack_eliciting |= is_ack_eliciting;
        current.metadata.push_frame(sent_frame);
        Ok(current.metadata.frames.len() >= MAX_FRAMES_PER_PACKET)
    }

    /// Finishes the current packet: pads it to the minimum UDP payload
    /// if this is the last packet of a client's first datagram (§4.4),
    /// encodes the real header now that the sealed length is known,
    /// seals the payload, and queues the header for batched protection.
    pub fn finalize_packet(
        &mut self,
        tls: &dyn TlsEngine,
        sent_time_us: u64,
        is_last_packet_in_first_datagram: bool,
    ) -> Result<SentPacketMetadata, QuicoreError> {
        let mut current = self.current.take().ok_or(QuicoreError::Internal {
            context: "finalize_packet called with no packet open",
        })?;

        if self.is_client_initial_flight && is_last_packet_in_first_datagram {
            let target_total = MIN_UDP_PAYLOAD_SIZE as usize;
            let header_len = self.header_len_estimate(&current.header_kind, current.packet_number_len);
            let so_far = self.datagram.len() + header_len + current.payload.len() + tls.aead_overhead();
            if so_far < target_total {
                current.payload.resize(current.payload.len() + (target_total - so_far), 0);
            }
        }

        let packet_start = self.datagram.len();
        let remainder_len = (current.payload.len() + tls.aead_overhead() + current.packet_number_len as usize) as u64;

        let header_bytes = match &current.header_kind {
            HeaderKind::Long { packet_type, version, token } => {
                let header = LongHeader {
                    packet_type: *packet_type,
                    version: *version,
                    dest_cid: self.dest_cid.data.clone(),
                    src_cid: self.src_cid.data.clone(),
                    token: token.clone(),
                    packet_number: current.packet_number as u32,
                    packet_number_len: current.packet_number_len,
                    remainder_len,
                };
                let mut buf = Vec::new();
                header.encode(&mut buf);
                buf
            }
            HeaderKind::Short { spin_bit, key_phase } => {
                let header = ShortHeader {
                    spin_bit: *spin_bit,
                    key_phase: *key_phase,
                    dest_cid: self.dest_cid.data.clone(),
                    packet_number: current.packet_number as u32,
                    packet_number_len: current.packet_number_len,
                };
                let mut buf = Vec::new();
                header.encode(&mut buf);
                buf
            }
        };
        let header_len = header_bytes.len();
        self.datagram.extend_from_slice(&header_bytes);

        let mut payload = current.payload;
        tls.seal(current.level, current.packet_number, &header_bytes, &mut payload)?;
        self.datagram.extend_from_slice(&payload);

        current.metadata.packet_length = (header_len + payload.len()) as u16;
        current.metadata.sent_time_us = sent_time_us;

        let pn_offset = packet_start + header_len - current.packet_number_len as usize;
        self.pending_headers.push(PendingHeader {
            packet_start,
            pn_offset,
            pn_len: current.packet_number_len as usize,
            level: current.level,
            sample_offset: pn_offset + 4,
        });

        self.total_bytes_sent += current.metadata.packet_length as u64;
        Ok(current.metadata)
    }

    /// Applies batched header protection to every packet queued since
    /// the last flush and returns the finished datagram, or `None` if
    /// there's nothing to flush yet (`flush_batch` mirrors
    /// `QuicPacketBuilderFinalize`'s `FlushBatchedDatagrams`: once the
    /// batch reaches [`MAX_CRYPTO_BATCH_COUNT`] headers it must flush
    /// regardless of caller intent).
    pub fn flush(&mut self, tls: &dyn TlsEngine, flush_batch: bool) -> Option<Vec<u8>> {
        if !flush_batch && self.pending_headers.len() < MAX_CRYPTO_BATCH_COUNT {
            return None;
        }
        if self.datagram.is_empty() {
            return None;
        }

        for pending in self.pending_headers.drain(..) {
            let sample = if pending.sample_offset + 16 <= self.datagram.len() {
                self.datagram[pending.sample_offset..pending.sample_offset + 16].to_vec()
            } else {
                vec![0u8; 16]
            };
            let mask = tls.header_protection_mask(pending.level, &sample);
            self.datagram[pending.packet_start] ^= mask[0] & 0x0f;
            for i in 0..pending.pn_len {
                self.datagram[pending.pn_offset + i] ^= mask[1 + i];
            }
        }

        self.total_datagrams_sent += 1;
        Some(std::mem::replace(
            &mut self.datagram,
            Vec::with_capacity(self.max_udp_payload_size as usize),
        ))
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_datagrams_sent(&self) -> u32 {
        self.total_datagrams_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::tls::NullTlsEngine;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId {
            sequence_number: 0,
            data: bytes.to_vec(),
            flags: Default::default(),
            reset_token: None,
        }
    }

    #[test]
    fn builds_and_finalizes_a_single_short_header_packet() {
        let mut builder = PacketBuilder::new(cid(&[1, 2, 3, 4]), cid(&[9, 9]), 1200, false);
        builder
            .prepare(EncryptLevel::OneRtt, 0, 1, 1, Vec::new(), false, false)
            .unwrap();
        let full = builder.add_frame(Frame::Ping, SentFrame::Ping, true).unwrap();
        assert!(!full);
        let tls = NullTlsEngine::new();
        let meta = builder.finalize_packet(&tls, 1000, false).unwrap();
        assert!(meta.flags.is_ack_eliciting);
        assert_eq!(meta.frames.len(), 1);

        let datagram = builder.flush(&tls, true).unwrap();
        assert!(!datagram.is_empty());
    }

    #[test]
    fn client_initial_flight_pads_last_packet_to_minimum_udp_payload() {
        let mut builder = PacketBuilder::new(cid(&[1, 2, 3, 4]), cid(&[9, 9]), 1452, true);
        builder
            .prepare(EncryptLevel::Initial, 0, 1, 1, Vec::new(), false, false)
            .unwrap();
        builder.add_frame(Frame::Ping, SentFrame::Ping, true).unwrap();
        let tls = NullTlsEngine::new();
        builder.finalize_packet(&tls, 1000, true).unwrap();
        let datagram = builder.flush(&tls, true).unwrap();
        assert!(datagram.len() >= MIN_UDP_PAYLOAD_SIZE as usize);
    }

    #[test]
    fn coalesces_two_packets_into_one_datagram_before_flush() {
        let mut builder = PacketBuilder::new(cid(&[1, 2, 3, 4]), cid(&[9, 9]), 1452, false);
        let tls = NullTlsEngine::new();

        builder
            .prepare(EncryptLevel::Initial, 0, 1, 1, Vec::new(), false, false)
            .unwrap();
        builder.add_frame(Frame::Ping, SentFrame::Ping, true).unwrap();
        builder.finalize_packet(&tls, 1000, false).unwrap();
        assert!(builder.flush(&tls, false).is_none()); // not forced, batch small

        builder
            .prepare(EncryptLevel::Handshake, 1, 1, 1, Vec::new(), false, false)
            .unwrap();
        builder.add_frame(Frame::Ping, SentFrame::Ping, true).unwrap();
        builder.finalize_packet(&tls, 1000, true).unwrap();
        let datagram = builder.flush(&tls, true).unwrap();
        assert!(!datagram.is_empty());
        assert_eq!(builder.total_datagrams_sent(), 1);
    }

    #[test]
    fn frame_cap_rejects_additional_frames_once_packet_is_full() {
        let mut builder = PacketBuilder::new(cid(&[1, 2, 3, 4]), cid(&[9, 9]), 1452, false);
        builder
            .prepare(EncryptLevel::OneRtt, 0, 1, 1, Vec::new(), false, false)
            .unwrap();
        for _ in 0..MAX_FRAMES_PER_PACKET {
            builder.add_frame(Frame::Ping, SentFrame::Ping, true).unwrap();
        }
        assert!(builder.add_frame(Frame::Ping, SentFrame::Ping, true).is_err());
    }
}
