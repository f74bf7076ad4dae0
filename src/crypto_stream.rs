// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable byte channel carrying TLS handshake records for one
//! encryption level.
//!
//! Grounded on `original_source/src/core/crypto.h`'s `QUIC_CRYPTO`: a send
//! side tracking `un_acked_offset`/`next_send_offset`/a recovery window
//! plus sparse ack ranges above `un_acked_offset`, and a receive side
//! that is just a [`RecvBuffer`] handed straight to the TLS engine.
//! Unlike a [`crate::stream::Stream`] there is no FIN and no peer flow
//! control — TLS record delivery is unbounded and always reliable.

use crate::range_set::RangeSet;
use crate::recv_buffer::RecvBuffer;

/// One direction's outgoing TLS byte stream.
pub struct CryptoSendState {
    buffer: Vec<u8>,
    /// Smallest offset with unacknowledged data (`SND.UNA`).
    un_acked_offset: u64,
    /// Next offset the send scheduler will start framing from.
    next_send_offset: u64,
    /// Highest offset sent at least once.
    max_sent_length: u64,
    /// Ack ranges above `un_acked_offset`, with holes between them.
    sparse_ack_ranges: RangeSet,
    recovery_next_offset: u64,
    recovery_end_offset: u64,
}

impl CryptoSendState {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            un_acked_offset: 0,
            next_send_offset: 0,
            max_sent_length: 0,
            sparse_ack_ranges: RangeSet::new(),
            recovery_next_offset: 0,
            recovery_end_offset: 0,
        }
    }

    fn recovery_window_open(&self) -> bool {
        self.recovery_next_offset < self.recovery_end_offset
    }

    fn has_pending_data(&self) -> bool {
        self.recovery_window_open() || self.next_send_offset < self.buffer.len() as u64
    }

    fn queue(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Takes the next chunk to frame, preferring the recovery window (data
    /// believed lost) over fresh data, mirroring `QuicCryptoHasPendingCryptoFrame`.
    fn take_send_chunk(&mut self, max_len: usize) -> Option<(u64, Vec<u8>)> {
        if self.recovery_window_open() {
            let offset = self.recovery_next_offset;
            let len = ((self.recovery_end_offset - offset) as usize)
                .min(max_len)
                .min(self.buffer.len().saturating_sub(offset as usize));
            if len == 0 {
                return None;
            }
            let bytes = self.buffer[offset as usize..offset as usize + len].to_vec();
            self.recovery_next_offset += len as u64;
            self.max_sent_length = self.max_sent_length.max(offset + len as u64);
            return Some((offset, bytes));
        }

        let offset = self.next_send_offset;
        let remaining = self.buffer.len() as u64 - offset;
        if remaining == 0 {
            return None;
        }
        let len = (remaining as usize).min(max_len);
        let bytes = self.buffer[offset as usize..offset as usize + len].to_vec();
        self.next_send_offset += len as u64;
        self.max_sent_length = self.max_sent_length.max(offset + len as u64);
        Some((offset, bytes))
    }

    /// Records an ack for `[offset, offset+len)`, advancing `un_acked_offset`
    /// through any now-contiguous run and freeing acked bytes from the buffer.
    fn on_ack(&mut self, offset: u64, len: u64) {
        if offset + len <= self.un_acked_offset {
            return;
        }
        self.sparse_ack_ranges.add_range(offset, len);
        while let Some((count, _)) = self.sparse_ack_ranges.get_range(self.un_acked_offset) {
            self.un_acked_offset += count;
        }
        if self.un_acked_offset > 0 && self.un_acked_offset as usize <= self.buffer.len() {
            self.sparse_ack_ranges.set_min(self.un_acked_offset);
        }
    }

    /// Data sent but not acked, between `offset` and `offset+len`, is
    /// declared lost: rewinds the recovery window to refeed it.
    fn on_loss(&mut self, offset: u64, len: u64) {
        let end = offset + len;
        if self.sparse_ack_ranges.contains(offset) {
            return; // spurious: already acked via a range past un_acked_offset
        }
        self.recovery_next_offset = self.recovery_next_offset.min(offset);
        self.recovery_end_offset = self.recovery_end_offset.max(end);
    }
}

/// The TLS byte channel for one encryption level.
pub struct CryptoStream {
    send: CryptoSendState,
    pub recv_buffer: RecvBuffer,
    /// Total bytes handed to the TLS engine so far.
    pub recv_total_consumed: u64,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self {
            send: CryptoSendState::new(),
            recv_buffer: RecvBuffer::new(4096, u64::MAX),
            recv_total_consumed: 0,
        }
    }

    pub fn queue_send(&mut self, bytes: &[u8]) {
        self.send.queue(bytes);
    }

    pub fn has_pending_send(&self) -> bool {
        self.send.has_pending_data()
    }

    pub fn take_send_chunk(&mut self, max_len: usize) -> Option<(u64, Vec<u8>)> {
        self.send.take_send_chunk(max_len)
    }

    pub fn on_send_acked(&mut self, offset: u64, len: u64) {
        self.send.on_ack(offset, len);
    }

    pub fn on_send_lost(&mut self, offset: u64, len: u64) {
        self.send.on_loss(offset, len);
    }

    /// Writes received CRYPTO frame bytes; returns the newly-readable
    /// contiguous prefix to hand to the TLS engine, if any grew.
    pub fn on_recv_data(&mut self, offset: u64, data: &[u8]) -> Result<Option<Vec<u8>>, ()> {
        let before = self.recv_buffer.readable_len();
        self.recv_buffer.write(offset, data)?;
        let after = self.recv_buffer.readable_len();
        if after > before {
            Ok(Some(self.recv_buffer.peek().to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Marks `len` bytes as consumed by the TLS engine, draining them from
    /// the recv buffer.
    pub fn consume(&mut self, len: usize) {
        self.recv_buffer.drain(len);
        self.recv_total_consumed += len as u64;
    }
}

impl Default for CryptoStream {
    fn default() -> Self {
        Self::new()
    }
}
