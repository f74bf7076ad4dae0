// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream state machines, stream set, and priority ordering for the send
//! scheduler.
//!
//! Grounded on `original_source/src/core/stream_set.h`: one `StreamSet`
//! per connection tracks per-type open/limit counters and owns every
//! live [`Stream`]. Streams needing to send are threaded through
//! [`StreamSet::send_order`], the Rust analogue of the priority-sorted
//! doubly linked list `QUIC_STREAM_SET` keeps for the send scheduler
//! (`engine::demux::Topic`'s fanout-registry idiom supplies the
//! `DashMap`-of-state-machines shape this module follows, though here a
//! plain `HashMap` suffices since streams are only ever touched by the
//! connection's own worker).

use std::collections::HashMap;

use crate::recv_buffer::RecvBuffer;

/// Stream ID low bits (RFC 9000 §2.1).
pub const STREAM_ID_INITIATOR_SERVER: u64 = 0x1;
pub const STREAM_ID_UNIDIRECTIONAL: u64 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    ClientBidi,
    ServerBidi,
    ClientUni,
    ServerUni,
}

impl StreamType {
    pub fn from_id(stream_id: u64) -> Self {
        let is_server = stream_id & STREAM_ID_INITIATOR_SERVER != 0;
        let is_uni = stream_id & STREAM_ID_UNIDIRECTIONAL != 0;
        match (is_server, is_uni) {
            (false, false) => Self::ClientBidi,
            (true, false) => Self::ServerBidi,
            (false, true) => Self::ClientUni,
            (true, true) => Self::ServerUni,
        }
    }

    fn low_bits(self) -> u64 {
        match self {
            Self::ClientBidi => 0b00,
            Self::ServerBidi => 0b01,
            Self::ClientUni => 0b10,
            Self::ServerUni => 0b11,
        }
    }

    pub fn is_unidirectional(self) -> bool {
        matches!(self, Self::ClientUni | Self::ServerUni)
    }

    pub fn is_server_initiated(self) -> bool {
        matches!(self, Self::ServerBidi | Self::ServerUni)
    }

    /// `count`, the 0-based ordinal within this type, to a wire stream ID.
    pub fn id_for_count(self, count: u64) -> u64 {
        (count << 2) | self.low_bits()
    }
}

/// `id >> 2`, the 0-based ordinal of `stream_id` within its type.
pub fn stream_count(stream_id: u64) -> u64 {
    stream_id >> 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Disabled,
    Send,
    DataSent,
    ResetSent,
    DataAcked,
    ResetAcked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Disabled,
    Recv,
    SizeKnown,
    DataRead,
    ResetRead,
}

/// Per-stream send-flags bitset driving what the packet builder writes
/// for this stream (§4.7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSendFlags {
    pub data_blocked: bool,
    pub max_data_update: bool,
    pub send_abort: bool,
    pub recv_abort: bool,
    pub data: bool,
    pub open: bool,
    pub fin: bool,
}

impl StreamSendFlags {
    pub fn is_empty(self) -> bool {
        self == Self::default()
    }
}

/// One QUIC stream: a send side, a receive side, flow control, and
/// scheduling metadata.
pub struct Stream {
    pub id: u64,
    pub stream_type: StreamType,

    pub send_state: SendState,
    pub recv_state: RecvState,

    /// Bytes queued by the application but not yet handed to the packet
    /// builder.
    send_buffer: Vec<u8>,
    /// Stream offset of the next byte the send scheduler should frame.
    pub next_send_offset: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub peer_max_stream_data: u64,
    /// Set once the send side knows its final length (FIN queued or reset).
    pub final_send_size: Option<u64>,

    pub recv_buffer: RecvBuffer,
    pub bytes_received: u64,
    pub local_max_stream_data: u64,

    pub priority: u16,
    pub deadline_us: Option<u64>,
    pub send_flags: StreamSendFlags,
}

impl Stream {
    pub fn new(id: u64, initial_send_window: u64, initial_recv_window: u64) -> Self {
        Self {
            id,
            stream_type: StreamType::from_id(id),
            send_state: SendState::Send,
            recv_state: RecvState::Recv,
            send_buffer: Vec::new(),
            next_send_offset: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            peer_max_stream_data: initial_send_window,
            final_send_size: None,
            recv_buffer: RecvBuffer::new(4096, initial_recv_window),
            bytes_received: 0,
            local_max_stream_data: initial_recv_window,
            priority: 0,
            deadline_us: None,
            send_flags: StreamSendFlags::default(),
        }
    }

    /// Queue application bytes for sending, opening the stream if this is
    /// the first data (§3 send state machine: `Disabled -> Send`).
    pub fn queue_send(&mut self, bytes: &[u8], fin: bool) {
        self.send_buffer.extend_from_slice(bytes);
        if fin {
            self.final_send_size = Some(self.next_send_offset + self.send_buffer.len() as u64);
            self.send_flags.fin = true;
        }
        if !bytes.is_empty() || fin {
            self.send_flags.data = true;
        }
    }

    /// Bytes still queued and not yet framed, respecting the peer's flow
    /// control window.
    pub fn sendable_len(&self) -> usize {
        let queued = self.send_buffer.len();
        let window = self.peer_max_stream_data.saturating_sub(self.next_send_offset);
        queued.min(window as usize)
    }

    /// Take up to `max_len` bytes for framing, advancing `next_send_offset`.
    /// Returns `(offset, bytes, fin)`; `fin` is true only if this chunk
    /// reaches `final_send_size`.
    pub fn take_send_chunk(&mut self, max_len: usize) -> (u64, Vec<u8>, bool) {
        let offset = self.next_send_offset;
        let len = self.sendable_len().min(max_len);
        let bytes = self.send_buffer.drain(..len).collect::<Vec<u8>>();
        self.next_send_offset += len as u64;

        let fin = self.final_send_size == Some(self.next_send_offset);
        if fin {
            self.send_flags.fin = false;
        }
        if self.send_buffer.is_empty() && !fin {
            self.send_flags.data = false;
        }
        if fin && self.send_state == SendState::Send {
            self.send_state = SendState::DataSent;
        }
        (offset, bytes, fin)
    }

    /// Mark `bytes_acked` bytes of send data acknowledged starting from
    /// the lowest un-acked offset; transitions `DataSent -> DataAcked`
    /// once every byte up to `final_send_size` is acked.
    pub fn on_send_acked(&mut self, bytes_acked: u64) {
        self.bytes_acked += bytes_acked;
        if self.send_state == SendState::DataSent {
            if let Some(final_size) = self.final_send_size {
                if self.bytes_acked >= final_size {
                    self.send_state = SendState::DataAcked;
                }
            }
        }
    }

    pub fn reset_send(&mut self) {
        self.send_state = SendState::ResetSent;
        self.send_buffer.clear();
        self.send_flags.send_abort = true;
    }

    pub fn on_reset_acked(&mut self) {
        if self.send_state == SendState::ResetSent {
            self.send_state = SendState::ResetAcked;
        }
    }

    /// Write received stream bytes and advance the recv state machine
    /// (§4.8). Returns `Ok(newly_readable)`.
    pub fn on_stream_data(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<bool, ()> {
        let before = self.recv_buffer.readable_len();
        self.recv_buffer.write(offset, data)?;
        if fin {
            self.recv_state = RecvState::SizeKnown;
        }
        let after = self.recv_buffer.readable_len();
        if let RecvState::SizeKnown = self.recv_state {
            if self.recv_buffer.is_complete(offset + data.len() as u64) {
                // Caller (stream set / connection) finalizes DataRead once
                // the application has consumed the final bytes.
            }
        }
        self.bytes_received = self.bytes_received.max(offset + data.len() as u64);
        Ok(after > before)
    }

    pub fn mark_data_read_complete(&mut self) {
        if self.recv_state == RecvState::SizeKnown && self.recv_buffer.readable_len() == 0 {
            self.recv_state = RecvState::DataRead;
        }
    }

    pub fn on_reset_stream(&mut self) {
        self.recv_state = RecvState::ResetRead;
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_flags.is_empty() || self.sendable_len() > 0
    }
}

/// Per-type open/limit bookkeeping, mirroring `QUIC_STREAM_TYPE_INFO`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTypeInfo {
    pub max_total_stream_count: u64,
    pub total_stream_count: u64,
    pub max_current_stream_count: u16,
    pub current_stream_count: u16,
}

impl StreamTypeInfo {
    pub fn available(&self) -> u64 {
        self.max_total_stream_count.saturating_sub(self.total_stream_count)
    }
}

/// All streams for one connection, plus per-type limits and a
/// priority-ordered send list.
pub struct StreamSet {
    streams: HashMap<u64, Stream>,
    types: [StreamTypeInfo; 4],
    closed: Vec<u64>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            types: [StreamTypeInfo::default(); 4],
            closed: Vec::new(),
        }
    }

    fn type_index(t: StreamType) -> usize {
        match t {
            StreamType::ClientBidi => 0,
            StreamType::ServerBidi => 1,
            StreamType::ClientUni => 2,
            StreamType::ServerUni => 3,
        }
    }

    pub fn type_info(&self, t: StreamType) -> &StreamTypeInfo {
        &self.types[Self::type_index(t)]
    }

    /// Applied when the peer's initial/updated transport parameters or a
    /// MAX_STREAMS frame raises the count of streams we may open.
    pub fn set_max_total_streams(&mut self, t: StreamType, max_streams: u64) {
        let info = &mut self.types[Self::type_index(t)];
        if max_streams > info.max_total_stream_count {
            info.max_total_stream_count = max_streams;
        }
    }

    /// Opens a new locally-initiated stream of `t`, failing if the peer's
    /// advertised limit is exhausted.
    pub fn open_local_stream(
        &mut self,
        t: StreamType,
        initial_send_window: u64,
        initial_recv_window: u64,
    ) -> Option<u64> {
        let info = &mut self.types[Self::type_index(t)];
        if info.available() == 0 {
            return None;
        }
        let count = info.total_stream_count;
        info.total_stream_count += 1;
        info.current_stream_count += 1;
        let id = t.id_for_count(count);
        self.streams
            .insert(id, Stream::new(id, initial_send_window, initial_recv_window));
        Some(id)
    }

    /// Resolves a peer-initiated stream ID, creating it (and any
    /// lower-numbered sibling streams of the same type, per RFC 9000
    /// §2.1) if it doesn't exist yet. Returns `None` if creating it would
    /// exceed our advertised stream-count limit.
    pub fn get_or_create_for_peer(
        &mut self,
        stream_id: u64,
        initial_send_window: u64,
        initial_recv_window: u64,
    ) -> Option<&mut Stream> {
        let t = StreamType::from_id(stream_id);
        let idx = Self::type_index(t);
        let target_count = stream_count(stream_id);

        if target_count >= self.types[idx].max_total_stream_count {
            return None;
        }

        while self.types[idx].total_stream_count <= target_count {
            let count = self.types[idx].total_stream_count;
            let id = t.id_for_count(count);
            self.types[idx].total_stream_count += 1;
            self.types[idx].current_stream_count += 1;
            self.streams
                .entry(id)
                .or_insert_with(|| Stream::new(id, initial_send_window, initial_recv_window));
        }

        self.streams.get_mut(&stream_id)
    }

    pub fn get(&self, stream_id: u64) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Streams with something to send, in ascending-priority order
    /// (lower `priority` value sent first), ties broken by stream ID for
    /// stable ordering (§4.7 stable-insertion-at-same-priority).
    pub fn send_order(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .streams
            .values()
            .filter(|s| s.has_pending_send())
            .map(|s| s.id)
            .collect();
        ids.sort_by_key(|id| (self.streams[id].priority, *id));
        ids
    }

    pub fn update_priority(&mut self, stream_id: u64, priority: u16) {
        if let Some(s) = self.streams.get_mut(&stream_id) {
            s.priority = priority;
        }
    }

    /// Queue a fully-terminal stream (both sides done) for release.
    pub fn release_if_closed(&mut self, stream_id: u64) {
        let done = self.streams.get(&stream_id).is_some_and(|s| {
            matches!(s.send_state, SendState::DataAcked | SendState::ResetAcked)
                && matches!(s.recv_state, RecvState::DataRead | RecvState::ResetRead)
        });
        if done {
            self.closed.push(stream_id);
        }
    }

    /// Final clean up for all closed streams (`QuicStreamSetDrainClosedStreams`).
    pub fn drain_closed_streams(&mut self) {
        for id in self.closed.drain(..) {
            self.streams.remove(&id);
            let t = StreamType::from_id(id);
            self.types[Self::type_index(t)].current_stream_count -= 1;
        }
    }

    /// Sum of send/recv flow-control availability across all streams,
    /// for `QuicStreamSetGetFlowControlSummary`.
    pub fn flow_control_summary(&self) -> (u64, u64) {
        let mut fc_available = 0u64;
        let mut send_window = 0u64;
        for s in self.streams.values() {
            fc_available += s.local_max_stream_data.saturating_sub(s.bytes_received);
            send_window += s.peer_max_stream_data.saturating_sub(s.next_send_offset);
        }
        (fc_available, send_window)
    }
}

impl Default for StreamSet {
    fn default() -> Self {
        Self::new()
    }
}
