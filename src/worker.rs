// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A worker drains queued operations for the set of connections assigned to
//! it, one connection's [`OperationQueue`] at a time.
//!
//! Grounded on `original_source/src/core/worker.h`: "A worker thread for
//! draining queued operations on a connection," tracking `AverageQueueDelay`
//! and reporting itself `overloaded` once that smoothed delay passes
//! `MaxWorkerQueueDelayUs` (`QuicWorkerIsOverloaded`). The actual background
//! thread / wake-notifier plumbing follows `engine::router::Router`'s
//! spawn/stop/`Drop` shape, except here `drain` is exposed as a plain method
//! so callers can pump it from their own event loop or datapath thread
//! rather than this crate owning a thread (no datapath collaborator lives
//! in this crate, see §1).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::connection::Connection;
use crate::operation::{ApiCall, Operation, OperationQueue};
use crate::timer::TimerWheel;

struct ConnectionSlot {
    connection: Connection,
    queue: OperationQueue,
}

/// Smoothing weight for the queue-delay EWMA; matches the 1/8 weight used
/// elsewhere in this crate for similarly noisy timing signals.
const QUEUE_DELAY_ALPHA: f64 = 1.0 / 8.0;

/// Drains operations for a fixed set of connections, round-robin, bounding
/// how much work one connection can hog per pass with
/// `max_operations_per_drain`.
pub struct Worker {
    connections: HashMap<u64, ConnectionSlot>,
    ready: VecDeque<u64>,
    queued: HashSet<u64>,
    average_queue_delay_us: f64,
    max_operations_per_drain: usize,
    max_worker_queue_delay_us: u64,
    timers: TimerWheel<u64>,
}

impl Worker {
    pub fn new(max_operations_per_drain: usize, max_worker_queue_delay_us: u64) -> Self {
        Self {
            connections: HashMap::new(),
            ready: VecDeque::new(),
            queued: HashSet::new(),
            average_queue_delay_us: 0.0,
            max_operations_per_drain,
            max_worker_queue_delay_us,
            timers: TimerWheel::new(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn register_connection(&mut self, id: u64, connection: Connection) {
        self.connections.insert(id, ConnectionSlot { connection, queue: OperationQueue::new() });
    }

    /// Removes a connection, discarding any operations still queued for it.
    pub fn remove_connection(&mut self, id: u64) -> Option<Connection> {
        self.queued.remove(&id);
        self.timers.remove_connection(&id);
        let slot = self.connections.remove(&id)?;
        slot.queue.clear();
        Some(slot.connection)
    }

    pub fn connection(&self, id: u64) -> Option<&Connection> {
        self.connections.get(&id).map(|s| &s.connection)
    }

    pub fn connection_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.connections.get_mut(&id).map(|s| &mut s.connection)
    }

    fn schedule(&mut self, id: u64, should_wake: bool) {
        if should_wake && self.queued.insert(id) {
            self.ready.push_back(id);
        }
    }

    /// Queues `op` for connection `id` and schedules it for the next
    /// [`Self::drain`] pass if it was idle. A no-op if `id` isn't
    /// registered with this worker.
    pub fn enqueue(&mut self, id: u64, op: Operation, now_us: u64) {
        let Some(slot) = self.connections.get(&id) else { return };
        let should_wake = slot.queue.enqueue(op, now_us);
        self.schedule(id, should_wake);
    }

    /// Same as [`Self::enqueue`], jumping ahead of anything already queued.
    pub fn enqueue_front(&mut self, id: u64, op: Operation, now_us: u64) {
        let Some(slot) = self.connections.get(&id) else { return };
        let should_wake = slot.queue.enqueue_front(op, now_us);
        self.schedule(id, should_wake);
    }

    /// Drains up to `max_operations_per_drain` operations from each ready
    /// connection's queue in turn before moving to the next, then rotates
    /// any connection that still has work left back onto the ready list.
    /// Returns the datagrams produced by processed `FlushSend` operations,
    /// each tagged with the connection id that produced it.
    pub fn drain(&mut self, now_us: u64) -> Vec<(u64, Vec<u8>)> {
        let mut outbound = Vec::new();
        let pending: Vec<u64> = self.ready.drain(..).collect();
        for id in pending {
            self.queued.remove(&id);
            let Some(slot) = self.connections.get_mut(&id) else { continue };
            let mut processed = 0;
            while processed < self.max_operations_per_drain {
                let Some((enqueued_at_us, op)) = slot.queue.dequeue() else { break };
                self.observe_queue_delay(now_us.saturating_sub(enqueued_at_us));
                apply_operation(&mut slot.connection, op, now_us, id, &mut outbound);
                processed += 1;
            }
            if !slot.queue.is_empty() {
                self.schedule(id, true);
            }
            let deadline = slot.connection.next_timer_deadline_us();
            self.timers.update_connection(id, deadline);
        }
        outbound
    }

    /// Moves every connection whose timer wheel deadline is `<= now_us`
    /// into a `TimerExpired` operation and schedules it for the next
    /// [`Self::drain`] pass (the worker-side counterpart to a connection
    /// calling [`Self::drain`] after processing: `original_source`'s
    /// worker loop re-arms `TimerWheel` from `NextExpirationTime` the same
    /// way after every batch).
    pub fn poll_timers(&mut self, now_us: u64) {
        for id in self.timers.get_expired(now_us) {
            self.enqueue(id, Operation::TimerExpired { now_us }, now_us);
        }
    }

    /// Earliest deadline across every connection this worker owns, if any
    /// timer is armed (`QUIC_TIMER_WHEEL::NextExpirationTime`).
    pub fn next_timer_expiration(&self) -> Option<u64> {
        self.timers.next_expiration()
    }

    fn observe_queue_delay(&mut self, delay_us: u64) {
        self.average_queue_delay_us +=
            QUEUE_DELAY_ALPHA * (delay_us as f64 - self.average_queue_delay_us);
    }

    pub fn average_queue_delay_us(&self) -> f64 {
        self.average_queue_delay_us
    }

    /// Whether this worker's smoothed queue delay has crossed
    /// `max_worker_queue_delay_us` (`QuicWorkerIsOverloaded`): new
    /// connections should be routed elsewhere, or rejected, while this is
    /// true.
    pub fn is_overloaded(&self) -> bool {
        self.average_queue_delay_us > self.max_worker_queue_delay_us as f64
    }

    pub fn has_ready_work(&self) -> bool {
        !self.ready.is_empty()
    }
}

fn apply_operation(
    connection: &mut Connection,
    op: Operation,
    now_us: u64,
    id: u64,
    outbound: &mut Vec<(u64, Vec<u8>)>,
) {
    match op {
        Operation::ApiCall(ApiCall::Start { now_us }) => {
            let _ = connection.start(now_us);
        }
        Operation::ApiCall(ApiCall::Shutdown { application, error_code }) => {
            connection.close(application, error_code, Vec::new());
        }
        Operation::ApiCall(ApiCall::StreamSend { stream_id, data, fin }) => {
            let _ = connection.stream_send(stream_id, &data, fin);
        }
        // Completion/enable-toggle calls and resumption tickets require an
        // application callback collaborator this crate does not own (§1);
        // the operation type exists so a host can route them here once it
        // supplies one.
        Operation::ApiCall(ApiCall::StreamReceiveComplete { .. })
        | Operation::ApiCall(ApiCall::StreamReceiveSetEnabled { .. })
        | Operation::ApiCall(ApiCall::SendResumptionTicket { .. }) => {}
        Operation::FlushRecv { level, packet_number, frames, recv_time_us, bytes_received, ecn } => {
            let _ = connection.on_packet(level, packet_number, frames, recv_time_us, bytes_received, ecn);
        }
        Operation::FlushSend { now_us } => {
            while let Some(datagram) = connection.send(now_us) {
                outbound.push((id, datagram));
            }
        }
        Operation::TimerExpired { now_us } => connection.on_timer(now_us),
        // Stream-recv delivery and the stateless/binding-level operation
        // kinds (§4.9) are handled outside a connection's worker.
        Operation::FlushStreamRecv { .. }
        | Operation::RouteComplete
        | Operation::StatelessReset
        | Operation::VersionNegotiation
        | Operation::Retry => {}
    }
}
