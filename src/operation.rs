// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operation types and the per-connection operation queue.
//!
//! Grounded on `original_source/src/core/operation.c`: "An operation is a
//! single unit of work for a connection... An operation queue is a
//! per-connection, multiple-producer, single-consumer queue of operations.
//! Operations are pushed onto the queue by arbitrary application threads,
//! datapath receive handlers, and so on. The queue is drained and processed
//! by a single worker thread." `enqueue`/`enqueue_front` report whether the
//! queue was idle (`QuicOperationEnqueue`'s `StartProcessing` return value)
//! so the caller knows whether to wake a worker; `dequeue` flips
//! `actively_processing` the same way `QuicOperationDequeue` does.

use crate::ack_tracker::EcnType;
use crate::frame::Frame;
use crate::packet_number::EncryptLevel;

/// One `QUIC_API_TYPE_*` call made through the public API, applied to a
/// connection by its worker instead of the calling thread.
#[derive(Debug, Clone)]
pub enum ApiCall {
    Start { now_us: u64 },
    Shutdown { application: bool, error_code: u64 },
    StreamSend { stream_id: u64, data: Vec<u8>, fin: bool },
    StreamReceiveComplete { stream_id: u64, len: u64 },
    StreamReceiveSetEnabled { stream_id: u64, enabled: bool },
    SendResumptionTicket { data: Vec<u8> },
}

/// A single unit of work for a connection (`QUIC_OPERATION_TYPE`).
#[derive(Debug, Clone)]
pub enum Operation {
    ApiCall(ApiCall),
    /// A received, decrypted packet for one encryption level.
    FlushRecv {
        level: EncryptLevel,
        packet_number: u64,
        frames: Vec<Frame>,
        recv_time_us: u64,
        bytes_received: u64,
        ecn: EcnType,
    },
    FlushSend { now_us: u64 },
    FlushStreamRecv { stream_id: u64 },
    /// A path-validation response arrived for a connection still completing
    /// route resolution (handled by the datapath collaborator; no-op here).
    RouteComplete,
    TimerExpired { now_us: u64 },
    /// Stateless operation types from `operation.c`'s tail
    /// (`QUIC_OPER_TYPE_VERSION_NEGOTIATION` and above): these are
    /// processed by a binding's scavenger, not a connection's worker, and
    /// only appear here for completeness of the type list (§3).
    StatelessReset,
    VersionNegotiation,
    Retry,
}

/// Per-connection, multi-producer single-consumer operation queue
/// (`QUIC_OPERATION_QUEUE`). `enqueue_front` exists for operations that must
/// jump the line, such as an immediate shutdown.
pub struct OperationQueue {
    front: crossbeam::queue::SegQueue<(u64, Operation)>,
    back: crossbeam::queue::SegQueue<(u64, Operation)>,
    len: std::sync::atomic::AtomicUsize,
    actively_processing: std::sync::atomic::AtomicBool,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            front: crossbeam::queue::SegQueue::new(),
            back: crossbeam::queue::SegQueue::new(),
            len: std::sync::atomic::AtomicUsize::new(0),
            actively_processing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Enqueues `op`, timestamped with `now_us` for later queue-delay
    /// accounting. Returns `true` if the queue was empty and idle before
    /// this call (`QuicOperationEnqueue`'s `StartProcessing`): the caller
    /// should schedule this connection for draining.
    pub fn enqueue(&self, op: Operation, now_us: u64) -> bool {
        use std::sync::atomic::Ordering;
        let was_empty = self.len.fetch_add(1, Ordering::AcqRel) == 0;
        self.back.push((now_us, op));
        was_empty && !self.actively_processing.load(Ordering::Acquire)
    }

    /// Same as [`Self::enqueue`] but the operation is dequeued before
    /// anything already queued (`QuicOperationEnqueueFront`).
    pub fn enqueue_front(&self, op: Operation, now_us: u64) -> bool {
        use std::sync::atomic::Ordering;
        let was_empty = self.len.fetch_add(1, Ordering::AcqRel) == 0;
        self.front.push((now_us, op));
        was_empty && !self.actively_processing.load(Ordering::Acquire)
    }

    /// Pops the next operation along with the time it was enqueued. Clears
    /// `actively_processing` and returns `None` once the queue is empty
    /// (`QuicOperationDequeue`'s empties-to-idle behavior).
    pub fn dequeue(&self) -> Option<(u64, Operation)> {
        use std::sync::atomic::Ordering;
        if let Some(entry) = self.front.pop().or_else(|| self.back.pop()) {
            self.actively_processing.store(true, Ordering::Release);
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Some(entry);
        }
        self.actively_processing.store(false, Ordering::Release);
        None
    }

    /// Drops every queued operation and resets to idle
    /// (`QuicOperationQueueClear`), used when a connection is torn down
    /// with work still outstanding. Returns the number of operations
    /// discarded.
    pub fn clear(&self) -> usize {
        use std::sync::atomic::Ordering;
        let mut cleared = 0;
        while self.front.pop().is_some() {
            cleared += 1;
        }
        while self.back.pop().is_some() {
            cleared += 1;
        }
        self.len.store(0, Ordering::Release);
        self.actively_processing.store(false, Ordering::Release);
        cleared
    }

    pub fn is_empty(&self) -> bool {
        self.len.load(std::sync::atomic::Ordering::Acquire) == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_on_idle_empty_queue_signals_wake() {
        let q = OperationQueue::new();
        assert!(q.enqueue(Operation::TimerExpired { now_us: 0 }, 0));
    }

    #[test]
    fn enqueue_while_populated_does_not_signal_wake() {
        let q = OperationQueue::new();
        assert!(q.enqueue(Operation::TimerExpired { now_us: 0 }, 0));
        assert!(!q.enqueue(Operation::TimerExpired { now_us: 1 }, 1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn dequeue_drains_front_before_back() {
        let q = OperationQueue::new();
        q.enqueue(Operation::TimerExpired { now_us: 1 }, 1);
        q.enqueue_front(Operation::FlushSend { now_us: 2 }, 2);
        let (_, first) = q.dequeue().unwrap();
        assert!(matches!(first, Operation::FlushSend { .. }));
        let (_, second) = q.dequeue().unwrap();
        assert!(matches!(second, Operation::TimerExpired { .. }));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn dequeue_reports_idle_once_drained() {
        let q = OperationQueue::new();
        q.enqueue(Operation::TimerExpired { now_us: 0 }, 0);
        q.dequeue();
        assert!(q.is_empty());
        // Re-enqueueing after drain should signal wake again since the
        // queue went idle.
        assert!(q.enqueue(Operation::TimerExpired { now_us: 5 }, 5));
    }

    #[test]
    fn clear_discards_everything_queued() {
        let q = OperationQueue::new();
        q.enqueue(Operation::TimerExpired { now_us: 0 }, 0);
        q.enqueue(Operation::TimerExpired { now_us: 1 }, 1);
        q.enqueue_front(Operation::FlushSend { now_us: 2 }, 2);
        assert_eq!(q.clear(), 3);
        assert!(q.is_empty());
        assert!(q.dequeue().is_none());
    }
}
