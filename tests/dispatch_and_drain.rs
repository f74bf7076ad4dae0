// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A received datagram's destination CID routes through a [`Lookup`] table
//! to a connection id, which a [`Worker`] then drains into an outbound
//! datagram — the path a binding's receive callback and worker thread
//! follow together in practice.

use quicore::ack_tracker::EcnType;
use quicore::cid::{CidFlags, CidGenerator, ConnectionId};
use quicore::config::Settings;
use quicore::congestion::cubic::Cubic;
use quicore::connection::Connection;
use quicore::lookup::Lookup;
use quicore::operation::Operation;
use quicore::packet_number::EncryptLevel;
use quicore::tls::NullTlsEngine;
use quicore::worker::Worker;

fn cid(data: Vec<u8>) -> ConnectionId {
    ConnectionId { sequence_number: 0, data, flags: CidFlags::default(), reset_token: None }
}

fn new_client_connection() -> Connection {
    let settings = Settings::default();
    Connection::new(
        false,
        settings.clone(),
        Box::new(NullTlsEngine::new()),
        Box::new(Cubic::new(settings.initial_window_bytes, settings.minimum_window_bytes, 1200)),
        CidGenerator::new(Vec::new(), 0),
        cid(vec![1, 2, 3, 4]),
        cid(vec![5, 6, 7, 8]),
    )
}

#[test]
fn lookup_routes_to_the_worker_that_produces_a_datagram() {
    let lookup: Lookup<u64> = Lookup::new(0);
    lookup.add_local_cid(vec![5, 6, 7, 8], 1).unwrap();

    let mut worker = Worker::new(16, 100_000);
    worker.register_connection(1, new_client_connection());

    // A datagram arrived addressed to local CID [5,6,7,8]; the binding
    // resolves it to connection id 1 and the worker processes it, leaving
    // an ACK owed back to the peer.
    let conn_id = lookup.find_by_local_cid(&[5, 6, 7, 8]).unwrap();
    assert_eq!(conn_id, 1);

    worker.enqueue(
        conn_id,
        Operation::FlushRecv {
            level: EncryptLevel::Initial,
            packet_number: 0,
            frames: Vec::new(),
            recv_time_us: 0,
            bytes_received: 1200,
            ecn: EcnType::NotEct,
        },
        0,
    );
    worker.enqueue(conn_id, Operation::FlushSend { now_us: 0 }, 0);
    let outbound = worker.drain(0);

    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].0, conn_id);
    assert!(!outbound[0].1.is_empty());
}

#[test]
fn removing_a_cid_stops_further_routing() {
    let lookup: Lookup<u64> = Lookup::new(0);
    lookup.add_local_cid(vec![9, 9, 9, 9], 7).unwrap();
    assert_eq!(lookup.find_by_local_cid(&[9, 9, 9, 9]), Some(7));
    assert!(lookup.remove_local_cid(&[9, 9, 9, 9]));
    assert_eq!(lookup.find_by_local_cid(&[9, 9, 9, 9]), None);
}

#[test]
fn enqueue_for_an_unregistered_connection_is_a_no_op() {
    let mut worker = Worker::new(16, 100_000);
    // Nothing registered under id 42 (e.g. already torn down by the time
    // a stale datagram's lookup resolves).
    worker.enqueue(
        42,
        Operation::FlushRecv {
            level: EncryptLevel::Initial,
            packet_number: 0,
            frames: Vec::new(),
            recv_time_us: 0,
            bytes_received: 1200,
            ecn: EcnType::NotEct,
        },
        0,
    );
    assert!(!worker.has_ready_work());
    assert_eq!(worker.connection_count(), 0);
}
