// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Out-of-order `STREAM` frames delivered through `Connection::on_packet`
//! reassemble in stream-offset order regardless of arrival order.

use quicore::ack_tracker::EcnType;
use quicore::cid::{CidFlags, CidGenerator, ConnectionId};
use quicore::config::Settings;
use quicore::congestion::cubic::Cubic;
use quicore::connection::Connection;
use quicore::frame::{Frame, StreamFrame};
use quicore::packet_number::EncryptLevel;
use quicore::stream::StreamType;
use quicore::tls::NullTlsEngine;

fn cid(data: Vec<u8>) -> ConnectionId {
    ConnectionId { sequence_number: 0, data, flags: CidFlags::default(), reset_token: None }
}

fn new_server_connection() -> Connection {
    let mut settings = Settings::default();
    settings.initial_max_stream_data = 1 << 16;
    Connection::new(
        true,
        settings.clone(),
        Box::new(NullTlsEngine::new()),
        Box::new(Cubic::new(settings.initial_window_bytes, settings.minimum_window_bytes, 1200)),
        CidGenerator::new(Vec::new(), 0),
        cid(vec![1, 2, 3, 4]),
        cid(vec![5, 6, 7, 8]),
    )
}

fn stream_frame(stream_id: u64, offset: u64, data: &[u8], fin: bool) -> Frame {
    Frame::Stream(StreamFrame { stream_id, offset, fin, data: data.to_vec() })
}

#[test]
fn out_of_order_stream_frames_reassemble_in_offset_order() {
    let mut conn = new_server_connection();
    conn.streams.set_max_total_streams(StreamType::ClientBidi, 1);

    // "world" arrives before "hello": nothing is readable yet.
    conn.on_packet(
        EncryptLevel::OneRtt,
        0,
        vec![stream_frame(4, 5, b"world", false)],
        0,
        50,
        EcnType::NotEct,
    )
    .unwrap();
    assert_eq!(conn.streams.get(4).unwrap().recv_buffer.readable_len(), 0);

    // The missing prefix fills the gap: both chunks become readable
    // together, in order.
    conn.on_packet(
        EncryptLevel::OneRtt,
        1,
        vec![stream_frame(4, 0, b"hello", false)],
        1,
        50,
        EcnType::NotEct,
    )
    .unwrap();

    let stream = conn.streams.get_mut(4).unwrap();
    assert_eq!(stream.recv_buffer.base_offset(), 0);
    assert_eq!(stream.recv_buffer.peek(), b"helloworld");

    stream.recv_buffer.drain(10);
    assert_eq!(stream.recv_buffer.base_offset(), 10);
    assert_eq!(stream.recv_buffer.readable_len(), 0);
}

#[test]
fn duplicate_packet_number_is_ignored() {
    let mut conn = new_server_connection();
    conn.streams.set_max_total_streams(StreamType::ClientBidi, 1);

    conn.on_packet(
        EncryptLevel::OneRtt,
        0,
        vec![stream_frame(4, 0, b"hello", false)],
        0,
        50,
        EcnType::NotEct,
    )
    .unwrap();
    // Same packet number redelivered (e.g. a duplicated UDP datagram):
    // must not double-apply the frame.
    conn.on_packet(
        EncryptLevel::OneRtt,
        0,
        vec![stream_frame(4, 0, b"hello", false)],
        1,
        50,
        EcnType::NotEct,
    )
    .unwrap();

    assert_eq!(conn.streams.get(4).unwrap().bytes_received, 5);
}

#[test]
fn stream_open_beyond_peer_limit_is_rejected() {
    let mut conn = new_server_connection();
    // No MAX_STREAMS budget granted for client-initiated bidi streams.
    let result = conn.on_packet(
        EncryptLevel::OneRtt,
        0,
        vec![stream_frame(4, 0, b"hello", false)],
        0,
        50,
        EcnType::NotEct,
    );
    assert!(result.is_err());
}
