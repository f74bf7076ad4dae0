// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # quicore - per-connection QUIC protocol engine
//!
//! The connection-level core of a QUIC (RFC 9000/9001/9002) implementation:
//! packet processing, loss detection, congestion control, stream
//! multiplexing, and the dispatch/scheduling machinery a host wires a real
//! socket and TLS stack into. This crate owns everything that happens to
//! bytes between "a UDP datagram arrived" and "the application got its
//! stream data" — the UDP socket itself, TLS 1.3 handshake crypto, and any
//! async runtime are supplied by the host through the [`tls::TlsEngine`]
//! and [`tls::Datapath`] collaborator traits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quicore::cid::{CidGenerator, ConnectionId, CidFlags};
//! use quicore::config::Settings;
//! use quicore::congestion::cubic::Cubic;
//! use quicore::connection::Connection;
//! use quicore::tls::NullTlsEngine;
//!
//! let settings = Settings::default();
//! let initial_dcid = ConnectionId {
//!     sequence_number: 0,
//!     data: vec![0xaa; 8],
//!     flags: CidFlags::default(),
//!     reset_token: None,
//! };
//! let initial_scid = ConnectionId {
//!     sequence_number: 0,
//!     data: vec![0xbb; 8],
//!     flags: CidFlags::default(),
//!     reset_token: None,
//! };
//! let mut conn = Connection::new(
//!     false,
//!     settings.clone(),
//!     Box::new(NullTlsEngine::new()),
//!     Box::new(Cubic::new(
//!         settings.initial_window_bytes,
//!         settings.minimum_window_bytes,
//!         1200,
//!     )),
//!     CidGenerator::new(Vec::new(), 0),
//!     initial_dcid,
//!     initial_scid,
//! );
//! conn.initialize().unwrap();
//! conn.start(0).unwrap();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                    Binding / Lookup (per socket)                    |
//! |   Datagram dispatch by destination CID or 4-tuple, stateless ops    |
//! +---------------------------------------------------------------------+
//! |                  Worker (operation queue drain loop)                 |
//! |   FlushRecv / FlushSend / TimerExpired / ApiCall, one queue/conn     |
//! +---------------------------------------------------------------------+
//! |                        Connection (per connection)                  |
//! |   Lifecycle FSM | Streams | Crypto streams | Send scheduler         |
//! +---------------------------------------------------------------------+
//! |        Loss detection | Congestion control | Packet builder          |
//! +---------------------------------------------------------------------+
//! |              Frame / packet / varint wire codecs                    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`connection::Connection`] | The aggregate per-connection state machine |
//! | [`binding::Binding`] | Shared per-socket CID/lookup/stateless-op state |
//! | [`lookup::Lookup`] | Destination-CID to connection routing table |
//! | [`worker::Worker`] | Drains queued operations for a set of connections |
//! | [`operation::Operation`] | One unit of work applied to a connection |
//! | [`config::Settings`] | Connection-level tunables |
//! | [`error::QuicoreError`] | Crate-wide error type |
//!
//! ## Features
//!
//! - `logging` - enable the `debug!/info!/warn!/error!` macros (no-op otherwise)
//! - `trace` - verbose per-packet tracing, implies `logging`
//! - `bbr` - enable the BBR congestion controller alongside the always-on Cubic
//!
//! ## Modules Overview
//!
//! - [`connection`] - the aggregate state machine (start here)
//! - [`binding`] / [`lookup`] - per-socket datagram dispatch
//! - [`operation`] / [`worker`] - operation queue and drain loop
//! - [`packet`] / [`frame`] / [`varint`] - wire codecs
//! - [`loss_detection`] / [`congestion`] - RFC 9002 loss recovery and congestion control
//! - [`stream`] / [`crypto_stream`] / [`recv_buffer`] - stream multiplexing and reassembly
//! - [`tls`] - the `TlsEngine`/`Datapath` collaborator traits a host implements
//! - [`retry`] - stateless retry/`NEW_TOKEN` token AEAD and key rotation
//! - [`timer`] - per-worker timer wheel
//!
//! ## See Also
//!
//! - [RFC 9000 - QUIC: A UDP-Based Multiplexed and Secure Transport](https://www.rfc-editor.org/rfc/rfc9000)
//! - [RFC 9001 - Using TLS to Secure QUIC](https://www.rfc-editor.org/rfc/rfc9001)
//! - [RFC 9002 - QUIC Loss Detection and Congestion Control](https://www.rfc-editor.org/rfc/rfc9002)

// Clippy: No blanket suppressions. Fix issues properly or use inline #[allow] with justification.

/// Per-space received/to-ack range tracking, ECN counts, immediate-ack policy.
pub mod ack_tracker;
/// Shared per-socket state: CID lookup, listener count, stateless operation queue.
pub mod binding;
/// Connection ID encode/decode, partition-id layout, generation.
pub mod cid;
/// Connection-level tunables (`Settings`) and protocol constants.
pub mod config;
/// Pluggable congestion control (Cubic always on, BBR behind the `bbr` feature).
pub mod congestion;
/// The aggregate per-connection state machine.
pub mod connection;
/// Reliable, ordered byte channel per encryption level, carrying TLS records.
pub mod crypto_stream;
/// Crate-wide error and transport error code types.
pub mod error;
/// QUIC frame type codes and their encode/decode.
pub mod frame;
/// Compile-time configurable logging system (zero-cost when disabled).
pub mod logging;
/// Destination-CID / 4-tuple routing table behind a [`binding::Binding`].
pub mod lookup;
/// RFC 9002 RTT estimation, PTO computation, and loss inference.
pub mod loss_detection;
/// Long/short header parsing and building, version negotiation.
pub mod packet;
/// Frame coalescing into encrypted datagrams.
pub mod packet_builder;
/// Per-space packet-number tracking, truncation, and key-phase handling.
pub mod packet_number;
/// Sorted, disjoint interval set used by the ack tracker and recv buffer.
pub mod range_set;
/// Circular reassembly buffer with holes, used by streams and crypto streams.
pub mod recv_buffer;
/// Connection-wide send scheduling: control flags and deadline-aware admission.
pub mod send;
/// Stateless retry/`NEW_TOKEN` token AEAD and rotating key store.
pub mod retry;
/// Sent-packet metadata tracked for loss detection, plus its pool.
pub mod sent_packet;
/// Stream state machines (send/recv), priority ordering, flow control.
pub mod stream;
/// Per-worker timer wheel tracking each connection's next deadline.
pub mod timer;
/// The `TlsEngine`/`Datapath` collaborator traits a host implements.
pub mod tls;
/// TLS transport-parameter TLV encode/decode.
pub mod transport_params;
/// QUIC variable-length integer codec.
pub mod varint;

/// Operation types and the per-connection multi-producer single-consumer queue.
pub mod operation;
/// Drains queued operations for a set of connections.
pub mod worker;

pub use connection::{Connection, ConnectionState};
pub use error::{QuicoreError, Result, TransportErrorCode};

/// quicore version string.
pub const VERSION: &str = "0.1.0";
