// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! QUIC frame type codes, encoding, and decoding (RFC 9000 §19).
//!
//! Grounded on `original_source/src/core/frame.h`: each `QUIC_*_EX`
//! struct there becomes one `Frame` variant here. The C side dispatches
//! on frame type with a free function per frame and out-parameter
//! structs; collapsing them into one sum type is the natural Rust
//! rendition of the same tagged-union idea used for RTPS submessages in
//! `protocol::rtps` (`SubMessage`-style per-kind encode/decode, folded
//! into a single enum with a `kind()`/`encode`/`decode` pair).

use crate::varint::{self, Cursor};

/// Wire type codes (RFC 9000 §19, `QUIC_FRAME_TYPE`).
pub mod frame_type {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    pub const ACK: u64 = 0x02;
    pub const ACK_ECN: u64 = 0x03;
    pub const RESET_STREAM: u64 = 0x04;
    pub const STOP_SENDING: u64 = 0x05;
    pub const CRYPTO: u64 = 0x06;
    pub const NEW_TOKEN: u64 = 0x07;
    pub const STREAM: u64 = 0x08; // low 3 bits are OFF/LEN/FIN, to 0x0f
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const CONNECTION_CLOSE: u64 = 0x1c;
    pub const CONNECTION_CLOSE_APP: u64 = 0x1d;
    pub const HANDSHAKE_DONE: u64 = 0x1e;
    pub const DATAGRAM: u64 = 0x30; // low bit is LEN, to 0x31
    pub const IMMEDIATE_ACK: u64 = 0xac;
    pub const ACK_FREQUENCY: u64 = 0xaf;
}

/// `true` for error codes in the "protocol error" band used by
/// performance counters (§7 propagation policy).
pub fn is_protocol_error(code: u64) -> bool {
    (0x3..=0xf).contains(&code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u64,
    pub ack_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckEcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_acknowledged: u64,
    pub ack_delay: u64,
    pub first_ack_range: u64,
    pub additional_ranges: Vec<AckRange>,
    pub ecn: Option<AckEcnCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub fin: bool,
    pub data: Vec<u8>,
}

/// Sum type over every QUIC frame this implementation understands.
/// `SentFrame` in the packet builder/loss-detection path is this same
/// type: what was sent is what may need to be retransmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding { count: u64 },
    Ping,
    Ack(AckFrame),
    ResetStream { stream_id: u64, error_code: u64, final_size: u64 },
    StopSending { stream_id: u64, error_code: u64 },
    Crypto { offset: u64, data: Vec<u8> },
    NewToken { token: Vec<u8> },
    Stream(StreamFrame),
    MaxData { maximum_data: u64 },
    MaxStreamData { stream_id: u64, maximum_data: u64 },
    MaxStreams { bidirectional: bool, maximum_streams: u64 },
    DataBlocked { data_limit: u64 },
    StreamDataBlocked { stream_id: u64, stream_data_limit: u64 },
    StreamsBlocked { bidirectional: bool, stream_limit: u64 },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        connection_id: Vec<u8>,
        stateless_reset_token: [u8; 16],
    },
    RetireConnectionId { sequence: u64 },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    ConnectionClose {
        application_closed: bool,
        error_code: u64,
        frame_type: u64,
        reason: Vec<u8>,
    },
    HandshakeDone,
    Datagram { data: Vec<u8> },
    ImmediateAck,
}

impl Frame {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Padding { count } => {
                for _ in 0..*count {
                    out.push(frame_type::PADDING as u8);
                }
            }
            Frame::Ping => varint::encode(frame_type::PING, out),
            Frame::Ack(ack) => encode_ack(ack, out),
            Frame::ResetStream { stream_id, error_code, final_size } => {
                varint::encode(frame_type::RESET_STREAM, out);
                varint::encode(*stream_id, out);
                varint::encode(*error_code, out);
                varint::encode(*final_size, out);
            }
            Frame::StopSending { stream_id, error_code } => {
                varint::encode(frame_type::STOP_SENDING, out);
                varint::encode(*stream_id, out);
                varint::encode(*error_code, out);
            }
            Frame::Crypto { offset, data } => {
                varint::encode(frame_type::CRYPTO, out);
                varint::encode(*offset, out);
                varint::encode(data.len() as u64, out);
                out.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                varint::encode(frame_type::NEW_TOKEN, out);
                varint::encode(token.len() as u64, out);
                out.extend_from_slice(token);
            }
            Frame::Stream(s) => encode_stream(s, out),
            Frame::MaxData { maximum_data } => {
                varint::encode(frame_type::MAX_DATA, out);
                varint::encode(*maximum_data, out);
            }
            Frame::MaxStreamData { stream_id, maximum_data } => {
                varint::encode(frame_type::MAX_STREAM_DATA, out);
                varint::encode(*stream_id, out);
                varint::encode(*maximum_data, out);
            }
            Frame::MaxStreams { bidirectional, maximum_streams } => {
                let ty = if *bidirectional {
                    frame_type::MAX_STREAMS_BIDI
                } else {
                    frame_type::MAX_STREAMS_UNI
                };
                varint::encode(ty, out);
                varint::encode(*maximum_streams, out);
            }
            Frame::DataBlocked { data_limit } => {
                varint::encode(frame_type::DATA_BLOCKED, out);
                varint::encode(*data_limit, out);
            }
            Frame::StreamDataBlocked { stream_id, stream_data_limit } => {
                varint::encode(frame_type::STREAM_DATA_BLOCKED, out);
                varint::encode(*stream_id, out);
                varint::encode(*stream_data_limit, out);
            }
            Frame::StreamsBlocked { bidirectional, stream_limit } => {
                let ty = if *bidirectional {
                    frame_type::STREAMS_BLOCKED_BIDI
                } else {
                    frame_type::STREAMS_BLOCKED_UNI
                };
                varint::encode(ty, out);
                varint::encode(*stream_limit, out);
            }
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => {
                varint::encode(frame_type::NEW_CONNECTION_ID, out);
                varint::encode(*sequence, out);
                varint::encode(*retire_prior_to, out);
                out.push(connection_id.len() as u8);
                out.extend_from_slice(connection_id);
                out.extend_from_slice(stateless_reset_token);
            }
            Frame::RetireConnectionId { sequence } => {
                varint::encode(frame_type::RETIRE_CONNECTION_ID, out);
                varint::encode(*sequence, out);
            }
            Frame::PathChallenge { data } => {
                varint::encode(frame_type::PATH_CHALLENGE, out);
                out.extend_from_slice(data);
            }
            Frame::PathResponse { data } => {
                varint::encode(frame_type::PATH_RESPONSE, out);
                out.extend_from_slice(data);
            }
            Frame::ConnectionClose {
                application_closed,
                error_code,
                frame_type,
                reason,
            } => {
                let ty = if *application_closed {
                    frame_type::CONNECTION_CLOSE_APP
                } else {
                    frame_type::CONNECTION_CLOSE
                };
                varint::encode(ty, out);
                varint::encode(*error_code, out);
                if !application_closed {
                    varint::encode(*frame_type, out);
                }
                varint::encode(reason.len() as u64, out);
                out.extend_from_slice(reason);
            }
            Frame::HandshakeDone => varint::encode(frame_type::HANDSHAKE_DONE, out),
            Frame::Datagram { data } => {
                varint::encode(frame_type::DATAGRAM | 0x1, out); // LEN bit set: explicit length
                varint::encode(data.len() as u64, out);
                out.extend_from_slice(data);
            }
            Frame::ImmediateAck => varint::encode(frame_type::IMMEDIATE_ACK, out),
        }
    }

    pub fn decode(cursor: &mut Cursor<'_>) -> Result<Self, &'static str> {
        let ty = cursor.get_varint().ok_or("truncated frame type")?;
        match ty {
            frame_type::PADDING => {
                let mut count = 1u64;
                while cursor.peek_rest().first() == Some(&0) {
                    cursor.advance(1).unwrap();
                    count += 1;
                }
                Ok(Frame::Padding { count })
            }
            frame_type::PING => Ok(Frame::Ping),
            frame_type::ACK | frame_type::ACK_ECN => decode_ack(ty, cursor),
            frame_type::RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: req(cursor.get_varint())?,
                error_code: req(cursor.get_varint())?,
                final_size: req(cursor.get_varint())?,
            }),
            frame_type::STOP_SENDING => Ok(Frame::StopSending {
                stream_id: req(cursor.get_varint())?,
                error_code: req(cursor.get_varint())?,
            }),
            frame_type::CRYPTO => {
                let offset = req(cursor.get_varint())?;
                let len = req(cursor.get_varint())? as usize;
                let data = req(cursor.get_bytes(len))?.to_vec();
                Ok(Frame::Crypto { offset, data })
            }
            frame_type::NEW_TOKEN => {
                let len = req(cursor.get_varint())? as usize;
                let token = req(cursor.get_bytes(len))?.to_vec();
                Ok(Frame::NewToken { token })
            }
            t if (frame_type::STREAM..=0x0f).contains(&t) => decode_stream(t, cursor),
            frame_type::MAX_DATA => Ok(Frame::MaxData {
                maximum_data: req(cursor.get_varint())?,
            }),
            frame_type::MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: req(cursor.get_varint())?,
                maximum_data: req(cursor.get_varint())?,
            }),
            frame_type::MAX_STREAMS_BIDI | frame_type::MAX_STREAMS_UNI => Ok(Frame::MaxStreams {
                bidirectional: ty == frame_type::MAX_STREAMS_BIDI,
                maximum_streams: req(cursor.get_varint())?,
            }),
            frame_type::DATA_BLOCKED => Ok(Frame::DataBlocked {
                data_limit: req(cursor.get_varint())?,
            }),
            frame_type::STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: req(cursor.get_varint())?,
                stream_data_limit: req(cursor.get_varint())?,
            }),
            frame_type::STREAMS_BLOCKED_BIDI | frame_type::STREAMS_BLOCKED_UNI => {
                Ok(Frame::StreamsBlocked {
                    bidirectional: ty == frame_type::STREAMS_BLOCKED_BIDI,
                    stream_limit: req(cursor.get_varint())?,
                })
            }
            frame_type::NEW_CONNECTION_ID => {
                let sequence = req(cursor.get_varint())?;
                let retire_prior_to = req(cursor.get_varint())?;
                let len = req(cursor.get_u8())? as usize;
                let connection_id = req(cursor.get_bytes(len))?.to_vec();
                let token_bytes = req(cursor.get_bytes(16))?;
                let mut stateless_reset_token = [0u8; 16];
                stateless_reset_token.copy_from_slice(token_bytes);
                Ok(Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                })
            }
            frame_type::RETIRE_CONNECTION_ID => Ok(Frame::RetireConnectionId {
                sequence: req(cursor.get_varint())?,
            }),
            frame_type::PATH_CHALLENGE | frame_type::PATH_RESPONSE => {
                let bytes = req(cursor.get_bytes(8))?;
                let mut data = [0u8; 8];
                data.copy_from_slice(bytes);
                if ty == frame_type::PATH_CHALLENGE {
                    Ok(Frame::PathChallenge { data })
                } else {
                    Ok(Frame::PathResponse { data })
                }
            }
            frame_type::CONNECTION_CLOSE | frame_type::CONNECTION_CLOSE_APP => {
                let application_closed = ty == frame_type::CONNECTION_CLOSE_APP;
                let error_code = req(cursor.get_varint())?;
                let frame_type_field = if application_closed {
                    0
                } else {
                    req(cursor.get_varint())?
                };
                let len = req(cursor.get_varint())? as usize;
                let reason = req(cursor.get_bytes(len))?.to_vec();
                Ok(Frame::ConnectionClose {
                    application_closed,
                    error_code,
                    frame_type: frame_type_field,
                    reason,
                })
            }
            frame_type::HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            t if (frame_type::DATAGRAM..=frame_type::DATAGRAM + 1).contains(&t) => {
                let has_len = t & 0x1 != 0;
                let data = if has_len {
                    let len = req(cursor.get_varint())? as usize;
                    req(cursor.get_bytes(len))?.to_vec()
                } else {
                    cursor.peek_rest().to_vec()
                };
                if !has_len {
                    cursor.advance(data.len()).unwrap();
                }
                Ok(Frame::Datagram { data })
            }
            frame_type::IMMEDIATE_ACK => Ok(Frame::ImmediateAck),
            _ => Err("unknown frame type"),
        }
    }
}

fn req<T>(v: Option<T>) -> Result<T, &'static str> {
    v.ok_or("truncated frame body")
}

fn encode_ack(ack: &AckFrame, out: &mut Vec<u8>) {
    let ty = if ack.ecn.is_some() {
        frame_type::ACK_ECN
    } else {
        frame_type::ACK
    };
    varint::encode(ty, out);
    varint::encode(ack.largest_acknowledged, out);
    varint::encode(ack.ack_delay, out);
    varint::encode(ack.additional_ranges.len() as u64, out);
    varint::encode(ack.first_ack_range, out);
    for r in &ack.additional_ranges {
        varint::encode(r.gap, out);
        varint::encode(r.ack_block, out);
    }
    if let Some(ecn) = &ack.ecn {
        varint::encode(ecn.ect0, out);
        varint::encode(ecn.ect1, out);
        varint::encode(ecn.ce, out);
    }
}

fn decode_ack(ty: u64, cursor: &mut Cursor<'_>) -> Result<Frame, &'static str> {
    let largest_acknowledged = req(cursor.get_varint())?;
    let ack_delay = req(cursor.get_varint())?;
    let range_count = req(cursor.get_varint())?;
    let first_ack_range = req(cursor.get_varint())?;
    let mut additional_ranges = Vec::with_capacity(range_count as usize);
    for _ in 0..range_count {
        let gap = req(cursor.get_varint())?;
        let ack_block = req(cursor.get_varint())?;
        additional_ranges.push(AckRange { gap, ack_block });
    }
    let ecn = if ty == frame_type::ACK_ECN {
        Some(AckEcnCounts {
            ect0: req(cursor.get_varint())?,
            ect1: req(cursor.get_varint())?,
            ce: req(cursor.get_varint())?,
        })
    } else {
        None
    };
    Ok(Frame::Ack(AckFrame {
        largest_acknowledged,
        ack_delay,
        first_ack_range,
        additional_ranges,
        ecn,
    }))
}

fn encode_stream(s: &StreamFrame, out: &mut Vec<u8>) {
    let off_bit = if s.offset != 0 { 0x4 } else { 0 };
    let fin_bit = if s.fin { 0x1 } else { 0 };
    let ty = frame_type::STREAM | 0x2 /* LEN always explicit */ | off_bit | fin_bit;
    varint::encode(ty, out);
    varint::encode(s.stream_id, out);
    if s.offset != 0 {
        varint::encode(s.offset, out);
    }
    varint::encode(s.data.len() as u64, out);
    out.extend_from_slice(&s.data);
}

fn decode_stream(ty: u64, cursor: &mut Cursor<'_>) -> Result<Frame, &'static str> {
    let off = ty & 0x4 != 0;
    let len_bit = ty & 0x2 != 0;
    let fin = ty & 0x1 != 0;
    let stream_id = req(cursor.get_varint())?;
    let offset = if off { req(cursor.get_varint())? } else { 0 };
    let data = if len_bit {
        let len = req(cursor.get_varint())? as usize;
        req(cursor.get_bytes(len))?.to_vec()
    } else {
        cursor.peek_rest().to_vec()
    };
    if !len_bit {
        cursor.advance(data.len()).unwrap();
    }
    Ok(Frame::Stream(StreamFrame {
        stream_id,
        offset,
        fin,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(f: Frame) {
        let mut buf = Vec::new();
        f.encode(&mut buf);
        let mut cursor = Cursor::new(&buf);
        let decoded = Frame::decode(&mut cursor).unwrap();
        assert_eq!(f, decoded);
        assert!(cursor.is_empty());
    }

    #[test]
    fn ping_and_handshake_done_round_trip() {
        round_trip(Frame::Ping);
        round_trip(Frame::HandshakeDone);
        round_trip(Frame::ImmediateAck);
    }

    #[test]
    fn ack_frame_with_ranges_round_trips() {
        round_trip(Frame::Ack(AckFrame {
            largest_acknowledged: 12,
            ack_delay: 100,
            first_ack_range: 2,
            additional_ranges: vec![AckRange { gap: 1, ack_block: 2 }],
            ecn: None,
        }));
    }

    #[test]
    fn ack_frame_with_ecn_round_trips() {
        round_trip(Frame::Ack(AckFrame {
            largest_acknowledged: 5,
            ack_delay: 0,
            first_ack_range: 0,
            additional_ranges: vec![],
            ecn: Some(AckEcnCounts { ect0: 3, ect1: 0, ce: 1 }),
        }));
    }

    #[test]
    fn stream_frame_with_offset_and_fin_round_trips() {
        round_trip(Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 1024,
            fin: true,
            data: b"payload".to_vec(),
        }));
    }

    #[test]
    fn stream_frame_zero_offset_round_trips_without_offset_field() {
        round_trip(Frame::Stream(StreamFrame {
            stream_id: 0,
            offset: 0,
            fin: false,
            data: b"hi".to_vec(),
        }));
    }

    #[test]
    fn connection_close_transport_vs_application_round_trip() {
        round_trip(Frame::ConnectionClose {
            application_closed: false,
            error_code: 0xA,
            frame_type: 0x08,
            reason: b"bad stream state".to_vec(),
        });
        round_trip(Frame::ConnectionClose {
            application_closed: true,
            error_code: 1,
            frame_type: 0,
            reason: vec![],
        });
    }

    #[test]
    fn new_connection_id_round_trips() {
        round_trip(Frame::NewConnectionId {
            sequence: 1,
            retire_prior_to: 0,
            connection_id: vec![1, 2, 3, 4, 5, 6, 7, 8],
            stateless_reset_token: [9u8; 16],
        });
    }

    #[test]
    fn max_streams_distinguishes_bidi_and_uni_wire_type() {
        let mut bidi = Vec::new();
        Frame::MaxStreams { bidirectional: true, maximum_streams: 10 }.encode(&mut bidi);
        assert_eq!(bidi[0], frame_type::MAX_STREAMS_BIDI as u8);
        let mut uni = Vec::new();
        Frame::MaxStreams { bidirectional: false, maximum_streams: 10 }.encode(&mut uni);
        assert_eq!(uni[0], frame_type::MAX_STREAMS_UNI as u8);
    }

    #[test]
    fn datagram_without_length_consumes_rest_of_packet() {
        let mut buf = Vec::new();
        varint::encode(frame_type::DATAGRAM, &mut buf); // LEN bit clear
        buf.extend_from_slice(b"trailing");
        let mut cursor = Cursor::new(&buf);
        let decoded = Frame::decode(&mut cursor).unwrap();
        assert_eq!(decoded, Frame::Datagram { data: b"trailing".to_vec() });
        assert!(cursor.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_frame_type() {
        let mut buf = Vec::new();
        varint::encode(0x40, &mut buf); // unused range
        let mut cursor = Cursor::new(&buf);
        assert!(Frame::decode(&mut cursor).is_err());
    }
}
