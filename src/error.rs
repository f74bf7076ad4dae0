// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the connection core.
//!
//! Follows the hand-rolled `Display`/`std::error::Error` pattern used
//! elsewhere in this codebase rather than a derive-macro crate: each
//! variant carries exactly the context needed to build either a silent
//! drop or a `CONNECTION_CLOSE` frame (§7).

use std::fmt;

/// Result alias for fallible core operations.
pub type Result<T> = std::result::Result<T, QuicoreError>;

/// RFC 9000 §20.1 transport error codes, plus the crypto-error band
/// (`0x0100 | tls_alert`, RFC 9000 §20.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    /// `0x0100 | alert`, carries the raw TLS alert byte.
    Crypto(u8),
}

impl TransportErrorCode {
    /// Wire value per RFC 9000 §20.1 / §20.2.
    pub fn code(self) -> u64 {
        match self {
            Self::NoError => 0x0,
            Self::InternalError => 0x1,
            Self::ConnectionRefused => 0x2,
            Self::FlowControlError => 0x3,
            Self::StreamLimitError => 0x4,
            Self::StreamStateError => 0x5,
            Self::FinalSizeError => 0x6,
            Self::FrameEncodingError => 0x7,
            Self::TransportParameterError => 0x8,
            Self::ConnectionIdLimitError => 0x9,
            Self::ProtocolViolation => 0xA,
            Self::InvalidToken => 0xB,
            Self::ApplicationError => 0xC,
            Self::CryptoBufferExceeded => 0xD,
            Self::KeyUpdateError => 0xE,
            Self::AeadLimitReached => 0xF,
            Self::NoViablePath => 0x10,
            Self::Crypto(alert) => 0x0100 | u64::from(alert),
        }
    }

    /// Decode a wire error code back into a `TransportErrorCode`.
    pub fn from_code(code: u64) -> Self {
        match code {
            0x0 => Self::NoError,
            0x1 => Self::InternalError,
            0x2 => Self::ConnectionRefused,
            0x3 => Self::FlowControlError,
            0x4 => Self::StreamLimitError,
            0x5 => Self::StreamStateError,
            0x6 => Self::FinalSizeError,
            0x7 => Self::FrameEncodingError,
            0x8 => Self::TransportParameterError,
            0x9 => Self::ConnectionIdLimitError,
            0xA => Self::ProtocolViolation,
            0xB => Self::InvalidToken,
            0xC => Self::ApplicationError,
            0xD => Self::CryptoBufferExceeded,
            0xE => Self::KeyUpdateError,
            0xF => Self::AeadLimitReached,
            0x10 => Self::NoViablePath,
            c if (0x0100..=0x01ff).contains(&c) => Self::Crypto((c & 0xff) as u8),
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "no error"),
            Self::InternalError => write!(f, "internal error"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::FlowControlError => write!(f, "flow control error"),
            Self::StreamLimitError => write!(f, "stream limit error"),
            Self::StreamStateError => write!(f, "stream state error"),
            Self::FinalSizeError => write!(f, "final size error"),
            Self::FrameEncodingError => write!(f, "frame encoding error"),
            Self::TransportParameterError => write!(f, "transport parameter error"),
            Self::ConnectionIdLimitError => write!(f, "connection id limit error"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::InvalidToken => write!(f, "invalid token"),
            Self::ApplicationError => write!(f, "application error"),
            Self::CryptoBufferExceeded => write!(f, "crypto buffer exceeded"),
            Self::KeyUpdateError => write!(f, "key update error"),
            Self::AeadLimitReached => write!(f, "aead limit reached"),
            Self::NoViablePath => write!(f, "no viable path"),
            Self::Crypto(alert) => write!(f, "crypto error: tls alert {alert}"),
        }
    }
}

/// Internal error taxonomy (§7). Each variant maps to one row of the
/// propagation-policy table: decode/protocol/flow-control/stream-state
/// errors close the connection; crypto/key-unavailable/duplicate drop the
/// packet; resource exhaustion is either internal or surfaces as `Busy`.
#[derive(Debug)]
pub enum QuicoreError {
    /// Malformed frame or packet; closes with `FrameEncodingError`.
    Decode { context: &'static str },
    /// Frame illegal in the connection's current state; closes with
    /// `ProtocolViolation`.
    ProtocolViolation { context: &'static str },
    /// Peer exceeded an advertised limit; closes with `FlowControlError`.
    FlowControl { limit: u64, attempted: u64 },
    /// Frame illegal for the stream's current send/recv state; closes
    /// with `StreamStateError`.
    StreamState { stream_id: u64, context: &'static str },
    /// AEAD authentication or key-derivation failure; packet dropped
    /// silently, connection closed only after repeated failures.
    Crypto { context: &'static str },
    /// Decryption deferred because the relevant keys are not yet derived.
    KeyUnavailable,
    /// Allocation or queue-capacity failure.
    ResourceExhausted { context: &'static str },
    /// Catch-all for invariant violations that should never occur in a
    /// correct implementation.
    Internal { context: &'static str },
}

impl QuicoreError {
    /// The transport error code a `CONNECTION_CLOSE` should carry if this
    /// error is close-worthy (not all are — see §7 propagation policy).
    pub fn transport_code(&self) -> TransportErrorCode {
        match self {
            Self::Decode { .. } => TransportErrorCode::FrameEncodingError,
            Self::ProtocolViolation { .. } => TransportErrorCode::ProtocolViolation,
            Self::FlowControl { .. } => TransportErrorCode::FlowControlError,
            Self::StreamState { .. } => TransportErrorCode::StreamStateError,
            Self::Crypto { .. } => TransportErrorCode::AeadLimitReached,
            Self::KeyUnavailable => TransportErrorCode::InternalError,
            Self::ResourceExhausted { .. } => TransportErrorCode::InternalError,
            Self::Internal { .. } => TransportErrorCode::InternalError,
        }
    }

    /// `true` if this error should never reach the application as an
    /// error (wire-parse failures are local to the receive path, §7).
    pub fn is_wire_local(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::Crypto { .. } | Self::KeyUnavailable
        )
    }
}

impl fmt::Display for QuicoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode { context } => write!(f, "decode failure: {context}"),
            Self::ProtocolViolation { context } => write!(f, "protocol violation: {context}"),
            Self::FlowControl { limit, attempted } => write!(
                f,
                "flow control violation: attempted {attempted}, limit {limit}"
            ),
            Self::StreamState {
                stream_id,
                context,
            } => write!(f, "stream {stream_id} state error: {context}"),
            Self::Crypto { context } => write!(f, "crypto failure: {context}"),
            Self::KeyUnavailable => write!(f, "decryption key not yet available"),
            Self::ResourceExhausted { context } => write!(f, "resource exhausted: {context}"),
            Self::Internal { context } => write!(f, "internal error: {context}"),
        }
    }
}

impl std::error::Error for QuicoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_code_round_trip() {
        for code in [
            TransportErrorCode::NoError,
            TransportErrorCode::InternalError,
            TransportErrorCode::ConnectionRefused,
            TransportErrorCode::FlowControlError,
            TransportErrorCode::StreamLimitError,
            TransportErrorCode::StreamStateError,
            TransportErrorCode::FinalSizeError,
            TransportErrorCode::FrameEncodingError,
            TransportErrorCode::TransportParameterError,
            TransportErrorCode::ConnectionIdLimitError,
            TransportErrorCode::ProtocolViolation,
            TransportErrorCode::InvalidToken,
            TransportErrorCode::ApplicationError,
            TransportErrorCode::CryptoBufferExceeded,
            TransportErrorCode::KeyUpdateError,
            TransportErrorCode::AeadLimitReached,
            TransportErrorCode::NoViablePath,
            TransportErrorCode::Crypto(42),
        ] {
            assert_eq!(TransportErrorCode::from_code(code.code()), code);
        }
    }

    #[test]
    fn crypto_band_boundaries() {
        assert_eq!(TransportErrorCode::Crypto(0).code(), 0x0100);
        assert_eq!(TransportErrorCode::Crypto(0xff).code(), 0x01ff);
    }

    #[test]
    fn wire_local_errors_never_surface_to_app() {
        assert!(QuicoreError::KeyUnavailable.is_wire_local());
        assert!(!QuicoreError::Internal { context: "x" }.is_wire_local());
    }
}
