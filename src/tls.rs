// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS and packet-protection collaborator boundary.
//!
//! A real TLS 1.3 handshake stack is out of scope (§1 Non-goals): the
//! core only needs a narrow seam it can drive and test against. This
//! mirrors how the teacher keeps `Datapath`-style I/O behind a trait
//! rather than owning socket code directly. [`NullTlsEngine`] is the
//! test double named in that boundary: it reports the handshake
//! complete immediately and protects packets with a fixed, publicly
//! known key so plumbing tests never need real cryptography.

use crate::error::QuicoreError;
use crate::packet_number::EncryptLevel;

/// One handshake message ready to hand to the peer's crypto stream, or a
/// signal that keys for a new level became available.
#[derive(Debug, Clone)]
pub enum CryptoOutput {
    HandshakeData { level: EncryptLevel, data: Vec<u8> },
    KeysReady { level: EncryptLevel },
    HandshakeComplete,
}

/// Everything the connection needs from its TLS stack: driving the
/// handshake and protecting/unprotecting packets at each level.
pub trait TlsEngine {
    /// Feed received CRYPTO-frame bytes for `level` into the handshake.
    fn process_handshake_data(
        &mut self,
        level: EncryptLevel,
        data: &[u8],
    ) -> Result<Vec<CryptoOutput>, QuicoreError>;

    /// `true` once 1-RTT keys are installed in both directions and the
    /// peer's Finished has been validated.
    fn is_handshake_complete(&self) -> bool;

    /// Resumption ticket bytes, once the handshake has produced one.
    fn export_ticket(&self) -> Option<Vec<u8>>;

    /// AEAD-seal `payload` in place, appending the authentication tag,
    /// using `level`'s current write key.
    fn seal(
        &self,
        level: EncryptLevel,
        packet_number: u64,
        header: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<(), QuicoreError>;

    /// AEAD-open `ciphertext` in place (tag included), truncating it to
    /// the plaintext length on success.
    fn open(
        &self,
        level: EncryptLevel,
        packet_number: u64,
        header: &[u8],
        ciphertext: &mut Vec<u8>,
    ) -> Result<(), QuicoreError>;

    /// Header-protection mask for the given ciphertext sample (RFC 9001
    /// §5.4), always 5 bytes (1 for the first byte, 4 for the packet
    /// number field).
    fn header_protection_mask(&self, level: EncryptLevel, sample: &[u8]) -> [u8; 5];

    /// AEAD tag length in bytes, added on top of the plaintext length.
    fn aead_overhead(&self) -> usize;

    /// `true` if write keys for `level` have been installed.
    fn has_write_keys(&self, level: EncryptLevel) -> bool;
}

/// Test double: handshake is trivially "complete" from construction, and
/// every level is protected with the same fixed, widely known key. Never
/// use outside tests.
#[derive(Debug, Default)]
pub struct NullTlsEngine {
    ticket: Option<Vec<u8>>,
}

const NULL_TAG_LEN: usize = 16;
const NULL_TAG_BYTE: u8 = 0x42;

impl NullTlsEngine {
    pub fn new() -> Self {
        Self { ticket: None }
    }

    pub fn with_exported_ticket(ticket: Vec<u8>) -> Self {
        Self { ticket: Some(ticket) }
    }
}

impl TlsEngine for NullTlsEngine {
    fn process_handshake_data(
        &mut self,
        level: EncryptLevel,
        data: &[u8],
    ) -> Result<Vec<CryptoOutput>, QuicoreError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        // Echo a trivial fixed transcript: any input immediately yields
        // a canned response and flips every level to complete.
        Ok(vec![
            CryptoOutput::HandshakeData {
                level,
                data: vec![0u8; 1],
            },
            CryptoOutput::KeysReady { level: EncryptLevel::OneRtt },
            CryptoOutput::HandshakeComplete,
        ])
    }

    fn is_handshake_complete(&self) -> bool {
        true
    }

    fn export_ticket(&self) -> Option<Vec<u8>> {
        self.ticket.clone()
    }

    fn seal(
        &self,
        _level: EncryptLevel,
        _packet_number: u64,
        _header: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<(), QuicoreError> {
        payload.extend(std::iter::repeat(NULL_TAG_BYTE).take(NULL_TAG_LEN));
        Ok(())
    }

    fn open(
        &self,
        _level: EncryptLevel,
        _packet_number: u64,
        _header: &[u8],
        ciphertext: &mut Vec<u8>,
    ) -> Result<(), QuicoreError> {
        if ciphertext.len() < NULL_TAG_LEN {
            return Err(QuicoreError::Crypto { context: "ciphertext shorter than tag" });
        }
        let plaintext_len = ciphertext.len() - NULL_TAG_LEN;
        if ciphertext[plaintext_len..].iter().any(|&b| b != NULL_TAG_BYTE) {
            return Err(QuicoreError::Crypto { context: "tag mismatch" });
        }
        ciphertext.truncate(plaintext_len);
        Ok(())
    }

    fn header_protection_mask(&self, _level: EncryptLevel, _sample: &[u8]) -> [u8; 5] {
        [0u8; 5]
    }

    fn aead_overhead(&self) -> usize {
        NULL_TAG_LEN
    }

    fn has_write_keys(&self, _level: EncryptLevel) -> bool {
        true
    }
}

/// Where a completed outgoing datagram is handed off. Production wiring
/// (UDP sockets, GSO) is a collaborator concern; tests use an in-memory
/// queue.
pub trait Datapath {
    fn send_datagram(&mut self, bytes: &[u8]) -> Result<(), QuicoreError>;
}

#[derive(Debug, Default)]
pub struct QueueDatapath {
    pub sent: Vec<Vec<u8>>,
}

impl Datapath for QueueDatapath {
    fn send_datagram(&mut self, bytes: &[u8]) -> Result<(), QuicoreError> {
        self.sent.push(bytes.to_vec());
        Ok(())
    }
}
