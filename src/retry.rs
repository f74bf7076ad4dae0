// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stateless retry / `NEW_TOKEN` token AEAD, and the rotating key store
//! behind it.
//!
//! Grounded on `original_source/src/core/binding.h`'s `QUIC_TOKEN_CONTENTS`
//! and `QuicRetryTokenDecrypt`: an 8-byte authenticated header
//! (`is_new_token` + a 63-bit issue timestamp) used as AEAD associated
//! data, an encrypted body (`remote_address`, `original_dcid`), and a
//! 16-byte GCM tag. The nonce is the destination CID XOR-folded into 12
//! bytes rather than transmitted separately — the same CID the peer
//! already has to send back for MsQuic to derive the same nonce on
//! decrypt. Key rotation keeps `{current, current-1}` rotation windows
//! valid (§5), each window's key generated lazily and cached.
//!
//! The AES-256-GCM wrapper follows the one-shot `SealingKey`/`OpeningKey`
//! + fixed `NonceSequence` shape the teacher uses for DDS Security's
//! `AesGcmCipher` (`security/crypto/aes_gcm.rs`), rather than the
//! equivalent `LessSafeKey` convenience API.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use parking_lot::RwLock;
use rand::RngCore;
use ring::aead::{Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM};
use ring::error::Unspecified;

const IV_LEN: usize = 12;
const AUTHENTICATED_LEN: usize = 8;

struct FixedNonceSequence(Option<[u8; IV_LEN]>);

impl NonceSequence for FixedNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        let iv = self.0.take().ok_or(Unspecified)?;
        Nonce::try_assume_unique_for_key(&iv)
    }
}

/// Destination CID folded into a 12-byte AEAD nonce (§6): copy the first
/// 12 bytes, then XOR any remaining bytes in, wrapping mod 12. A CID
/// shorter than 12 bytes is zero-padded.
fn fold_cid_into_iv(cid: &[u8]) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    if cid.len() >= IV_LEN {
        iv.copy_from_slice(&cid[..IV_LEN]);
        for (i, &byte) in cid[IV_LEN..].iter().enumerate() {
            iv[i % IV_LEN] ^= byte;
        }
    } else {
        iv[..cid.len()].copy_from_slice(cid);
    }
    iv
}

fn seal(key_bytes: &[u8; 32], iv: [u8; IV_LEN], aad: &[u8], plaintext: &mut Vec<u8>) {
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes).expect("32-byte key");
    let mut sealing = SealingKey::new(unbound, FixedNonceSequence(Some(iv)));
    sealing
        .seal_in_place_append_tag(Aad::from(aad), plaintext)
        .expect("retry token encryption cannot fail with a valid key/nonce");
}

fn open<'a>(key_bytes: &[u8; 32], iv: [u8; IV_LEN], aad: &[u8], ciphertext: &'a mut [u8]) -> Option<&'a [u8]> {
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes).ok()?;
    let mut opening = OpeningKey::new(unbound, FixedNonceSequence(Some(iv)));
    opening.open_in_place(Aad::from(aad), ciphertext).ok().map(|p| &*p)
}

/// Holds the rotating stateless-retry keys. Windows are indexed by
/// `timestamp_ms / rotation_ms`; only the current and immediately
/// preceding window are kept valid for verification (§5), matching
/// `QuicLibraryGetStatelessRetryKeyForTimestamp`'s `{current, current-1}`
/// acceptance rule.
pub struct RetryKeyStore {
    rotation_ms: u64,
    keys: RwLock<HashMap<i64, [u8; 32]>>,
}

impl RetryKeyStore {
    pub fn new(rotation_ms: u64) -> Self {
        Self { rotation_ms: rotation_ms.max(1), keys: RwLock::new(HashMap::new()) }
    }

    fn window(&self, timestamp_ms: u64) -> i64 {
        (timestamp_ms / self.rotation_ms) as i64
    }

    /// Returns the key for `timestamp_ms`'s rotation window, generating a
    /// fresh random one the first time that window is observed, and
    /// dropping any window older than `current - 1`.
    fn key_for_window(&self, window: i64) -> [u8; 32] {
        if let Some(key) = self.keys.read().get(&window) {
            return *key;
        }
        let mut keys = self.keys.write();
        if let Some(key) = keys.get(&window) {
            return *key;
        }
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        keys.retain(|&w, _| w >= window - 1);
        keys.insert(window, key);
        key
    }

    /// The key to encrypt a new token with, at `now_ms`.
    pub fn current_key(&self, now_ms: u64) -> [u8; 32] {
        self.key_for_window(self.window(now_ms))
    }

    /// The key to verify a token issued at `issued_at_ms`, if its window
    /// is still within one rotation of `now_ms`; `None` rejects tokens
    /// older than the rotation interval (§9 scenario 6).
    pub fn key_for_verification(&self, issued_at_ms: u64, now_ms: u64) -> Option<[u8; 32]> {
        let now_window = self.window(now_ms);
        let token_window = self.window(issued_at_ms);
        if token_window > now_window || token_window < now_window - 1 {
            return None;
        }
        self.keys.read().get(&token_window).copied()
    }
}

/// A decoded, authenticated retry/`NEW_TOKEN` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryToken {
    pub is_new_token: bool,
    pub issued_at_ms: u64,
    pub remote_address: SocketAddr,
    pub original_dcid: Vec<u8>,
}

fn encode_body(remote: SocketAddr, original_dcid: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(20 + original_dcid.len());
    match remote {
        SocketAddr::V4(v4) => {
            body.push(4);
            body.extend_from_slice(&v4.ip().octets());
            body.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            body.push(6);
            body.extend_from_slice(&v6.ip().octets());
            body.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
    body.push(original_dcid.len() as u8);
    body.extend_from_slice(original_dcid);
    body
}

fn decode_body(body: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
    let (&tag, rest) = body.split_first()?;
    let (addr, rest) = match tag {
        4 => {
            let octets = rest.get(0..4)?;
            let port = rest.get(4..6)?;
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            (SocketAddr::from((ip, u16::from_be_bytes([port[0], port[1]]))), rest.get(6..)?)
        }
        6 => {
            let octets = rest.get(0..16)?;
            let port = rest.get(16..18)?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(octets);
            let ip = Ipv6Addr::from(raw);
            (SocketAddr::from((ip, u16::from_be_bytes([port[0], port[1]]))), rest.get(18..)?)
        }
        _ => return None,
    };
    let (&len, rest) = rest.split_first()?;
    let dcid = rest.get(..len as usize)?.to_vec();
    Some((addr, dcid))
}

/// Encrypts a retry token for `remote`/`original_dcid`, sealed under the
/// key store's current rotation window and the nonce derived from
/// `dest_cid` (the destination CID on the Retry/Initial packet this
/// token rides on).
pub fn generate_token(
    store: &RetryKeyStore,
    is_new_token: bool,
    now_ms: u64,
    remote: SocketAddr,
    original_dcid: &[u8],
    dest_cid: &[u8],
) -> Vec<u8> {
    let header: u64 = (now_ms << 1) | u64::from(is_new_token);
    let aad = header.to_be_bytes();
    let mut body = encode_body(remote, original_dcid);
    let key = store.current_key(now_ms);
    seal(&key, fold_cid_into_iv(dest_cid), &aad, &mut body);

    let mut token = Vec::with_capacity(AUTHENTICATED_LEN + body.len());
    token.extend_from_slice(&aad);
    token.extend_from_slice(&body);
    token
}

/// Decrypts and authenticates a token produced by [`generate_token`].
/// Returns `None` on a malformed token, an expired/unknown key window, or
/// a failed GCM tag check (`QuicRetryTokenDecrypt`'s `FALSE` return).
pub fn decrypt_token(
    store: &RetryKeyStore,
    now_ms: u64,
    token: &[u8],
    dest_cid: &[u8],
) -> Option<RetryToken> {
    if token.len() < AUTHENTICATED_LEN {
        return None;
    }
    let (aad, ciphertext) = token.split_at(AUTHENTICATED_LEN);
    let header = u64::from_be_bytes(aad.try_into().ok()?);
    let is_new_token = header & 1 == 1;
    let issued_at_ms = header >> 1;

    let key = store.key_for_verification(issued_at_ms, now_ms)?;
    let mut buf = ciphertext.to_vec();
    let plaintext = open(&key, fold_cid_into_iv(dest_cid), aad, &mut buf)?;
    let (remote_address, original_dcid) = decode_body(plaintext)?;
    Some(RetryToken { is_new_token, issued_at_ms, remote_address, original_dcid })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "203.0.113.7:4433".parse().unwrap()
    }

    #[test]
    fn round_trips_a_token() {
        let store = RetryKeyStore::new(60_000);
        let dcid = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let token = generate_token(&store, true, 1_000, remote(), &[0xaa; 8], &dcid);
        let decoded = decrypt_token(&store, 1_000, &token, &dcid).unwrap();
        assert!(decoded.is_new_token);
        assert_eq!(decoded.issued_at_ms, 1_000);
        assert_eq!(decoded.remote_address, remote());
        assert_eq!(decoded.original_dcid, vec![0xaa; 8]);
    }

    #[test]
    fn round_trips_an_ipv6_remote_address() {
        let store = RetryKeyStore::new(60_000);
        let dcid = [9u8; 10];
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let token = generate_token(&store, false, 0, v6, &[], &dcid);
        let decoded = decrypt_token(&store, 0, &token, &dcid).unwrap();
        assert_eq!(decoded.remote_address, v6);
        assert!(decoded.original_dcid.is_empty());
    }

    #[test]
    fn rejects_token_decrypted_with_mismatched_dest_cid() {
        let store = RetryKeyStore::new(60_000);
        let dcid = [1u8; 8];
        let token = generate_token(&store, true, 0, remote(), &[1, 2, 3], &dcid);
        assert!(decrypt_token(&store, 0, &token, &[9u8; 8]).is_none());
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let store = RetryKeyStore::new(60_000);
        let dcid = [1u8; 8];
        let mut token = generate_token(&store, true, 0, remote(), &[1, 2, 3], &dcid);
        let last = token.len() - 1;
        token[last] ^= 0x01;
        assert!(decrypt_token(&store, 0, &token, &dcid).is_none());
    }

    #[test]
    fn verifies_within_one_rotation_window_either_side() {
        let store = RetryKeyStore::new(1_000);
        let dcid = [1u8; 8];
        let token = generate_token(&store, true, 500, remote(), &[], &dcid);
        // Same window as issuance, and the window right after (current-1
        // still valid) both succeed.
        assert!(decrypt_token(&store, 500, &token, &dcid).is_some());
        assert!(decrypt_token(&store, 1_999, &token, &dcid).is_some());
    }

    #[test]
    fn rejects_token_older_than_the_rotation_interval() {
        let store = RetryKeyStore::new(1_000);
        let dcid = [1u8; 8];
        let token = generate_token(&store, true, 0, remote(), &[], &dcid);
        assert!(decrypt_token(&store, 2_001, &token, &dcid).is_none());
    }
}
