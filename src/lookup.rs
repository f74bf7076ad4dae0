// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-ID lookup table: routes an inbound datagram's destination
//! CID (or remote 4-tuple, for short-header packets before any CID is
//! known) to the connection it belongs to.
//!
//! Grounded on `original_source/src/core/lookup.h` (`QUIC_LOOKUP`): a
//! `Single`/`Hash`/`MultiHash` mode ladder that starts cheap for a lone
//! client connection and upgrades to partitioned hash tables once a
//! listener is added on the server side. Partitioning follows the
//! sharded-registry idiom in `engine::demux::TopicRegistry` (one
//! `parking_lot::RwLock` per shard instead of one lock over the whole
//! table); the remote-address hash table reuses a `dashmap::DashMap`
//! the same way.

use std::collections::HashMap;
use std::net::SocketAddr;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::cid::CID_PID_LENGTH;

#[derive(Hash, PartialEq, Eq, Clone)]
struct RemoteKey {
    remote: SocketAddr,
    remote_cid: Vec<u8>,
}

enum Table<C> {
    /// One client connection bound to this lookup; no CID keying needed
    /// since every datagram on the binding belongs to it. Keeps the CID
    /// around anyway so a later `maximize_partitioning` can reseat it.
    Single(Option<(Vec<u8>, C)>),
    Hash(HashMap<Vec<u8>, C>),
    MultiHash(Vec<RwLock<HashMap<Vec<u8>, C>>>),
}

/// Maps local CIDs (and, for the stateless-reset/4-tuple fallback path,
/// `(remote_addr, remote_cid)` pairs) to a connection handle `C`. `C` is
/// left opaque — the lookup never touches connection internals, it only
/// routes.
pub struct Lookup<C> {
    table: RwLock<Table<C>>,
    remote_hash: DashMap<RemoteKey, C>,
    server_prefix_len: usize,
}

impl<C: Clone> Lookup<C> {
    pub fn new(server_prefix_len: usize) -> Self {
        Self {
            table: RwLock::new(Table::Single(None)),
            remote_hash: DashMap::new(),
            server_prefix_len,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(&*self.table.read(), Table::MultiHash(_))
    }

    fn partition_of(&self, cid: &[u8], partition_count: usize) -> usize {
        let start = self.server_prefix_len;
        let end = start + CID_PID_LENGTH;
        if cid.len() < end || partition_count == 0 {
            return 0;
        }
        let pid = u16::from_be_bytes([cid[start], cid[end - 1]]);
        (pid as usize) % partition_count
    }

    /// Promotes `Single`/`Hash` mode to `MultiHash` with `partition_count`
    /// shards (`QuicLookupMaximizePartitioning`); a no-op if already
    /// partitioned. Called once a listener is registered on the binding.
    pub fn maximize_partitioning(&self, partition_count: u16) {
        let partition_count = partition_count.max(1) as usize;
        let mut table = self.table.write();
        if matches!(&*table, Table::MultiHash(_)) {
            return;
        }
        let mut partitions: Vec<RwLock<HashMap<Vec<u8>, C>>> =
            (0..partition_count).map(|_| RwLock::new(HashMap::new())).collect();
        match std::mem::replace(&mut *table, Table::MultiHash(Vec::new())) {
            Table::Single(Some((cid, conn))) => {
                let idx = self.partition_of(&cid, partition_count);
                partitions[idx].write().insert(cid, conn);
            }
            Table::Single(None) => {}
            Table::Hash(existing) => {
                for (cid, conn) in existing {
                    let idx = self.partition_of(&cid, partition_count);
                    partitions[idx].write().insert(cid, conn);
                }
            }
            Table::MultiHash(_) => unreachable!(),
        }
        *table = Table::MultiHash(partitions);
    }

    pub fn find_by_local_cid(&self, cid: &[u8]) -> Option<C> {
        match &*self.table.read() {
            Table::Single(entry) => entry.as_ref().filter(|(k, _)| k == cid).map(|(_, c)| c.clone()),
            Table::Hash(map) => map.get(cid).cloned(),
            Table::MultiHash(partitions) => {
                let idx = self.partition_of(cid, partitions.len());
                partitions[idx].read().get(cid).cloned()
            }
        }
    }

    /// Inserts `cid -> conn`. Returns the colliding connection on failure
    /// (`QuicLookupAddLocalCid`'s `Collision` out-param).
    pub fn add_local_cid(&self, cid: Vec<u8>, conn: C) -> Result<(), C> {
        let mut table = self.table.write();
        match &mut *table {
            Table::Single(entry @ None) => {
                *entry = Some((cid, conn));
                Ok(())
            }
            Table::Single(Some((existing_cid, existing_conn))) => {
                if *existing_cid == cid {
                    Err(existing_conn.clone())
                } else {
                    // A second connection is being bound to a client-only
                    // lookup: upgrade to Hash mode rather than reject it.
                    let mut map = HashMap::new();
                    map.insert(existing_cid.clone(), existing_conn.clone());
                    map.insert(cid, conn);
                    *table = Table::Hash(map);
                    Ok(())
                }
            }
            Table::Hash(map) => {
                if let Some(existing) = map.get(&cid) {
                    Err(existing.clone())
                } else {
                    map.insert(cid, conn);
                    Ok(())
                }
            }
            Table::MultiHash(partitions) => {
                let idx = self.partition_of(&cid, partitions.len());
                let mut shard = partitions[idx].write();
                if let Some(existing) = shard.get(&cid) {
                    Err(existing.clone())
                } else {
                    shard.insert(cid, conn);
                    Ok(())
                }
            }
        }
    }

    pub fn remove_local_cid(&self, cid: &[u8]) -> bool {
        match &mut *self.table.write() {
            Table::Single(entry @ Some(_)) if entry.as_ref().is_some_and(|(k, _)| k == cid) => {
                *entry = None;
                true
            }
            Table::Single(_) => false,
            Table::Hash(map) => map.remove(cid).is_some(),
            Table::MultiHash(partitions) => {
                let idx = self.partition_of(cid, partitions.len());
                partitions[idx].write().remove(cid).is_some()
            }
        }
    }

    pub fn find_by_remote_hash(&self, remote: SocketAddr, remote_cid: &[u8]) -> Option<C> {
        let key = RemoteKey { remote, remote_cid: remote_cid.to_vec() };
        self.remote_hash.get(&key).map(|entry| entry.value().clone())
    }

    pub fn add_remote_hash(
        &self,
        remote: SocketAddr,
        remote_cid: Vec<u8>,
        conn: C,
    ) -> Result<(), C> {
        let key = RemoteKey { remote, remote_cid };
        if let Some(existing) = self.remote_hash.get(&key) {
            return Err(existing.value().clone());
        }
        self.remote_hash.insert(key, conn);
        Ok(())
    }

    pub fn remove_remote_hash(&self, remote: SocketAddr, remote_cid: &[u8]) {
        let key = RemoteKey { remote, remote_cid: remote_cid.to_vec() };
        self.remote_hash.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn single_mode_finds_only_its_own_cid() {
        let lookup: Lookup<u64> = Lookup::new(0);
        lookup.add_local_cid(vec![1, 2, 3], 42).unwrap();
        assert_eq!(lookup.find_by_local_cid(&[1, 2, 3]), Some(42));
        assert_eq!(lookup.find_by_local_cid(&[9, 9, 9]), None);
    }

    #[test]
    fn second_insert_upgrades_single_to_hash() {
        let lookup: Lookup<u64> = Lookup::new(0);
        lookup.add_local_cid(vec![1], 1).unwrap();
        lookup.add_local_cid(vec![2], 2).unwrap();
        assert_eq!(lookup.find_by_local_cid(&[1]), Some(1));
        assert_eq!(lookup.find_by_local_cid(&[2]), Some(2));
    }

    #[test]
    fn duplicate_cid_returns_collision() {
        let lookup: Lookup<u64> = Lookup::new(0);
        lookup.add_local_cid(vec![1, 2, 3], 1).unwrap();
        let err = lookup.add_local_cid(vec![1, 2, 3], 2).unwrap_err();
        assert_eq!(err, 1);
    }

    #[test]
    fn maximize_partitioning_preserves_existing_entries() {
        let lookup: Lookup<u64> = Lookup::new(0);
        lookup.add_local_cid(vec![0, 5, 9, 9], 7).unwrap();
        lookup.maximize_partitioning(4);
        assert!(lookup.is_partitioned());
        assert_eq!(lookup.find_by_local_cid(&[0, 5, 9, 9]), Some(7));
    }

    #[test]
    fn partitioned_lookup_adds_and_removes() {
        let lookup: Lookup<u64> = Lookup::new(0);
        lookup.maximize_partitioning(4);
        lookup.add_local_cid(vec![0, 1, 1, 1], 10).unwrap();
        assert_eq!(lookup.find_by_local_cid(&[0, 1, 1, 1]), Some(10));
        assert!(lookup.remove_local_cid(&[0, 1, 1, 1]));
        assert_eq!(lookup.find_by_local_cid(&[0, 1, 1, 1]), None);
    }

    #[test]
    fn remote_hash_round_trips() {
        let lookup: Lookup<u64> = Lookup::new(0);
        lookup.add_remote_hash(addr(), vec![9, 9], 5).unwrap();
        assert_eq!(lookup.find_by_remote_hash(addr(), &[9, 9]), Some(5));
        lookup.remove_remote_hash(addr(), &[9, 9]);
        assert_eq!(lookup.find_by_remote_hash(addr(), &[9, 9]), None);
    }
}
