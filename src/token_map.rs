//! The token-to-replica ring used by the token-aware load-balancing policy.
//!
//! An immutable snapshot of the partitioner, per-keyspace replication
//! strategy, and ring, replaced wholesale on schema changes and held by
//! every processor via a shared pointer. `token_map.hpp`/`.cpp` themselves
//! are not present in `original_source/` (only `token_aware_policy.hpp`,
//! which consumes a `TokenMap*`); this module is grounded on that
//! consumer's contract plus a copy-on-write-snapshot discipline used
//! throughout this crate rather than on a line-for-line port.

use std::{collections::BTreeMap, sync::Arc};

use crate::host::{Address, Host};

/// A token position on the ring. Kept as an opaque signed 64-bit value
/// since computing one from a partition key (Murmur3/RandomPartitioner
/// hashing) is part of the wire codec this crate does not implement;
/// routing keys already carry a precomputed token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub i64);

/// A single keyspace's replication strategy, only as much as replica
/// placement needs.
#[derive(Clone, Debug)]
pub enum ReplicationStrategy {
    SimpleStrategy { replication_factor: usize },
    NetworkTopologyStrategy { replication_factor_per_dc: Vec<(String, usize)> },
}

/// Immutable snapshot of the ring for one keyspace: every token's owning
/// host in ring order, enough to compute a replica set for a given token.
#[derive(Clone, Debug)]
struct KeyspaceRing {
    strategy: ReplicationStrategy,
    ring: BTreeMap<Token, Arc<Host>>,
}

impl KeyspaceRing {
    fn replicas_for_token(&self, token: Token) -> Vec<Arc<Host>> {
        if self.ring.is_empty() {
            return Vec::new();
        }

        let replication_factor = match &self.strategy {
            ReplicationStrategy::SimpleStrategy { replication_factor } => *replication_factor,
            ReplicationStrategy::NetworkTopologyStrategy { replication_factor_per_dc } => {
                replication_factor_per_dc.iter().map(|(_, rf)| *rf).sum()
            }
        }
        .min(self.ring.len());

        let mut replicas = Vec::with_capacity(replication_factor);
        let mut seen = std::collections::HashSet::new();

        // Walk the ring starting at `token`, wrapping once, collecting
        // distinct hosts up to `replication_factor`.
        let owners: Vec<Arc<Host>> = self
            .ring
            .range(token..)
            .chain(self.ring.range(..token))
            .map(|(_, host)| host.clone())
            .collect();
        for host in owners {
            if replicas.len() >= replication_factor {
                break;
            }
            if seen.insert(host.address) {
                replicas.push(host);
            }
        }
        replicas
    }
}

/// The full, immutable token map: one ring per keyspace, plus the
/// partitioner name reported by `system.local`.
#[derive(Clone, Debug)]
pub struct TokenMap {
    partitioner: String,
    keyspaces: BTreeMap<String, Arc<KeyspaceRing>>,
}

impl TokenMap {
    pub fn empty(partitioner: impl Into<String>) -> Self {
        Self { partitioner: partitioner.into(), keyspaces: BTreeMap::new() }
    }

    pub fn partitioner(&self) -> &str {
        &self.partitioner
    }

    pub fn set_keyspace_ring(
        &mut self,
        keyspace: impl Into<String>,
        strategy: ReplicationStrategy,
        ring: BTreeMap<Token, Arc<Host>>,
    ) {
        self.keyspaces.insert(keyspace.into(), Arc::new(KeyspaceRing { strategy, ring }));
    }

    /// Returns the replica set for `token` in `keyspace`, in ring order
    /// starting at `token`, without shuffling; the token-aware policy
    /// shuffles itself when `token_aware_shuffle_replicas` is enabled.
    pub fn replicas_for_token(&self, keyspace: &str, token: Token) -> Vec<Arc<Host>> {
        match self.keyspaces.get(keyspace) {
            Some(ring) => ring.replicas_for_token(token),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(n: u8) -> Arc<Host> {
        Arc::new(Host::new(Address::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)), 9042)))
    }

    #[test]
    fn replicas_wrap_around_the_ring() {
        let mut map = TokenMap::empty("Murmur3Partitioner");
        let mut ring = BTreeMap::new();
        ring.insert(Token(0), host(1));
        ring.insert(Token(100), host(2));
        ring.insert(Token(200), host(3));
        map.set_keyspace_ring("ks", ReplicationStrategy::SimpleStrategy { replication_factor: 2 }, ring);

        let replicas = map.replicas_for_token("ks", Token(250));
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].address, host(1).address);
        assert_eq!(replicas[1].address, host(2).address);
    }

    #[test]
    fn unknown_keyspace_returns_no_replicas() {
        let map = TokenMap::empty("Murmur3Partitioner");
        assert!(map.replicas_for_token("missing", Token(0)).is_empty());
    }
}
