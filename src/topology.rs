// src/topology.rs

//! Cluster topology: the ordered peer vector, the 32707-slot consistent
//! hash table, and the probe-depth retry policy (spec.md §4.6). Grounded
//! on `spineldb::core::cluster::slot` (`NUM_SLOTS` + slot-to-node mapping
//! shape), generalized from a fixed 16384-slot Redis-style table to the
//! spec's 32707-slot machine-hash table, and on
//! `original_source/iocore/cluster/ClusterConfig.cc` for the
//! copy-on-write generation/settle-interval policy.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use murmur3::murmur3_32;
use parking_lot::RwLock;

/// Chosen so that hash distribution stays within ~1% even per
/// added/removed peer (spec.md §4.6).
pub const HASH_TABLE_SLOTS: usize = 32707;

/// How long a superseded configuration generation is kept reachable so
/// in-flight probes that already captured a pointer keep functioning
/// (spec.md §4.6).
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub ip: IpAddr,
    pub port: u16,
    pub id: u16,
    pub dead: bool,
}

/// One immutable topology snapshot: the peer vector plus its hash table.
/// Configuration updates publish a new `Generation` and link the old one
/// instead of mutating in place (spec.md §5 "effectively copy-on-write").
pub struct Generation {
    pub peers: Vec<PeerDescriptor>,
    table: Vec<u16>,
    pub created_at: Instant,
}

impl Generation {
    fn build(peers: Vec<PeerDescriptor>) -> Self {
        let mut table = vec![0u16; HASH_TABLE_SLOTS];
        if !peers.is_empty() {
            for (slot, entry) in table.iter_mut().enumerate() {
                *entry = (slot % peers.len()) as u16;
            }
        }
        Self { peers, table, created_at: Instant::now() }
    }

    fn bucket_for_hash(&self, hash: u32) -> Option<&PeerDescriptor> {
        if self.peers.is_empty() {
            return None;
        }
        let slot = (hash as usize) % HASH_TABLE_SLOTS;
        self.peers.get(self.table[slot] as usize)
    }
}

fn hash_key(key: &[u8]) -> u32 {
    murmur3_32(&mut std::io::Cursor::new(key), 0).unwrap_or(0)
}

/// Owns the current and recently superseded topology generations. Reads
/// take whatever `Arc<Generation>` they find and use it for the duration
/// of one operation (spec.md §5).
pub struct Topology {
    current: RwLock<Arc<Generation>>,
    retired: RwLock<Vec<(Arc<Generation>, Instant)>>,
    local_peer_id: u16,
    settle_interval: Duration,
}

impl Topology {
    pub fn new(local_peer_id: u16) -> Self {
        Self::with_settle_interval(local_peer_id, DEFAULT_SETTLE_INTERVAL)
    }

    pub fn with_settle_interval(local_peer_id: u16, settle_interval: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation::build(Vec::new()))),
            retired: RwLock::new(Vec::new()),
            local_peer_id,
            settle_interval,
        }
    }

    pub fn current(&self) -> Arc<Generation> {
        self.current.read().clone()
    }

    /// Publishes a new generation built off to the side, retiring the old
    /// one instead of mutating it (spec.md §4.6, SPEC_FULL `Topology::rebuild`).
    pub fn rebuild(&self, peers: Vec<PeerDescriptor>) {
        let new_gen = Arc::new(Generation::build(peers));
        let old = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, new_gen)
        };
        self.retired.write().push((old, Instant::now()));
        self.evict_settled();
    }

    fn evict_settled(&self) {
        let settle_interval = self.settle_interval;
        self.retired
            .write()
            .retain(|(_, retired_at)| retired_at.elapsed() < settle_interval);
    }

    /// `machine_hash(key) = peers[table[hash(key) mod 32707]]`
    /// (spec.md §4.6).
    pub fn machine_hash(&self, key: &[u8]) -> Option<PeerDescriptor> {
        let generation = self.current();
        generation.bucket_for_hash(hash_key(key)).cloned()
    }

    /// Walks configuration history up to `max_depth` generations to find
    /// a peer that is not this node, not already in `past_probes`, and
    /// not dead (spec.md §4.6 `machine_at_depth`).
    pub fn machine_at_depth(&self, key: &[u8], max_depth: usize, past_probes: &[IpAddr]) -> Option<PeerDescriptor> {
        let hash = hash_key(key);
        let mut candidates = vec![self.current()];
        {
            let retired = self.retired.read();
            candidates.extend(retired.iter().rev().take(max_depth.saturating_sub(1)).map(|(g, _)| g.clone()));
        }
        for generation in candidates {
            if let Some(peer) = generation.bucket_for_hash(hash) {
                if peer.id != self.local_peer_id && !peer.dead && !past_probes.contains(&peer.ip) {
                    return Some(peer.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u16, dead: bool) -> PeerDescriptor {
        PeerDescriptor {
            ip: IpAddr::from([10, 0, 0, id as u8]),
            port: 9000,
            id,
            dead,
        }
    }

    #[test]
    fn machine_hash_returns_none_with_no_peers() {
        let topo = Topology::new(0);
        assert!(topo.machine_hash(b"key").is_none());
    }

    #[test]
    fn machine_hash_is_deterministic_for_same_key() {
        let topo = Topology::new(0);
        topo.rebuild(vec![peer(1, false), peer(2, false), peer(3, false)]);
        let a = topo.machine_hash(b"mykey").unwrap();
        let b = topo.machine_hash(b"mykey").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn machine_at_depth_skips_dead_and_self_and_past_probes() {
        let topo = Topology::new(1);
        topo.rebuild(vec![peer(1, false), peer(2, true), peer(3, false)]);
        let result = topo.machine_at_depth(b"k", 1, &[]);
        if let Some(p) = result {
            assert_ne!(p.id, 1);
            assert!(!p.dead);
        }
    }

    #[test]
    fn rebuild_retires_old_generation_instead_of_mutating() {
        let topo = Topology::with_settle_interval(0, Duration::from_secs(3600));
        topo.rebuild(vec![peer(1, false)]);
        let first = topo.current();
        topo.rebuild(vec![peer(1, false), peer(2, false)]);
        let second = topo.current();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(topo.retired.read().len(), 1);
    }

    #[test]
    fn settled_generations_are_evicted_after_interval() {
        let topo = Topology::with_settle_interval(0, Duration::from_millis(0));
        topo.rebuild(vec![peer(1, false)]);
        topo.rebuild(vec![peer(1, false), peer(2, false)]);
        assert!(topo.retired.read().is_empty());
    }
}
