//! The placement ring: a consistent-hash ring with virtual nodes,
//! mapping placement keys to chunk servers.
//!
//! Grounded on the teacher's `database::sharding::ShardManager`
//! consistent-hash mode, generalized from a fixed shard count to a
//! dynamic server pool and switched from `DefaultHasher` (unstable
//! across processes) to `twox-hash`'s XXH64, since two independent
//! processes (router restarts, multiple routers) must agree on the
//! same placement for the same key.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hasher;

use parking_lot::RwLock;
use twox_hash::XxHash64;

use crate::error::{CoreError, CoreResult};

/// Number of virtual nodes generated per registered server.
pub const VIRTUAL_NODES_PER_SERVER: usize = 150;

fn hash_key(key: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct VirtualNode {
    hash: u64,
    server_id: String,
    virtual_index: u32,
}

impl Ord for VirtualNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.server_id.cmp(&other.server_id))
            .then_with(|| self.virtual_index.cmp(&other.virtual_index))
    }
}

impl PartialOrd for VirtualNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Immutable snapshot of the ring. A mutation builds a brand new
/// `RingState` and swaps it in atomically; readers never see a
/// partially updated ring.
#[derive(Debug, Clone, Default)]
struct RingState {
    nodes: Vec<VirtualNode>,
    addresses: HashMap<String, String>,
}

impl RingState {
    fn lookup(&self, key: &str) -> Option<String> {
        if self.nodes.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let idx = self
            .nodes
            .partition_point(|n| n.hash < hash);
        let node = if idx < self.nodes.len() {
            &self.nodes[idx]
        } else {
            &self.nodes[0]
        };
        Some(node.server_id.clone())
    }
}

/// The `(virtual_index, hash)` pairs a server's virtual nodes would
/// occupy, without touching any ring state. Used by the chunk-server
/// registration path to persist its `ring_nodes` rows independently
/// of whatever router-side `PlacementRing` happens to be running.
pub fn virtual_node_hashes(server_id: &str, count: usize) -> Vec<(u32, u64)> {
    (0..count)
        .map(|i| {
            let virtual_key = format!("{server_id}#{i}");
            (i as u32, hash_key(&virtual_key))
        })
        .collect()
}

/// The placement ring. Cheap to clone (wraps an `Arc`-free
/// reader/writer lock); one instance is shared across the router's
/// request handlers and background loops.
pub struct PlacementRing {
    state: RwLock<RingState>,
    virtual_nodes: usize,
}

impl Default for PlacementRing {
    fn default() -> Self {
        Self::new(VIRTUAL_NODES_PER_SERVER)
    }
}

impl PlacementRing {
    /// Create an empty ring with a configured virtual-node count.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            state: RwLock::new(RingState::default()),
            virtual_nodes,
        }
    }

    /// Register a server, generating its virtual nodes. Idempotent: a
    /// server already present has its address refreshed and its nodes
    /// rebuilt in place, so a duplicate `add` from a retried
    /// membership refresh is harmless.
    pub fn add(&self, server_id: &str, address: &str) {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        next.nodes.retain(|n| n.server_id != server_id);
        for i in 0..self.virtual_nodes {
            let virtual_key = format!("{server_id}#{i}");
            next.nodes.push(VirtualNode {
                hash: hash_key(&virtual_key),
                server_id: server_id.to_string(),
                virtual_index: i as u32,
            });
        }
        next.nodes.sort();
        next.addresses
            .insert(server_id.to_string(), address.to_string());
        *guard = next;
    }

    /// Remove a server and all of its virtual nodes.
    pub fn remove(&self, server_id: &str) {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        next.nodes.retain(|n| n.server_id != server_id);
        next.addresses.remove(server_id);
        *guard = next;
    }

    /// Map a placement key to the server that owns it.
    pub fn lookup(&self, key: &str) -> CoreResult<String> {
        self.state
            .read()
            .lookup(key)
            .ok_or(CoreError::NoServersAvailable)
    }

    /// Resolve a server id to its network address, if still registered.
    pub fn address_of(&self, server_id: &str) -> Option<String> {
        self.state.read().addresses.get(server_id).cloned()
    }

    /// Snapshot of every server currently on the ring, as
    /// `(server_id, address)` pairs.
    pub fn servers(&self) -> Vec<(String, String)> {
        self.state
            .read()
            .addresses
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    /// Number of distinct servers currently on the ring.
    pub fn server_count(&self) -> usize {
        self.state.read().addresses.len()
    }

    /// Whether a server id is currently registered on the ring.
    pub fn contains(&self, server_id: &str) -> bool {
        self.state.read().addresses.contains_key(server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_node_hashes_matches_what_add_builds() {
        let hashes = virtual_node_hashes("server-a", VIRTUAL_NODES_PER_SERVER);
        assert_eq!(hashes.len(), VIRTUAL_NODES_PER_SERVER);
        let expected = hash_key("server-a#0");
        assert_eq!(hashes[0], (0, expected));
    }

    #[test]
    fn empty_ring_fails_lookup() {
        let ring = PlacementRing::default();
        assert!(matches!(
            ring.lookup("anything"),
            Err(CoreError::NoServersAvailable)
        ));
    }

    #[test]
    fn lookup_is_deterministic() {
        let ring = PlacementRing::default();
        for i in 0..6 {
            ring.add(&format!("server-{i}"), &format!("10.0.0.{i}:9090"));
        }
        for key in ["a", "b", "chunk-1234", "file-9999"] {
            let first = ring.lookup(key).unwrap();
            let second = ring.lookup(key).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn add_is_idempotent() {
        let ring = PlacementRing::new(16);
        ring.add("server-a", "10.0.0.1:9090");
        let before = ring.servers();
        ring.add("server-a", "10.0.0.1:9090");
        ring.add("server-a", "10.0.0.1:9090");
        assert_eq!(ring.server_count(), 1);
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn remove_clears_all_virtual_nodes() {
        let ring = PlacementRing::default();
        ring.add("server-a", "10.0.0.1:9090");
        ring.add("server-b", "10.0.0.2:9090");
        ring.remove("server-a");
        assert!(!ring.contains("server-a"));
        // every lookup must now resolve to the sole remaining server
        for i in 0..100 {
            assert_eq!(ring.lookup(&format!("key-{i}")).unwrap(), "server-b");
        }
    }

    #[test]
    fn distribution_is_roughly_uniform_across_six_servers() {
        let ring = PlacementRing::default();
        let servers: Vec<String> = (0..6).map(|i| format!("server-{i}")).collect();
        for (i, s) in servers.iter().enumerate() {
            ring.add(s, &format!("10.0.0.{i}:9090"));
        }

        let mut counts: HashMap<String, u64> = HashMap::new();
        let n = 20_000;
        for i in 0..n {
            let key = format!("chunk-{i}");
            let owner = ring.lookup(&key).unwrap();
            *counts.entry(owner).or_insert(0) += 1;
        }

        let mean = n as f64 / servers.len() as f64;
        let variance = counts
            .values()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / servers.len() as f64;
        let cv = variance.sqrt() / mean;
        assert!(cv < 0.15, "coefficient of variation too high: {cv}");

        for (server, count) in &counts {
            let share = *count as f64 / n as f64;
            assert!(
                (0.10..=0.25).contains(&share),
                "server {server} received {share:.3} of lookups"
            );
        }
    }

    #[test]
    fn removing_one_server_displaces_roughly_one_over_n_of_keys() {
        let ring = PlacementRing::default();
        let servers: Vec<String> = (0..6).map(|i| format!("server-{i}")).collect();
        for (i, s) in servers.iter().enumerate() {
            ring.add(s, &format!("10.0.0.{i}:9090"));
        }

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{i}")).collect();
        let before: HashMap<String, String> = keys
            .iter()
            .map(|k| (k.clone(), ring.lookup(k).unwrap()))
            .collect();

        ring.remove(&servers[0]);

        let moved = keys
            .iter()
            .filter(|k| ring.lookup(k).unwrap() != before[*k])
            .count();
        let fraction = moved as f64 / keys.len() as f64;
        // expected ~1/6 (~0.167); allow slack up to 1/N + 5pp
        assert!(fraction <= 1.0 / 6.0 + 0.05, "moved fraction {fraction}");
    }

    #[test]
    fn adding_one_server_displaces_roughly_one_over_n_plus_one_of_keys() {
        let ring = PlacementRing::default();
        let servers: Vec<String> = (0..6).map(|i| format!("server-{i}")).collect();
        for (i, s) in servers.iter().enumerate() {
            ring.add(s, &format!("10.0.0.{i}:9090"));
        }

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{i}")).collect();
        let before: HashMap<String, String> = keys
            .iter()
            .map(|k| (k.clone(), ring.lookup(k).unwrap()))
            .collect();

        ring.add("server-6", "10.0.0.6:9090");

        let moved = keys
            .iter()
            .filter(|k| ring.lookup(k).unwrap() != before[*k])
            .count();
        let fraction = moved as f64 / keys.len() as f64;
        assert!(fraction <= 1.0 / 7.0 + 0.05, "moved fraction {fraction}");
    }
}
