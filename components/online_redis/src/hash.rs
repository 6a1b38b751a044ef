use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Deterministic 64-bit hash of a routing key. Processes on different
/// hosts must agree on the mapping, so the std hasher (randomly seeded)
/// is not an option here.
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

const VIRTUAL_NODES: u32 = 128;

/// Consistent-hash ring over partition names. Each partition is placed on
/// the ring at `VIRTUAL_NODES` points so that adding or removing one only
/// remaps a proportional slice of the key space.
#[derive(Default)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&mut self, name: &str) {
        for replica in 0..VIRTUAL_NODES {
            let point = hash_key(&format!("{}#{}", name, replica));
            self.ring.insert(point, name.to_string());
        }
    }

    pub fn get_server(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let point = hash_key(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, name)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_key("u1"), hash_key("u1"));
        assert_ne!(hash_key("u1"), hash_key("u2"));
    }

    #[test]
    fn ring_routes_consistently() {
        let mut ring = HashRing::new();
        ring.add_server("p0");
        ring.add_server("p1");
        ring.add_server("p2");

        let first = ring.get_server("user-42").unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(ring.get_server("user-42").unwrap(), first);
        }
    }

    #[test]
    fn removing_is_not_supported_but_distribution_is_spread() {
        let mut ring = HashRing::new();
        ring.add_server("p0");
        ring.add_server("p1");

        let mut hits = std::collections::HashMap::new();
        for n in 0..1000 {
            let server = ring.get_server(&format!("uid{}", n)).unwrap().to_string();
            *hits.entry(server).or_insert(0usize) += 1;
        }
        assert_eq!(hits.len(), 2);
        assert!(hits.values().all(|count| *count > 200));
    }

    #[test]
    fn empty_ring_yields_none() {
        assert!(HashRing::new().get_server("anything").is_none());
    }
}
