//! Consistent-hash ring over target virtual ids.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

/// Ring of `replicas` points per virtual id.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    ring: BTreeMap<u64, u32>,
    points: HashMap<u32, Vec<u64>>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: BTreeMap::new(),
            points: HashMap::new(),
        }
    }

    pub fn add(&mut self, virtual_id: u32) {
        if self.points.contains_key(&virtual_id) {
            return;
        }
        let hashes: Vec<u64> = (0..self.replicas)
            .map(|i| hash_key(&format!("{i}#{virtual_id}")))
            .collect();
        for &hash in &hashes {
            self.ring.insert(hash, virtual_id);
        }
        self.points.insert(virtual_id, hashes);
    }

    pub fn remove(&mut self, virtual_id: u32) {
        let Some(hashes) = self.points.remove(&virtual_id) else {
            return;
        };
        for hash in hashes {
            // A colliding point may since belong to another id.
            if self.ring.get(&hash) == Some(&virtual_id) {
                self.ring.remove(&hash);
            }
        }
    }

    /// Owner of the first point at or after `key`'s hash, wrapping around.
    pub fn get(&self, key: &str) -> Option<u32> {
        let hash = hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &vid)| vid)
    }

    pub fn contains(&self, virtual_id: u32) -> bool {
        self.points.contains_key(&virtual_id)
    }

    /// Number of distinct virtual ids.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
