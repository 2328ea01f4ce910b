//! Hashing utilities for shardkv
//!
//! - BLAKE3 for stable key-to-shard mapping
//! - Random 64-bit client ids

use crate::common::NSHARDS;

/// Compute the shard for a key.
///
/// The mapping is a stable hash shared with the shard master: the same key
/// lands on the same shard on every replica, across restarts and versions.
pub fn key2shard(key: &str) -> usize {
    let hash = blake3::hash(key.as_bytes());
    let hash_u64 = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
    (hash_u64 % NSHARDS as u64) as usize
}

/// Draw a fresh client id.
///
/// 64 bits of randomness make collisions between concurrent clients
/// astronomically unlikely, so no registry of issued ids is kept.
pub fn generate_client_id() -> u64 {
    rand::random::<u64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key2shard_deterministic() {
        let shard1 = key2shard("test-key");
        let shard2 = key2shard("test-key");
        assert_eq!(shard1, shard2);
    }

    #[test]
    fn test_key2shard_in_range() {
        for i in 0..1000 {
            let shard = key2shard(&format!("key-{}", i));
            assert!(shard < NSHARDS);
        }
    }

    #[test]
    fn test_key2shard_spreads() {
        let mut seen = [false; NSHARDS];
        for i in 0..1000 {
            seen[key2shard(&format!("key-{}", i))] = true;
        }
        assert!(seen.iter().all(|s| *s), "1000 keys should touch every shard");
    }

    #[test]
    fn test_client_ids_distinct() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_ne!(a, b);
    }
}
