//! # Key Routing
//!
//! Purpose: Map keys onto cluster members, either by plain modulo hashing or
//! by a consistent ring that keeps most keys in place when the member list
//! changes.

/// Virtual points per server on the consistent ring.
const RING_POINTS: usize = 100;

/// Route a key to a server index using FNV-1a hash modulo the member count.
///
/// Single-server case returns 0 (no hashing needed).
pub fn route_key(key: &[u8], server_count: usize) -> usize {
    if server_count <= 1 {
        return 0;
    }
    (fnv1a(key) as usize) % server_count
}

/// FNV-1a hash (32-bit).
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Consistent-hashing ring over the server identities.
#[derive(Debug, Clone)]
pub struct HashRing {
    // (point, server index) sorted by point.
    points: Vec<(u32, usize)>,
}

impl HashRing {
    /// Builds a ring with [`RING_POINTS`] virtual points per server.
    pub fn build(servers: &[String]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * RING_POINTS);
        for (idx, server) in servers.iter().enumerate() {
            for replica in 0..RING_POINTS {
                let label = format!("{server}-{replica}");
                points.push((fnv1a(label.as_bytes()), idx));
            }
        }
        points.sort_unstable();
        HashRing { points }
    }

    /// Returns the server index owning `key`: the first ring point at or
    /// after the key's hash, wrapping to the start.
    pub fn lookup(&self, key: &[u8]) -> usize {
        if self.points.is_empty() {
            return 0;
        }
        let hash = fnv1a(key);
        let pos = self.points.partition_point(|(point, _)| *point < hash);
        if pos == self.points.len() {
            self.points[0].1
        } else {
            self.points[pos].1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("cache{i}.example:11211")).collect()
    }

    #[test]
    fn single_server_always_zero() {
        assert_eq!(route_key(b"any-key", 1), 0);
        assert_eq!(route_key(b"", 1), 0);
    }

    #[test]
    fn deterministic() {
        assert_eq!(route_key(b"test-key", 3), route_key(b"test-key", 3));
        let ring = HashRing::build(&servers(3));
        assert_eq!(ring.lookup(b"test-key"), ring.lookup(b"test-key"));
    }

    #[test]
    fn distributes() {
        let mut counts = [0u32; 4];
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            counts[route_key(key.as_bytes(), 4)] += 1;
        }
        for count in &counts {
            assert!(*count > 100, "poor distribution: {counts:?}");
        }
    }

    #[test]
    fn ring_distributes() {
        let ring = HashRing::build(&servers(4));
        let mut counts = [0u32; 4];
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            counts[ring.lookup(key.as_bytes())] += 1;
        }
        for count in &counts {
            assert!(*count > 50, "poor ring distribution: {counts:?}");
        }
    }

    #[test]
    fn ring_mostly_stable_when_member_leaves() {
        let four = HashRing::build(&servers(4));
        let three = HashRing::build(&servers(3));
        let mut moved = 0;
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            let before = four.lookup(key.as_bytes());
            let after = three.lookup(key.as_bytes());
            if before < 3 && before != after {
                moved += 1;
            }
        }
        // Keys owned by the three surviving members should mostly stay put.
        assert!(moved < 500, "too many keys moved: {moved}");
    }

    #[test]
    fn empty_ring_falls_back_to_zero() {
        let ring = HashRing::build(&[]);
        assert_eq!(ring.lookup(b"key"), 0);
    }
}
