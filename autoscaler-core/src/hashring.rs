//! Consistent hash ring used by the HA coordinator's consistent-hash
//! `PoolFilter` (§4.7). A pure, synchronously-rebuildable data structure:
//! the coordinator owns the pool-discovery loop and swaps the ring
//! atomically on every membership change.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Virtual nodes per member. 113 spreads load evenly for pool sizes in the
/// tens without making ring rebuilds expensive.
pub const DEFAULT_VNODES: usize = 113;

fn hash64(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// A consistent hash ring mapping keys to members.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    vnodes: usize,
    // point on ring -> member id
    ring: BTreeMap<u64, String>,
    members: Vec<String>,
}

impl HashRing {
    pub fn new(members: &[String], vnodes: usize) -> Self {
        let mut ring = BTreeMap::new();
        for member in members {
            for v in 0..vnodes {
                let point = hash64(format!("{member}#{v}").as_bytes());
                ring.insert(point, member.clone());
            }
        }
        Self {
            vnodes,
            ring,
            members: members.to_vec(),
        }
    }

    pub fn with_default_vnodes(members: &[String]) -> Self {
        Self::new(members, DEFAULT_VNODES)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Returns the member that owns `key`, walking clockwise from its hash.
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let point = hash64(key.as_bytes());
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// Keeps only the keys owned by `local_member`.
    pub fn filter_owned(&self, keys: &[String], local_member: &str) -> Vec<String> {
        keys.iter()
            .filter(|k| self.owner(k) == Some(local_member))
            .cloned()
            .collect()
    }

    /// Per-member count of keys currently owned, for observability.
    pub fn load_counts(&self, keys: &[String]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for member in &self.members {
            counts.insert(member.clone(), 0);
        }
        for key in keys {
            if let Some(owner) = self.owner(key) {
                *counts.entry(owner.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("policy-{i}")).collect()
    }

    #[test]
    fn removing_a_remote_member_never_moves_local_keys_away() {
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let before = HashRing::with_default_vnodes(&members);
        let keys = ids(200);
        let owned_before: Vec<String> = before.filter_owned(&keys, "b");

        let members_after = vec!["a".to_string(), "b".to_string()];
        let after = HashRing::with_default_vnodes(&members_after);
        let owned_after: Vec<String> = after.filter_owned(&keys, "b");

        for key in &owned_before {
            assert!(
                owned_after.contains(key),
                "key {key} should still belong to b after c leaves"
            );
        }
    }

    #[test]
    fn adding_a_member_only_moves_a_bounded_share_off_each_existing_member() {
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let before = HashRing::with_default_vnodes(&members);
        let keys = ids(300);
        let owned_before = before.filter_owned(&keys, "b");

        let members_after = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let after = HashRing::with_default_vnodes(&members_after);
        let owned_after = after.filter_owned(&keys, "b");

        let moved_off: usize = owned_before
            .iter()
            .filter(|k| !owned_after.contains(k))
            .count();
        let bound = keys.len().div_ceil(members_after.len());
        assert!(
            moved_off <= bound,
            "moved {moved_off} keys off b, expected at most {bound}"
        );
    }

    #[test]
    fn filter_is_deterministic() {
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ring = HashRing::with_default_vnodes(&members);
        let keys = ids(10);
        let once = ring.filter_owned(&keys, "b");
        let twice = ring.filter_owned(&keys, "b");
        assert_eq!(once, twice);
    }
}
