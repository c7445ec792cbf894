//! The IPAM engine (C3): a tree of prefixes, each with a pool of allocated
//! host addresses, supporting contiguous first-fit sub-prefix carving and
//! address acquisition.
//!
//! The tree itself is held in memory here; `wirety-server`'s repository
//! layer is responsible for making each mutating operation transactional
//! with respect to its backing store (§4.1: "all operations are
//! transactional with respect to the repository").

use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::IpamError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPrefix {
    pub cidr: IpNet,
    pub parent_cidr: Option<IpNet>,
    pub allocated_ips: BTreeSet<IpAddr>,
}

impl IpamPrefix {
    fn new(cidr: IpNet, parent_cidr: Option<IpNet>) -> Self {
        Self {
            cidr,
            parent_cidr,
            allocated_ips: BTreeSet::new(),
        }
    }
}

/// Prefix tree for a single root (one per network). Allocation linearizes
/// through `&mut self`; callers wanting finer-grained concurrency can hold
/// one `PrefixTree` per root behind its own mutex, as §4.1 allows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefixTree {
    prefixes: HashMap<IpNet, IpamPrefix>,
    root: Option<IpNet>,
}

impl PrefixTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrates a tree from a repository snapshot (list of prefixes with
    /// their allocated addresses).
    pub fn from_prefixes(root: IpNet, prefixes: Vec<IpamPrefix>) -> Self {
        let mut map = HashMap::with_capacity(prefixes.len());
        for p in prefixes {
            map.insert(p.cidr, p);
        }
        Self {
            prefixes: map,
            root: Some(root),
        }
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &IpamPrefix> {
        self.prefixes.values()
    }

    /// Idempotent: creates the root prefix if absent, returns it either way.
    pub fn ensure_root(&mut self, cidr: IpNet) -> &IpamPrefix {
        let root = *self.prefixes.entry(cidr).or_insert_with(|| IpamPrefix::new(cidr, None));
        self.root = Some(root.cidr);
        &self.prefixes[&cidr]
    }

    fn children_of(&self, parent: &IpNet) -> impl Iterator<Item = &IpamPrefix> {
        self.prefixes
            .values()
            .filter(move |p| p.parent_cidr.as_ref() == Some(parent))
    }

    fn require(&self, cidr: &IpNet) -> Result<&IpamPrefix, IpamError> {
        self.prefixes
            .get(cidr)
            .ok_or_else(|| IpamError::PrefixNotFound(cidr.to_string()))
    }

    /// Carves the next unused contiguous sub-prefix of `prefix_len` out of
    /// `parent`, first-fit over candidate subnets in address order.
    pub fn acquire_child_prefix(
        &mut self,
        parent: IpNet,
        prefix_len: u8,
    ) -> Result<IpNet, IpamError> {
        self.require(&parent)?;
        if prefix_len < parent.prefix_len() {
            return Err(IpamError::InvalidCidr(format!(
                "{prefix_len} is shorter than parent prefix {}",
                parent.prefix_len()
            )));
        }

        let existing: Vec<IpNet> = self.children_of(&parent).map(|c| c.cidr).collect();
        let candidate = parent
            .subnets(prefix_len)
            .map_err(|_| IpamError::InvalidCidr(parent.to_string()))?
            .find(|candidate| !existing.iter().any(|e| overlaps(e, candidate)))
            .ok_or_else(|| IpamError::PrefixExhausted(parent.to_string()))?;

        self.prefixes
            .insert(candidate, IpamPrefix::new(candidate, Some(parent)));
        Ok(candidate)
    }

    /// Carves exactly `cidr` out of `parent`; fails if it overlaps any
    /// sibling already carved from `parent`.
    pub fn acquire_specific_child_prefix(
        &mut self,
        parent: IpNet,
        cidr: IpNet,
    ) -> Result<IpNet, IpamError> {
        self.require(&parent)?;
        if !subnet_within(&cidr, &parent) {
            return Err(IpamError::InvalidCidr(format!(
                "{cidr} is not contained in {parent}"
            )));
        }
        if self.children_of(&parent).any(|c| overlaps(&c.cidr, &cidr)) {
            return Err(IpamError::CidrOverlap(cidr.to_string()));
        }

        self.prefixes
            .insert(cidr, IpamPrefix::new(cidr, Some(parent)));
        Ok(cidr)
    }

    /// Frees `cidr` only if it has no allocated descendants or addresses.
    pub fn release_child_prefix(&mut self, cidr: IpNet) -> Result<(), IpamError> {
        let prefix = self.require(&cidr)?;
        if !prefix.allocated_ips.is_empty() || self.children_of(&cidr).next().is_some() {
            return Err(IpamError::PrefixNotEmpty(cidr.to_string()));
        }
        self.prefixes.remove(&cidr);
        Ok(())
    }

    /// Next unallocated address in `cidr`, skipping network/broadcast for
    /// IPv4 prefixes wider than a /31.
    pub fn acquire_ip(&mut self, cidr: IpNet) -> Result<IpAddr, IpamError> {
        let prefix = self
            .prefixes
            .get(&cidr)
            .ok_or_else(|| IpamError::PrefixNotFound(cidr.to_string()))?;

        let skip_edges = matches!(cidr, IpNet::V4(v4) if v4.prefix_len() < 31);
        let candidate = cidr
            .hosts()
            .filter(|ip| {
                if !skip_edges {
                    return true;
                }
                *ip != cidr.network() && *ip != cidr.broadcast()
            })
            .find(|ip| !prefix.allocated_ips.contains(ip))
            .ok_or_else(|| IpamError::IpExhausted(cidr.to_string()))?;

        self.prefixes.get_mut(&cidr).unwrap().allocated_ips.insert(candidate);
        Ok(candidate)
    }

    pub fn release_ip(&mut self, cidr: IpNet, ip: IpAddr) -> Result<(), IpamError> {
        let prefix = self
            .prefixes
            .get_mut(&cidr)
            .ok_or_else(|| IpamError::PrefixNotFound(cidr.to_string()))?;
        prefix.allocated_ips.remove(&ip);
        Ok(())
    }

    /// Probe-only: finds the smallest prefix length whose usable host count
    /// covers `max_peers` (never shorter than /8), carves `count`
    /// non-overlapping candidates of that size from `base`, then deletes
    /// them again so the call leaves the allocator untouched.
    pub fn suggest_cidrs(
        &mut self,
        base: IpNet,
        max_peers: u32,
        count: usize,
    ) -> Result<Vec<IpNet>, IpamError> {
        self.require(&base)?;
        let host_bits = (max_peers.max(1) + 2).next_power_of_two().trailing_zeros();
        let prefix_len = (32u32.saturating_sub(host_bits)).max(8) as u8;

        let mut carved = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire_child_prefix(base, prefix_len) {
                Ok(cidr) => carved.push(cidr),
                Err(e) => {
                    for c in &carved {
                        let _ = self.release_child_prefix(*c);
                    }
                    return Err(e);
                },
            }
        }
        for c in &carved {
            self.release_child_prefix(*c)
                .expect("probe allocation just carved has no descendants");
        }
        Ok(carved)
    }
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || a.contains(&b.broadcast()) || b.contains(&a.network()) || b.contains(&a.broadcast())
}

fn subnet_within(child: &IpNet, parent: &IpNet) -> bool {
    parent.contains(&child.network()) && parent.contains(&child.broadcast())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn acquire_child_prefix_is_first_fit_and_contiguous() {
        let mut tree = PrefixTree::new();
        tree.ensure_root(cidr("10.10.0.0/16"));
        let a = tree.acquire_child_prefix(cidr("10.10.0.0/16"), 24).unwrap();
        let b = tree.acquire_child_prefix(cidr("10.10.0.0/16"), 24).unwrap();
        assert_eq!(a, cidr("10.10.0.0/24"));
        assert_eq!(b, cidr("10.10.1.0/24"));
    }

    #[test]
    fn acquire_specific_child_prefix_rejects_overlap() {
        let mut tree = PrefixTree::new();
        tree.ensure_root(cidr("10.10.0.0/16"));
        tree.acquire_specific_child_prefix(cidr("10.10.0.0/16"), cidr("10.10.0.0/24"))
            .unwrap();
        let err = tree
            .acquire_specific_child_prefix(cidr("10.10.0.0/16"), cidr("10.10.0.128/25"))
            .unwrap_err();
        assert_eq!(err, IpamError::CidrOverlap("10.10.0.128/25".to_string()));
    }

    #[test]
    fn release_child_prefix_refuses_when_not_empty() {
        let mut tree = PrefixTree::new();
        tree.ensure_root(cidr("10.10.0.0/16"));
        let child = tree.acquire_child_prefix(cidr("10.10.0.0/16"), 24).unwrap();
        tree.acquire_ip(child).unwrap();
        assert!(tree.release_child_prefix(child).is_err());
    }

    #[test]
    fn acquire_ip_skips_network_and_broadcast() {
        let mut tree = PrefixTree::new();
        let cidr30 = cidr("10.10.0.0/30");
        tree.ensure_root(cidr30);
        let a = tree.acquire_ip(cidr30).unwrap();
        let b = tree.acquire_ip(cidr30).unwrap();
        assert_eq!(a, "10.10.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(b, "10.10.0.2".parse::<IpAddr>().unwrap());
        assert!(tree.acquire_ip(cidr30).is_err());
    }

    #[test]
    fn release_ip_allows_reacquisition() {
        let mut tree = PrefixTree::new();
        let c = cidr("10.10.0.0/30");
        tree.ensure_root(c);
        let a = tree.acquire_ip(c).unwrap();
        tree.release_ip(c, a).unwrap();
        let b = tree.acquire_ip(c).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn suggest_cidrs_is_side_effect_free() {
        let mut tree = PrefixTree::new();
        tree.ensure_root(cidr("10.10.0.0/16"));
        let suggestions = tree.suggest_cidrs(cidr("10.10.0.0/16"), 50, 3).unwrap();
        assert_eq!(suggestions.len(), 3);
        // probe allocations must be rolled back
        assert!(tree.children_of(&cidr("10.10.0.0/16")).next().is_none());
        // the allocator still works as if nothing happened
        let real = tree.acquire_child_prefix(cidr("10.10.0.0/16"), 24).unwrap();
        assert_eq!(real, cidr("10.10.0.0/24"));
    }
}
