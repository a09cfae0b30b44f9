//! Per-domain subnet planning.
//!
//! Every domain gets its own /24 carved out of a pool starting at
//! `subnet_base`: `.1` is the host side, `.2` the guest side and `.3` the
//! VM tap. Leases are keyed by environment id so concurrent domains can
//! never be handed overlapping ranges.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Addresses assigned to one isolation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressPlan {
    /// Position in the subnet pool.
    pub index: u8,
    pub network: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub tap_ip: Ipv4Addr,
}

impl AddressPlan {
    pub const PREFIX_LEN: u8 = 24;

    /// The `index`-th /24 after `base`. `None` if it would leave IPv4 space.
    pub fn for_index(base: Ipv4Addr, index: u8) -> Option<Self> {
        let network = (u32::from(base) & 0xFFFF_FF00).checked_add(u32::from(index) << 8)?;
        if network > 0xFFFF_FF00 {
            return None;
        }
        Some(Self {
            index,
            network: Ipv4Addr::from(network),
            host_ip: Ipv4Addr::from(network + 1),
            guest_ip: Ipv4Addr::from(network + 2),
            tap_ip: Ipv4Addr::from(network + 3),
        })
    }

    /// `a.b.c.0/24`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, Self::PREFIX_LEN)
    }

    pub fn overlaps(&self, other: &AddressPlan) -> bool {
        self.network == other.network
    }
}

/// Hands out non-overlapping [`AddressPlan`]s.
#[derive(Debug)]
pub struct SubnetAllocator {
    base: Ipv4Addr,
    pool_size: u8,
    leases: BTreeMap<u8, Uuid>,
}

impl SubnetAllocator {
    pub fn new(base: Ipv4Addr, pool_size: u8) -> Self {
        Self {
            base,
            pool_size,
            leases: BTreeMap::new(),
        }
    }

    /// Lowest free plan for `env_id`; the existing lease if it has one.
    pub fn allocate(&mut self, env_id: Uuid) -> Option<AddressPlan> {
        self.allocate_avoiding(env_id, &BTreeSet::new())
    }

    /// As [`allocate`](Self::allocate), also skipping indexes that
    /// `held` says are leased elsewhere.
    pub fn allocate_avoiding(&mut self, env_id: Uuid, held: &BTreeSet<u8>) -> Option<AddressPlan> {
        if let Some((&index, _)) = self.leases.iter().find(|(_, owner)| **owner == env_id) {
            return AddressPlan::for_index(self.base, index);
        }
        let index = (0..self.pool_size)
            .find(|i| !self.leases.contains_key(i) && !held.contains(i))?;
        let plan = AddressPlan::for_index(self.base, index)?;
        self.leases.insert(index, env_id);
        Some(plan)
    }

    /// Record a lease restored from persisted state. `false` if another
    /// environment already holds that subnet.
    pub fn reserve(&mut self, env_id: Uuid, plan: &AddressPlan) -> bool {
        match self.leases.get(&plan.index) {
            Some(owner) => *owner == env_id,
            None => {
                self.leases.insert(plan.index, env_id);
                true
            }
        }
    }

    pub fn release(&mut self, env_id: Uuid) -> Option<u8> {
        let index = self
            .leases
            .iter()
            .find(|(_, owner)| **owner == env_id)
            .map(|(index, _)| *index)?;
        self.leases.remove(&index);
        Some(index)
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 0);

    #[test]
    fn test_plan_layout() {
        let plan = AddressPlan::for_index(BASE, 0).unwrap();
        assert_eq!(plan.cidr(), "192.168.100.0/24");
        assert_eq!(plan.host_ip, Ipv4Addr::new(192, 168, 100, 1));
        assert_eq!(plan.guest_ip, Ipv4Addr::new(192, 168, 100, 2));
        assert_eq!(plan.tap_ip, Ipv4Addr::new(192, 168, 100, 3));

        let next = AddressPlan::for_index(BASE, 5).unwrap();
        assert_eq!(next.cidr(), "192.168.105.0/24");
        assert!(!plan.overlaps(&next));
    }

    #[test]
    fn test_plan_out_of_range() {
        assert!(AddressPlan::for_index(Ipv4Addr::new(255, 255, 255, 0), 1).is_none());
    }

    #[test]
    fn test_allocations_never_overlap() {
        let mut alloc = SubnetAllocator::new(BASE, 10);
        let plans: Vec<_> = (0..10).map(|_| alloc.allocate(Uuid::new_v4()).unwrap()).collect();
        for (i, a) in plans.iter().enumerate() {
            for b in &plans[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
        assert!(alloc.allocate(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_allocate_is_idempotent_per_env() {
        let mut alloc = SubnetAllocator::new(BASE, 4);
        let id = Uuid::new_v4();
        assert_eq!(alloc.allocate(id), alloc.allocate(id));
        assert_eq!(alloc.lease_count(), 1);
    }

    #[test]
    fn test_release_makes_subnet_reusable() {
        let mut alloc = SubnetAllocator::new(BASE, 1);
        let first = Uuid::new_v4();
        let plan = alloc.allocate(first).unwrap();
        assert!(alloc.allocate(Uuid::new_v4()).is_none());
        assert_eq!(alloc.release(first), Some(plan.index));
        assert_eq!(alloc.release(first), None);
        assert!(alloc.allocate(Uuid::new_v4()).is_some());
    }

    #[test]
    fn test_allocate_skips_subnets_held_elsewhere() {
        let mut alloc = SubnetAllocator::new(BASE, 3);
        let held = BTreeSet::from([0, 1]);
        assert_eq!(alloc.allocate_avoiding(Uuid::new_v4(), &held).unwrap().index, 2);
        assert!(alloc.allocate_avoiding(Uuid::new_v4(), &held).is_none());
    }

    #[test]
    fn test_reserve_conflict() {
        let mut alloc = SubnetAllocator::new(BASE, 4);
        let owner = Uuid::new_v4();
        let plan = AddressPlan::for_index(BASE, 2).unwrap();
        assert!(alloc.reserve(owner, &plan));
        assert!(alloc.reserve(owner, &plan));
        assert!(!alloc.reserve(Uuid::new_v4(), &plan));
        assert_eq!(alloc.allocate(Uuid::new_v4()).unwrap().index, 0);
    }
}
