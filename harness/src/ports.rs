//! Deterministic port assignment.
//!
//! Every scenario process gets a seed from the runner; the seed picks a
//! disjoint block of ports so concurrently running clusters never collide,
//! and re-running with the same seed reproduces the same ports.

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

pub const P2P_PORT_BASE: u16 = 11_000;
pub const RPC_PORT_BASE: u16 = 12_000;
/// Ports reserved per seed. Must stay strictly above [`MAX_NODES_PER_CLUSTER`].
pub const PORT_RANGE_PER_SEED: u16 = 20;
pub const MAX_NODES_PER_CLUSTER: usize = 16;
/// Distinct seed slots that fit below the next base (49 * 20 < 1000). Seeds
/// congruent modulo this share ports; the test runner never runs two at once.
pub const SEED_SLOTS: u32 = 49;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePorts {
    pub p2p: u16,
    pub rpc: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAllocator {
    seed: u32,
}

impl PortAllocator {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn ports(&self, index: usize) -> HarnessResult<NodePorts> {
        if index >= MAX_NODES_PER_CLUSTER {
            return Err(HarnessError::InvalidNodeReference(index));
        }
        let offset = PORT_RANGE_PER_SEED * (self.seed % SEED_SLOTS) as u16 + index as u16;
        Ok(NodePorts {
            p2p: P2P_PORT_BASE + offset,
            rpc: RPC_PORT_BASE + offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn seed_zero_starts_at_the_bases() {
        let ports = PortAllocator::new(0).ports(0).unwrap();
        assert_eq!(ports, NodePorts { p2p: 11_000, rpc: 12_000 });
        let ports = PortAllocator::new(3).ports(6).unwrap();
        assert_eq!(ports, NodePorts { p2p: 11_066, rpc: 12_066 });
    }

    #[test]
    fn index_beyond_cluster_limit_is_rejected() {
        let err = PortAllocator::new(1).ports(MAX_NODES_PER_CLUSTER).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidNodeReference(16)));
    }

    #[test]
    fn range_per_seed_exceeds_cluster_size() {
        assert!(usize::from(PORT_RANGE_PER_SEED) > MAX_NODES_PER_CLUSTER);
        assert!(P2P_PORT_BASE + PORT_RANGE_PER_SEED * SEED_SLOTS as u16 <= RPC_PORT_BASE);
    }

    #[test]
    fn one_slot_cycle_never_collides() {
        let mut seen = HashSet::new();
        for seed in 0..SEED_SLOTS {
            let alloc = PortAllocator::new(seed);
            for index in 0..MAX_NODES_PER_CLUSTER {
                let ports = alloc.ports(index).unwrap();
                assert!(seen.insert(ports.p2p));
                assert!(seen.insert(ports.rpc));
            }
        }
    }

    proptest! {
        #[test]
        fn same_seed_is_reproducible(seed in any::<u32>(), index in 0..MAX_NODES_PER_CLUSTER) {
            let a = PortAllocator::new(seed).ports(index).unwrap();
            let b = PortAllocator::new(seed).ports(index).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn neighbouring_seeds_are_disjoint(
            seed in 0u32..1_000_000,
            a in 0..MAX_NODES_PER_CLUSTER,
            b in 0..MAX_NODES_PER_CLUSTER,
            gap in 1u32..SEED_SLOTS,
        ) {
            let left = PortAllocator::new(seed).ports(a).unwrap();
            let right = PortAllocator::new(seed + gap).ports(b).unwrap();
            prop_assert_ne!(left.p2p, right.p2p);
            prop_assert_ne!(left.rpc, right.rpc);
            prop_assert_ne!(left.p2p, right.rpc);
        }
    }
}
