//! Per-node supply bookkeeping (data model §3) and the shared-capacity
//! invariant: allocatable shared mCPU at a node is capped by every
//! ancestor's allocatable shared mCPU, so no subtree ever overcommits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::cpuset::CpuSet;
use crate::core::request::Milli;
use crate::core::topology::{CpuTopologyTree, PoolId};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Supply {
    pub isolated: CpuSet,
    pub reserved: CpuSet,
    pub sharable: CpuSet,
    pub granted_reserved: Milli,
    pub granted_shared: Milli,
    pub claimed: CpuSet,
}

impl Supply {
    pub fn free_isolated(&self) -> CpuSet {
        self.isolated.difference(&self.claimed)
    }

    pub fn free_sharable_count(&self) -> usize {
        self.sharable.difference(&self.claimed).len()
    }

    pub fn free_reserved_count(&self) -> usize {
        self.reserved.difference(&self.claimed).len()
    }

    /// Local capacity bound, ignoring ancestors: 1000 * free CPUs - granted.
    pub fn local_shared_capacity(&self) -> Milli {
        Milli::from_cpus(self.free_sharable_count() as u32) - self.granted_shared
    }

    pub fn local_reserved_capacity(&self) -> Milli {
        Milli::from_cpus(self.free_reserved_count() as u32) - self.granted_reserved
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SupplyTable {
    pub by_node: BTreeMap<PoolId, Supply>,
}

impl SupplyTable {
    pub fn new() -> Self {
        Self { by_node: BTreeMap::new() }
    }

    pub fn get(&self, node: PoolId) -> &Supply {
        self.by_node.get(&node).expect("supply missing for node")
    }

    pub fn get_mut(&mut self, node: PoolId) -> &mut Supply {
        self.by_node.entry(node).or_default()
    }

    /// G2: effective free shared mCPU at `node`, capped recursively by every
    /// ancestor's own free shared mCPU (the bound holds along the path to
    /// the root).
    pub fn effective_free_shared(&self, tree: &CpuTopologyTree, node: PoolId) -> Milli {
        let mut bound = self.get(node).local_shared_capacity();
        for ancestor in tree.ancestors_of(node) {
            let a = self.get(ancestor).local_shared_capacity();
            if a < bound {
                bound = a;
            }
        }
        bound
    }

    pub fn effective_free_reserved(&self, tree: &CpuTopologyTree, node: PoolId) -> Milli {
        let mut bound = self.get(node).local_reserved_capacity();
        for ancestor in tree.ancestors_of(node) {
            let a = self.get(ancestor).local_reserved_capacity();
            if a < bound {
                bound = a;
            }
        }
        bound
    }

    /// Removes `cpus` from every ancestor and descendant sharable/isolated/
    /// reserved set too, matching the invariant that a node's free CPUs are
    /// a subset of its ancestors'. `set` identifies which bucket loses the
    /// CPUs exclusively (they stop being shareable capacity anywhere).
    pub fn remove_exclusive(&mut self, tree: &CpuTopologyTree, node: PoolId, cpus: &CpuSet) {
        for ancestor in std::iter::once(node).chain(tree.ancestors_of(node)) {
            let supply = self.get_mut(ancestor);
            supply.isolated.subtract_from(cpus);
            supply.reserved.subtract_from(cpus);
            supply.sharable.subtract_from(cpus);
        }
    }

    pub fn add_back(&mut self, tree: &CpuTopologyTree, node: PoolId, cpus: &CpuSet, isolated: bool, reserved: bool) {
        for ancestor in std::iter::once(node).chain(tree.ancestors_of(node)) {
            let supply = self.get_mut(ancestor);
            if isolated {
                supply.isolated.union_with(cpus);
            } else if reserved {
                supply.reserved.union_with(cpus);
            } else {
                supply.sharable.union_with(cpus);
            }
        }
    }
}
