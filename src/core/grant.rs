//! Committed allocations (data model §3) and the grant table keyed by
//! container id.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::cpuset::CpuSet;
use crate::core::request::{ContainerId, Milli, MemoryType};
use crate::core::topology::PoolId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColdStartState {
    pub total: Duration,
    pub elapsed: Duration,
    pub widened: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchedulingClass {
    pub cpu_class: Option<String>,
    pub scheduling_priority: Option<i32>,
}

/// A committed allocation, owned by container id (data model §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Grant {
    pub container_id: ContainerId,
    pub node: PoolId,
    pub pool_name: String,
    pub exclusive: CpuSet,
    /// Subset of `exclusive` drawn from the node's isolated bucket rather
    /// than its sharable one; returned to isolated on release.
    pub isolated_portion: CpuSet,
    pub cpu_portion: Milli,
    pub from_reserved: bool,
    pub memory_zone: Vec<u32>,
    pub memory_size: u64,
    pub memory_type: MemoryType,
    pub cold_start: Option<ColdStartState>,
    pub scheduling: SchedulingClass,
    /// The pool name this container was previously in, retained across an
    /// update/reconfigure reinstate for logging and pool-hint purposes.
    pub prior_pool_hint: Option<String>,
}

impl Grant {
    pub fn allowed_cpuset(&self, shared_idle: &CpuSet) -> CpuSet {
        self.exclusive.union(shared_idle)
    }
}

/// id -> Grant, the only place a live allocation is recorded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GrantTable {
    grants: BTreeMap<ContainerId, Grant>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self { grants: BTreeMap::new() }
    }

    pub fn insert(&mut self, grant: Grant) {
        self.grants.insert(grant.container_id.clone(), grant);
    }

    pub fn remove(&mut self, id: &str) -> Option<Grant> {
        self.grants.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Grant> {
        self.grants.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Grant> {
        self.grants.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.grants.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContainerId, &Grant)> {
        self.grants.iter()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn grants_on_node(&self, node: PoolId) -> impl Iterator<Item = &Grant> {
        self.grants.values().filter(move |g| g.node == node)
    }

    /// G1: every CPU id is claimed exclusively by at most one grant.
    pub fn check_exclusivity(&self) -> bool {
        let mut seen = CpuSet::new();
        for g in self.grants.values() {
            for cpu in g.exclusive.iter() {
                if seen.contains(*cpu) {
                    return false;
                }
            }
            seen.union_with(&g.exclusive);
        }
        true
    }
}
