//! Priority-aware CPU allocator (§4.2): picks/returns CPU ids from a source
//! set, scoring candidates by distance to named "virtual device" sets,
//! CPU priority class, and whether a die/NUMA group is already in use.

use std::collections::BTreeMap;

use crate::core::cpuset::{CpuId, CpuSet};
use crate::core::request::{CpuPriority, Milli};
use crate::core::topology::{CpuTopologyTree, PoolId};
use crate::error::{PolicyError, PolicyResult};

/// A named CPU set the allocator treats as an attractor (positive weight,
/// "close to") or repulsor (negative weight, "far from") during scoring.
#[derive(Clone, Debug)]
pub struct VirtualDevice {
    pub name: String,
    pub cpus: CpuSet,
    pub weight: f64,
    /// Load classes: recomputed as new CPUs are picked within one
    /// allocation call, modeling contention spreading.
    pub update_on_every_cpu: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpreadPreference {
    SpreadOnPhysicalCores,
    PackOnSiblings,
}

pub struct CpuAllocator<'a> {
    pub tree: &'a CpuTopologyTree,
    pub performance_cores: CpuSet,
    pub efficient_cores: CpuSet,
    pub spread: SpreadPreference,
}

impl<'a> CpuAllocator<'a> {
    pub fn new(tree: &'a CpuTopologyTree) -> Self {
        Self {
            tree,
            performance_cores: CpuSet::new(),
            efficient_cores: CpuSet::new(),
            spread: SpreadPreference::SpreadOnPhysicalCores,
        }
    }

    /// Removes `count` CPUs from `from`, scored by `devices` and `prio`,
    /// returning the picked set. Errors if `from` has fewer than `count`.
    pub fn allocate(
        &self,
        from: &mut CpuSet,
        count: usize,
        prio: CpuPriority,
        devices: &[VirtualDevice],
    ) -> PolicyResult<CpuSet> {
        if from.len() < count {
            return Err(PolicyError::InsufficientCapacity(format!(
                "requested {} cpus but only {} available",
                count,
                from.len()
            )));
        }
        let mut picked = CpuSet::new();
        let mut used_nodes: Vec<PoolId> = Vec::new();
        let mut devices: Vec<VirtualDevice> = devices.to_vec();

        for _ in 0..count {
            let mut best: Option<(CpuId, f64)> = None;
            for cpu in from.ordered() {
                let score = self.score(cpu, prio, &devices, &used_nodes);
                if best.is_none() || score < best.unwrap().1 {
                    best = Some((cpu, score));
                }
            }
            let (cpu, _) = best.expect("from is non-empty per length check above");
            from.remove(cpu);
            picked.insert(cpu);
            if let Some(leaf) = self.leaf_for(cpu) {
                used_nodes.push(leaf);
            }
            for d in devices.iter_mut() {
                if d.update_on_every_cpu {
                    d.cpus.remove(cpu);
                }
            }
        }
        Ok(picked)
    }

    /// Picks `count` CPUs out of `current` to return to `free`, preferring
    /// to give up CPUs least valuable to keep (highest score = worst fit),
    /// and unions them into `free`.
    pub fn release(
        &self,
        current: &CpuSet,
        free: &mut CpuSet,
        count: usize,
        prio: CpuPriority,
        devices: &[VirtualDevice],
    ) -> CpuSet {
        let count = count.min(current.len());
        let mut remaining = current.clone();
        let mut picked = CpuSet::new();
        for _ in 0..count {
            let mut worst: Option<(CpuId, f64)> = None;
            for cpu in remaining.ordered() {
                let score = self.score(cpu, prio, devices, &[]);
                if worst.is_none() || score > worst.unwrap().1 {
                    worst = Some((cpu, score));
                }
            }
            if let Some((cpu, _)) = worst {
                remaining.remove(cpu);
                picked.insert(cpu);
            }
        }
        free.union_with(&picked);
        picked
    }

    /// Chooses where a balloon's resize should draw from (`delta > 0`) or
    /// return to (`delta < 0`), without committing either side.
    pub fn resize(
        &self,
        current: &CpuSet,
        free: &CpuSet,
        delta: i64,
        prio: CpuPriority,
        devices: &[VirtualDevice],
    ) -> PolicyResult<(CpuSet, CpuSet)> {
        if delta > 0 {
            let mut free_copy = free.clone();
            let add = self.allocate(&mut free_copy, delta as usize, prio, devices)?;
            Ok((add, CpuSet::new()))
        } else if delta < 0 {
            let mut free_copy = free.clone();
            let remove = self.release(current, &mut free_copy, (-delta) as usize, prio, devices);
            Ok((CpuSet::new(), remove))
        } else {
            Ok((CpuSet::new(), CpuSet::new()))
        }
    }

    fn leaf_for(&self, cpu: CpuId) -> Option<PoolId> {
        self.tree
            .nodes()
            .iter()
            .find(|n| n.children.is_empty() && n.cpus.contains(cpu))
            .map(|n| n.id)
    }

    /// Lower score = more preferred. Tuple-like composition folded into an
    /// f64: attractor distance dominates, then priority-class mismatch,
    /// then whether the cpu is in an already-used die/NUMA group (spread
    /// vs pack per configured option).
    fn score(&self, cpu: CpuId, prio: CpuPriority, devices: &[VirtualDevice], used_nodes: &[PoolId]) -> f64 {
        let mut score = 0.0;
        if let Some(leaf) = self.leaf_for(cpu) {
            for d in devices {
                if d.cpus.is_empty() {
                    continue;
                }
                let dist = self.min_distance_to_set(leaf, &d.cpus);
                score += d.weight * dist as f64;
            }
            let group_used = used_nodes.contains(&leaf);
            match self.spread {
                SpreadPreference::SpreadOnPhysicalCores => {
                    if group_used {
                        score += 5.0;
                    }
                }
                SpreadPreference::PackOnSiblings => {
                    if !group_used && !used_nodes.is_empty() {
                        score += 5.0;
                    }
                }
            }
        }
        score += match prio {
            CpuPriority::High => {
                if self.performance_cores.contains(cpu) {
                    -10.0
                } else {
                    2.0
                }
            }
            CpuPriority::Low => {
                if self.efficient_cores.contains(cpu) {
                    -10.0
                } else {
                    2.0
                }
            }
            CpuPriority::Normal | CpuPriority::None => 0.0,
        };
        score
    }

    fn min_distance_to_set(&self, leaf: PoolId, target: &CpuSet) -> u32 {
        let mut best = u32::MAX;
        for cpu in target.iter() {
            if let Some(other_leaf) = self.leaf_for(*cpu) {
                let d = self.tree.distance(leaf, other_leaf);
                if d < best {
                    best = d;
                }
            }
        }
        if best == u32::MAX {
            0
        } else {
            best
        }
    }
}

/// Registry of named virtual devices, kept mutable separately from the
/// allocator so device-affinity bias can change between calls.
#[derive(Clone, Debug, Default)]
pub struct VirtualDeviceRegistry {
    by_name: BTreeMap<String, VirtualDevice>,
}

impl VirtualDeviceRegistry {
    pub fn new() -> Self {
        Self { by_name: BTreeMap::new() }
    }

    pub fn set(&mut self, device: VirtualDevice) {
        self.by_name.insert(device.name.clone(), device);
    }

    pub fn get(&self, name: &str) -> Option<&VirtualDevice> {
        self.by_name.get(name)
    }

    pub fn matching(&self, names: &[String]) -> Vec<VirtualDevice> {
        names.iter().filter_map(|n| self.by_name.get(n).cloned()).collect()
    }
}

impl Milli {
    pub fn as_cpu_count(self) -> usize {
        ((self.0 + 999) / 1000).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::topology::NumaFact;
    use std::collections::BTreeMap as Map;

    fn small_tree() -> CpuTopologyTree {
        let facts = vec![
            NumaFact {
                socket_id: 0,
                die_id: 0,
                numa_id: 0,
                cpus: CpuSet::from_ids([0, 1, 2, 3]),
                has_memory: true,
                distance: Map::new(),
            },
            NumaFact {
                socket_id: 1,
                die_id: 0,
                numa_id: 1,
                cpus: CpuSet::from_ids([4, 5, 6, 7]),
                has_memory: true,
                distance: Map::new(),
            },
        ];
        CpuTopologyTree::build(&facts).unwrap()
    }

    #[test]
    fn allocate_fails_when_insufficient() {
        let tree = small_tree();
        let allocator = CpuAllocator::new(&tree);
        let mut from = CpuSet::from_ids([0, 1]);
        assert!(allocator.allocate(&mut from, 3, CpuPriority::None, &[]).is_err());
    }

    #[test]
    fn allocate_prefers_attractor_proximity() {
        let tree = small_tree();
        let allocator = CpuAllocator::new(&tree);
        let mut from = CpuSet::from_ids([0, 1, 2, 3, 4, 5, 6, 7]);
        let device = VirtualDevice {
            name: "dev".into(),
            cpus: CpuSet::from_ids([0]),
            weight: 1.0,
            update_on_every_cpu: false,
        };
        let picked = allocator.allocate(&mut from, 2, CpuPriority::None, &[device]).unwrap();
        // both picks should come from the numa node closest to cpu 0 (node 0..3)
        assert!(picked.ordered().iter().all(|c| *c <= 3));
    }
}
