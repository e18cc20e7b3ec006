//! CPU topology tree: discovery from platform facts and priority-aware walking.
//!
//! Follows the arena-indexed-pool design note in §9: nodes live in a flat
//! `Vec` inside `CpuTopologyTree` and are addressed by `PoolId`, never by
//! pointer, so grants and supplies can cheaply store an id instead of a
//! reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::cpuset::{CpuId, CpuSet};
use crate::error::{PolicyError, PolicyResult};

/// Arena index of a topology node. Stable for the lifetime of one tree.
pub type PoolId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    VirtualRoot,
    Socket,
    Die,
    NumaNode,
}

/// Topology levels addressable by `walk_at_level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    System,
    Package,
    Die,
    Numa,
    Core,
    Thread,
    L2Cache,
}

/// What a `walk_at_level` visitor returns to steer descent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkDirective {
    Continue,
    SkipChildren,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyNode {
    pub id: PoolId,
    pub kind: NodeKind,
    pub name: String,
    pub depth: u32,
    pub cpus: CpuSet,
    /// Memory nodes (NUMA ids) with memory attached, local to this node.
    pub mem_nodes: Vec<u32>,
    pub parent: Option<PoolId>,
    pub children: Vec<PoolId>,
}

impl TopologyNode {
    pub fn has_memory(&self) -> bool {
        !self.mem_nodes.is_empty()
    }
}

/// Platform facts used to build a tree: one entry per NUMA node.
#[derive(Clone, Debug)]
pub struct NumaFact {
    pub socket_id: u32,
    pub die_id: u32,
    pub numa_id: u32,
    pub cpus: CpuSet,
    pub has_memory: bool,
    /// Relative NUMA distance to every other numa_id, for contradiction checks.
    pub distance: BTreeMap<u32, u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuTopologyTree {
    nodes: Vec<TopologyNode>,
    root: PoolId,
    /// Flat, depth-first-ordered list of node ids, pre-populated for scoring.
    ordered: Vec<PoolId>,
}

impl CpuTopologyTree {
    /// Build the tree from per-NUMA platform facts, applying the omission
    /// rules of the data model: a die with one child is skipped, a NUMA node
    /// with no memory and a parent with one memory-bearing child folds up,
    /// and a virtual root only appears when there is more than one socket.
    pub fn build(facts: &[NumaFact]) -> PolicyResult<Self> {
        check_distance_matrix(facts)?;

        let mut sockets: BTreeMap<u32, BTreeMap<u32, Vec<&NumaFact>>> = BTreeMap::new();
        for fact in facts {
            sockets
                .entry(fact.socket_id)
                .or_default()
                .entry(fact.die_id)
                .or_default()
                .push(fact);
        }

        let mut nodes = Vec::new();
        let multi_socket = sockets.len() > 1;
        let root = alloc_node(&mut nodes, NodeKind::VirtualRoot, "root".into(), 0, None);

        for (socket_id, dies) in &sockets {
            let socket_depth = if multi_socket { 1 } else { 0 };
            let socket_parent = if multi_socket { Some(root) } else { None };
            let socket_node = if multi_socket {
                Some(alloc_node(
                    &mut nodes,
                    NodeKind::Socket,
                    format!("socket{}", socket_id),
                    socket_depth,
                    socket_parent,
                ))
            } else {
                None
            };
            let socket_or_root = socket_node.unwrap_or(root);

            let single_die = dies.len() == 1;
            for (die_id, numas) in dies {
                let die_depth = nodes[socket_or_root].depth + 1;
                let die_node = if single_die {
                    socket_or_root
                } else {
                    alloc_node(
                        &mut nodes,
                        NodeKind::Die,
                        format!("die{}", die_id),
                        die_depth,
                        Some(socket_or_root),
                    )
                };

                let single_numa_child = numas.len() == 1;
                for fact in numas {
                    if !fact.has_memory && single_numa_child {
                        // fold CPUs up into the die/socket node
                        add_cpus(&mut nodes, die_node, fact);
                        continue;
                    }
                    if !fact.has_memory {
                        // still materialize a numa node to keep CPUs local,
                        // but it carries no memory.
                        let numa_depth = nodes[die_node].depth + 1;
                        let numa_node = alloc_node(
                            &mut nodes,
                            NodeKind::NumaNode,
                            format!("numa{}", fact.numa_id),
                            numa_depth,
                            Some(die_node),
                        );
                        add_cpus(&mut nodes, numa_node, fact);
                        continue;
                    }
                    let numa_depth = nodes[die_node].depth + 1;
                    let numa_node = alloc_node(
                        &mut nodes,
                        NodeKind::NumaNode,
                        format!("numa{}", fact.numa_id),
                        numa_depth,
                        Some(die_node),
                    );
                    add_cpus(&mut nodes, numa_node, fact);
                    nodes[numa_node].mem_nodes.push(fact.numa_id);
                }
            }
        }

        propagate_cpus_up(&mut nodes, root);
        let ordered = depth_first_order(&nodes, root);
        Ok(Self { nodes, root, ordered })
    }

    pub fn root(&self) -> PoolId {
        self.root
    }

    pub fn node(&self, id: PoolId) -> &TopologyNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth_first<F: FnMut(&TopologyNode)>(&self, mut f: F) {
        for &id in &self.ordered {
            f(&self.nodes[id]);
        }
    }

    pub fn breadth_first<F: FnMut(&TopologyNode)>(&self, mut f: F) {
        let mut queue = vec![self.root];
        let mut i = 0;
        while i < queue.len() {
            let id = queue[i];
            i += 1;
            f(&self.nodes[id]);
            queue.extend(self.nodes[id].children.iter().cloned());
        }
    }

    /// Visit nodes of a given topology level. The visitor returns a
    /// directive that can stop descent below a matched node.
    pub fn walk_at_level<F: FnMut(&TopologyNode) -> WalkDirective>(&self, level: Level, mut f: F) {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node_matches_level(node, level) {
                if f(node) == WalkDirective::SkipChildren {
                    continue;
                }
            }
            stack.extend(node.children.iter().cloned());
        }
    }

    pub fn all_threads_for(&self, cpus: &CpuSet) -> CpuSet {
        // Without hyperthread-sibling facts every CPU id stands for its own
        // thread; callers that have sibling info widen explicitly.
        cpus.clone()
    }

    pub fn single_thread_for(&self, cpus: &CpuSet) -> CpuSet {
        cpus.clone()
    }

    pub fn all_cpus_sharing_nth_level_cache_with(&self, _n: u32, cpus: &CpuSet) -> CpuSet {
        cpus.clone()
    }

    pub fn ancestors_of(&self, id: PoolId) -> Vec<PoolId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[id].parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p].parent;
        }
        out
    }

    pub fn path_to_root(&self, id: PoolId) -> Vec<PoolId> {
        let mut out = vec![id];
        out.extend(self.ancestors_of(id));
        out
    }

    pub fn distance(&self, a: PoolId, b: PoolId) -> u32 {
        let pa = self.path_to_root(a);
        let pb = self.path_to_root(b);
        for (da, &na) in pa.iter().enumerate() {
            if let Some(db) = pb.iter().position(|&nb| nb == na) {
                return (da + db) as u32;
            }
        }
        (pa.len() + pb.len()) as u32
    }

    pub fn subtree(&self, id: PoolId) -> Vec<PoolId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().cloned());
        }
        out
    }
}

fn node_matches_level(node: &TopologyNode, level: Level) -> bool {
    match (level, node.kind) {
        (Level::System, NodeKind::VirtualRoot) => true,
        (Level::Package, NodeKind::Socket) => true,
        (Level::Die, NodeKind::Die) => true,
        (Level::Numa, NodeKind::NumaNode) => true,
        // Core/Thread/L2Cache have no dedicated tree node in this model;
        // they resolve against leaves (NUMA nodes, or sockets/dies that
        // absorbed NUMA children) as the finest granularity we track.
        (Level::Core, k) | (Level::Thread, k) | (Level::L2Cache, k) => {
            matches!(k, NodeKind::NumaNode | NodeKind::Socket | NodeKind::Die) && node.children.is_empty()
        }
        _ => false,
    }
}

fn alloc_node(
    nodes: &mut Vec<TopologyNode>,
    kind: NodeKind,
    name: String,
    depth: u32,
    parent: Option<PoolId>,
) -> PoolId {
    let id = nodes.len();
    nodes.push(TopologyNode {
        id,
        kind,
        name,
        depth,
        cpus: CpuSet::new(),
        mem_nodes: Vec::new(),
        parent,
        children: Vec::new(),
    });
    if let Some(p) = parent {
        nodes[p].children.push(id);
    }
    id
}

fn add_cpus(nodes: &mut [TopologyNode], id: PoolId, fact: &NumaFact) {
    for cpu in fact.cpus.iter() {
        nodes[id].cpus.insert(*cpu);
    }
}

fn propagate_cpus_up(nodes: &mut [TopologyNode], root: PoolId) {
    // post-order: compute leaves-up so every ancestor's set is the union of
    // its children's, per the data model invariant.
    fn visit(nodes: &mut [TopologyNode], id: PoolId) -> CpuSet {
        let children = nodes[id].children.clone();
        if children.is_empty() {
            return nodes[id].cpus.clone();
        }
        let mut union = CpuSet::new();
        for c in children {
            let child_set = visit(nodes, c);
            union.union_with(&child_set);
        }
        nodes[id].cpus.union_with(&union);
        nodes[id].cpus.clone()
    }
    visit(nodes, root);
}

fn depth_first_order(nodes: &[TopologyNode], root: PoolId) -> Vec<PoolId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        out.push(id);
        for &c in nodes[id].children.iter().rev() {
            stack.push(c);
        }
    }
    out
}

fn check_distance_matrix(facts: &[NumaFact]) -> PolicyResult<()> {
    for a in facts {
        for (&b, &dist) in &a.distance {
            if let Some(other) = facts.iter().find(|f| f.numa_id == b) {
                if let Some(&back) = other.distance.get(&a.numa_id) {
                    if back != dist {
                        return Err(PolicyError::AllocatorInternal(format!(
                            "asymmetric NUMA distance matrix: {}->{} = {} but {}->{} = {}",
                            a.numa_id, b, dist, b, a.numa_id, back
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(socket: u32, die: u32, numa: u32, cpus: &[CpuId], mem: bool) -> NumaFact {
        NumaFact {
            socket_id: socket,
            die_id: die,
            numa_id: numa,
            cpus: CpuSet::from_ids(cpus.iter().cloned()),
            has_memory: mem,
            distance: BTreeMap::new(),
        }
    }

    #[test]
    fn single_socket_single_die_single_numa_has_no_root_nor_socket_node() {
        let facts = vec![fact(0, 0, 0, &[0, 1, 2, 3], true)];
        let tree = CpuTopologyTree::build(&facts).unwrap();
        // root absorbs socket and die since there is exactly one of each.
        assert_eq!(tree.node(tree.root()).cpus.len(), 4);
    }

    #[test]
    fn two_sockets_materialize_virtual_root() {
        let facts = vec![
            fact(0, 0, 0, &[0, 1], true),
            fact(1, 0, 1, &[2, 3], true),
        ];
        let tree = CpuTopologyTree::build(&facts).unwrap();
        assert_eq!(tree.node(tree.root()).kind, NodeKind::VirtualRoot);
        assert_eq!(tree.node(tree.root()).children.len(), 2);
        assert_eq!(tree.node(tree.root()).cpus.len(), 4);
    }

    #[test]
    fn numa_without_memory_folds_into_parent_when_only_child() {
        let facts = vec![fact(0, 0, 0, &[0, 1, 2, 3], false)];
        let tree = CpuTopologyTree::build(&facts).unwrap();
        // no NUMA node materialized on its own; CPUs land on the root.
        assert!(tree.nodes().iter().all(|n| n.kind != NodeKind::NumaNode));
        assert_eq!(tree.node(tree.root()).cpus.len(), 4);
    }

    #[test]
    fn asymmetric_distance_matrix_is_rejected() {
        let mut a = fact(0, 0, 0, &[0, 1], true);
        let mut b = fact(0, 0, 1, &[2, 3], true);
        a.distance.insert(1, 10);
        b.distance.insert(0, 20);
        assert!(CpuTopologyTree::build(&[a, b]).is_err());
    }

    #[test]
    fn every_cpu_appears_at_exactly_one_leaf() {
        let facts = vec![
            fact(0, 0, 0, &[0, 1], true),
            fact(0, 1, 1, &[2, 3], true),
            fact(1, 0, 2, &[4, 5], true),
        ];
        let tree = CpuTopologyTree::build(&facts).unwrap();
        let mut seen = CpuSet::new();
        for n in tree.nodes() {
            if n.children.is_empty() {
                for c in n.cpus.iter() {
                    assert!(!seen.contains(*c), "cpu {} counted twice", c);
                    seen.insert(*c);
                }
            }
        }
        assert_eq!(seen.len(), 6);
    }
}
