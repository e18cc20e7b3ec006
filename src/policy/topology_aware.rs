//! Topology-aware backend (§4.4): the pool tree *is* the CPU topology tree;
//! every node carries its own supply, and placement scores every candidate
//! pool with the §4.4.1 comparator.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::Config;
use crate::container::PinningDecision;
use crate::core::cpuset::CpuSet;
use crate::core::cpu_allocator::CpuAllocator;
use crate::core::grant::{ColdStartState, Grant, GrantTable, SchedulingClass};
use crate::core::memory_allocator::MemoryAllocator;
use crate::core::request::{ContainerId, CpuPriority, CpuType, Milli, MemoryType, QosClass, Request};
use crate::core::snapshot::Snapshot;
use crate::core::supply::SupplyTable;
use crate::core::topology::{CpuTopologyTree, Level, PoolId};
use crate::error::{PolicyError, PolicyResult};
use crate::policy::comparator::{self, PoolScore, RequestFlags};
use crate::policy::{PolicyBackend, PoolDescriptor, TopologyZones};

pub struct TopologyAwareBackend {
    tree: CpuTopologyTree,
    supplies: SupplyTable,
    mem: MemoryAllocator,
    grants: GrantTable,
    config: Config,
    cold_start_enabled: bool,
    /// CPU id -> container id that externally claimed it (§4.4.2).
    claimed_by: BTreeMap<u32, ContainerId>,
    pending_repins: Vec<ContainerId>,
}

impl TopologyAwareBackend {
    pub fn new(tree: CpuTopologyTree, mem: MemoryAllocator, reserved: CpuSet, isolated: CpuSet, config: Config) -> Self {
        let cold_start_enabled = !mem.has_movable_non_dram();
        let mut supplies = SupplyTable::new();
        for node in tree.nodes() {
            let sharable = node.cpus.difference(&reserved).difference(&isolated);
            let node_reserved = node.cpus.intersection(&reserved);
            let node_isolated = node.cpus.intersection(&isolated);
            supplies.by_node.insert(
                node.id,
                crate::core::supply::Supply {
                    isolated: node_isolated,
                    reserved: node_reserved,
                    sharable,
                    granted_reserved: Milli::ZERO,
                    granted_shared: Milli::ZERO,
                    claimed: CpuSet::new(),
                },
            );
        }
        Self {
            tree,
            supplies,
            mem,
            grants: GrantTable::new(),
            config,
            cold_start_enabled,
            claimed_by: BTreeMap::new(),
            pending_repins: Vec::new(),
        }
    }

    fn candidate_pools(&self, req: &Request) -> Vec<PoolId> {
        if matches!(req.cpu_type, CpuType::Reserved | CpuType::Preserve) {
            // Open question (c): a reserved request falls back to Normal
            // candidate selection when the root carries no reserved CPUs.
            if matches!(req.cpu_type, CpuType::Reserved)
                && self.supplies.get(self.tree.root()).reserved.is_empty()
            {
                // fall through to normal candidate selection below
            } else {
                return vec![self.tree.root()];
            }
        }
        if let Some(hint) = &req.pool_hint {
            if let Some(node) = self.tree.nodes().iter().find(|n| &n.name == hint) {
                return vec![node.id];
            }
        }
        self.tree.nodes().iter().map(|n| n.id).collect()
    }

    fn affinity_score(&self, pool: PoolId, affinity: &BTreeMap<String, i32>) -> i64 {
        const Q: f64 = 0.75;
        let mut total = 0.0;
        for node_id in self.affinity_scope(pool) {
            let name = &self.tree.node(node_id).name;
            if let Some(&weight) = affinity.get(name) {
                let d = self.tree.distance(pool, node_id);
                total += weight as f64 * Q.powi(d as i32);
            }
        }
        total.round() as i64
    }

    fn affinity_scope(&self, pool: PoolId) -> Vec<PoolId> {
        let mut scope = self.tree.ancestors_of(pool);
        scope.extend(self.tree.subtree(pool));
        scope
    }

    fn hint_score(&self, pool: PoolId, hints: &[crate::core::request::TopologyHint]) -> (f64, u32) {
        if hints.is_empty() {
            return (0.0, 0);
        }
        let pool_cpus = &self.tree.node(pool).cpus;
        let mut product = 1.0;
        let mut nonzero_product = 1.0;
        let mut nonzero = 0;
        for hint in hints {
            let hint_set = CpuSet::from_ids(hint.cpus.iter().cloned());
            if hint_set.is_empty() {
                continue;
            }
            let overlap = hint_set.intersection(pool_cpus).len() as f64;
            let fraction = overlap / hint_set.len() as f64;
            product *= fraction;
            if fraction > 0.0 {
                nonzero += 1;
                nonzero_product *= fraction;
            }
        }
        let _ = nonzero_product;
        (product, nonzero)
    }

    fn score(&self, pool: PoolId, req: &Request) -> PoolScore {
        let supply = self.supplies.get(pool);
        let feasible = self.feasible(pool, req);
        let affinity = self.affinity_score(pool, &req.affinity);
        let (hint_score, nonzero_hints) = self.hint_score(pool, &req.topology_hints);

        let current_mems: Vec<u32> = self.tree.subtree(pool).iter().flat_map(|n| self.tree.node(*n).mem_nodes.clone()).collect();
        let offer = self.mem.offer(&req.container_id, req.mem_req.max(1), &current_mems, req.memory_type);
        let limit_offer = if req.mem_limit > req.mem_req {
            self.mem.offer(&req.container_id, req.mem_limit, &current_mems, req.memory_type)
        } else {
            offer.clone()
        };
        let mem_exact_type = !offer.zone.is_empty() && self.mem.zone_type(&offer.zone) == req.memory_type;

        let colocated = self.grants.grants_on_node(pool).count() as i64;
        let reserved_colocated = self
            .grants
            .grants_on_node(pool)
            .filter(|g| g.from_reserved)
            .count()
            .max(1) as f64;

        PoolScore {
            pool_id: pool,
            depth: self.tree.node(pool).depth,
            feasible,
            affinity,
            hint_score,
            nonzero_hints,
            mem_offer_ok: offer.satisfied,
            mem_exact_type,
            mem_fits_limit: limit_offer.satisfied,
            mem_zone_size: offer.zone.len().max(1),
            at_unlimited_burstable_level: level_matches(&self.tree, pool, self.config.unlimited_burstable),
            burstable_capacity: self.supplies.effective_free_shared(&self.tree, pool).0,
            has_preferred_mem_type: req.memory_type.is_empty() || self.mem.zone_type(&current_mems).intersects(req.memory_type),
            prio_capacity_nonneg: self.supplies.effective_free_shared(&self.tree, pool).0 - req.fraction.0 >= 0,
            reserved_per_colocated: supply.free_reserved_count() as f64 / reserved_colocated,
            isolated_capacity: supply.free_isolated().len() as i64,
            sliceable_shared_capacity: self.supplies.effective_free_shared(&self.tree, pool).0,
            colocated_containers: colocated,
            shared_capacity: self.supplies.effective_free_shared(&self.tree, pool).0,
        }
    }

    fn feasible(&self, pool: PoolId, req: &Request) -> bool {
        let supply = self.supplies.get(pool);
        if req.full > 0 {
            let available = if req.isolate {
                supply.free_isolated().len() + supply.free_sharable_count()
            } else {
                supply.free_sharable_count()
            };
            if available < req.full as usize {
                return false;
            }
        }
        if req.fraction.0 > 0 {
            let cap = if matches!(req.cpu_type, CpuType::Reserved) {
                self.supplies.effective_free_reserved(&self.tree, pool)
            } else {
                self.supplies.effective_free_shared(&self.tree, pool)
            };
            if cap.0 < req.fraction.0 {
                return false;
            }
        }
        true
    }

    fn request_flags(&self, req: &Request) -> RequestFlags {
        RequestFlags {
            burstable: req.qos == QosClass::Burstable,
            unlimited_cpu: req.unlimited_cpu(),
            mem_type_preference_set: !req.memory_type.is_empty(),
            cpu_prio_preference_set: req.cpu_prio != CpuPriority::None,
            reserved_request: matches!(req.cpu_type, CpuType::Reserved),
            isolated_request: req.isolate,
            exclusive_request: req.is_exclusive(),
            shared_request: req.is_shared(),
        }
    }

    fn commit(&mut self, pool: PoolId, req: &Request) -> PolicyResult<Grant> {
        let mut exclusive = CpuSet::new();
        let mut isolated_portion = CpuSet::new();
        let mut from_reserved = false;
        if req.full > 0 {
            let supply = self.supplies.get(pool);
            let free_isolated = supply.free_isolated();
            let mut source = if req.isolate {
                let mut s = free_isolated.clone();
                s.union_with(&supply.sharable.difference(&supply.claimed));
                s
            } else {
                supply.sharable.difference(&supply.claimed)
            };
            let allocator = CpuAllocator::new(&self.tree);
            exclusive = allocator
                .allocate(&mut source, req.full as usize, req.cpu_prio, &[])
                .map_err(|_| {
                    PolicyError::InsufficientCapacity(format!(
                        "pool {} cannot satisfy {} exclusive cpus",
                        self.tree.node(pool).name, req.full
                    ))
                })?;
            isolated_portion = exclusive.intersection(&free_isolated);
            self.supplies.remove_exclusive(&self.tree, pool, &exclusive);
        }

        let mut cpu_portion = Milli::ZERO;
        if req.fraction.0 > 0 {
            if matches!(req.cpu_type, CpuType::Reserved) {
                from_reserved = true;
                self.supplies.get_mut(pool).granted_reserved = self.supplies.get(pool).granted_reserved + req.fraction;
            } else {
                self.supplies.get_mut(pool).granted_shared = self.supplies.get(pool).granted_shared + req.fraction;
            }
            cpu_portion = req.fraction;
        }

        let current_mems: Vec<u32> = self
            .tree
            .subtree(pool)
            .iter()
            .flat_map(|n| self.tree.node(*n).mem_nodes.clone())
            .collect();

        let cold_start = req.cold_start.filter(|d| d.as_nanos() > 0 && self.cold_start_enabled);
        let initial_mem_type = if cold_start.is_some() && req.memory_type.contains(MemoryType::PMEM) {
            MemoryType::PMEM
        } else {
            req.memory_type
        };
        if req.cold_start.is_some() && !self.cold_start_enabled {
            return Err(PolicyError::ColdStartMisuse);
        }

        let offer = self.mem.offer(&req.container_id, req.mem_req.max(1), &current_mems, initial_mem_type);
        if !offer.satisfied {
            self.undo_cpu(pool, &exclusive, &isolated_portion, cpu_portion, from_reserved);
            return Err(PolicyError::InsufficientCapacity(format!(
                "no memory offer for {}",
                req.container_id
            )));
        }
        let zone = match self.mem.commit(&req.container_id, &offer, req.mem_req.max(1), initial_mem_type) {
            Ok(z) => z,
            Err(e) => {
                self.undo_cpu(pool, &exclusive, &isolated_portion, cpu_portion, from_reserved);
                return Err(e);
            }
        };

        let grant = Grant {
            container_id: req.container_id.clone(),
            node: pool,
            pool_name: self.tree.node(pool).name.clone(),
            exclusive,
            isolated_portion,
            cpu_portion,
            from_reserved,
            memory_zone: zone,
            memory_size: req.mem_req,
            memory_type: initial_mem_type,
            cold_start: cold_start.map(|d| ColdStartState { total: d, elapsed: Duration::ZERO, widened: false }),
            scheduling: SchedulingClass::default(),
            prior_pool_hint: req.pool_hint.clone(),
        };
        Ok(grant)
    }

    fn undo_cpu(&mut self, pool: PoolId, exclusive: &CpuSet, isolated_portion: &CpuSet, cpu_portion: Milli, from_reserved: bool) {
        let shared_part = exclusive.difference(isolated_portion);
        if !isolated_portion.is_empty() {
            self.supplies.add_back(&self.tree, pool, isolated_portion, true, false);
        }
        if !shared_part.is_empty() {
            self.supplies.add_back(&self.tree, pool, &shared_part, false, false);
        }
        if cpu_portion.0 > 0 {
            let supply = self.supplies.get_mut(pool);
            if from_reserved {
                supply.granted_reserved = supply.granted_reserved - cpu_portion;
            } else {
                supply.granted_shared = supply.granted_shared - cpu_portion;
            }
        }
    }

    fn release_internal(&mut self, container_id: &str) -> Option<Grant> {
        let grant = self.grants.remove(container_id)?;
        self.undo_cpu(grant.node, &grant.exclusive, &grant.isolated_portion, grant.cpu_portion, grant.from_reserved);
        self.mem.release(container_id);
        for cpu in grant.exclusive.iter() {
            self.claimed_by.remove(cpu);
        }
        self.queue_repin(grant.node);
        Some(grant)
    }

    fn queue_repin(&mut self, node: PoolId) {
        let affected: BTreeSet<ContainerId> = self
            .tree
            .ancestors_of(node)
            .into_iter()
            .chain(self.tree.subtree(node))
            .flat_map(|n| self.grants.grants_on_node(n).map(|g| g.container_id.clone()))
            .collect();
        self.pending_repins.extend(affected);
    }

    /// §4.4.2 step 3: release the largest shared users of `nodes` until their
    /// tightest-shared free capacity can hold `needed`. Returns the evicted
    /// container ids — unlike the displaced exclusive holders, these are not
    /// reallocated by the caller, so it must surface them to the runtime
    /// adapter as containers that lost their grant outright.
    fn evict_largest_shared_until(&mut self, nodes: &[PoolId], needed: Milli) -> Vec<ContainerId> {
        let mut evicted = Vec::new();
        if needed.0 <= 0 {
            return evicted;
        }
        loop {
            let free = nodes
                .iter()
                .map(|&p| self.supplies.get(p).local_shared_capacity())
                .min()
                .unwrap_or(Milli::ZERO);
            if free >= needed {
                return evicted;
            }
            let victim = self
                .grants
                .iter()
                .filter(|(_, g)| g.cpu_portion.0 > 0 && nodes.contains(&g.node))
                .max_by_key(|(_, g)| g.cpu_portion.0)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    self.release_internal(&id);
                    evicted.push(id);
                }
                None => return evicted,
            }
        }
    }

    pub fn tree(&self) -> &CpuTopologyTree {
        &self.tree
    }
}

fn level_matches(tree: &CpuTopologyTree, pool: PoolId, level: Level) -> bool {
    use crate::core::topology::NodeKind;
    matches!(
        (level, tree.node(pool).kind),
        (Level::System, NodeKind::VirtualRoot)
            | (Level::Package, NodeKind::Socket)
            | (Level::Die, NodeKind::Die)
            | (Level::Numa, NodeKind::NumaNode)
    )
}

fn placeholder_request(container_id: &str, grant: &Grant) -> Request {
    Request {
        container_id: container_id.to_string(),
        pod_id: String::new(),
        qos: QosClass::Guaranteed,
        full: grant.exclusive.len() as u32,
        fraction: grant.cpu_portion,
        isolate: false,
        cpu_type: if grant.from_reserved { CpuType::Reserved } else { CpuType::Normal },
        cpu_prio: CpuPriority::None,
        mem_req: grant.memory_size,
        mem_limit: grant.memory_size,
        memory_type: grant.memory_type,
        cold_start: None,
        affinity: BTreeMap::new(),
        topology_hints: Vec::new(),
        pool_hint: None,
        namespace: String::new(),
        labels: BTreeMap::new(),
        balloon_def_override: None,
        hide_hyperthreads_override: None,
        preserve: false,
    }
}

impl PolicyBackend for TopologyAwareBackend {
    fn allocate(&mut self, req: Request) -> PolicyResult<Grant> {
        let candidates = self.candidate_pools(&req);
        let flags = self.request_flags(&req);
        let scores: Vec<PoolScore> = candidates.iter().map(|&p| self.score(p, &req)).collect();
        let best = comparator::best_pool(&scores, flags)
            .ok_or_else(|| PolicyError::NoSuitablePool(format!("no pool fits container {}", req.container_id)))?;
        let grant = self.commit(best, &req)?;
        self.queue_repin(best);
        self.grants.insert(grant.clone());
        Ok(grant)
    }

    fn release(&mut self, container_id: &str) -> PolicyResult<()> {
        self.release_internal(container_id);
        Ok(())
    }

    fn update(&mut self, container_id: &str, mut req: Request) -> PolicyResult<Grant> {
        let prior_pool = self.grants.get(container_id).map(|g| g.pool_name.clone());
        self.release_internal(container_id);
        req.pool_hint = prior_pool;
        match self.allocate(req.clone()) {
            Ok(g) => Ok(g),
            Err(_) => {
                req.pool_hint = None;
                self.allocate(req)
            }
        }
    }

    fn grants(&self) -> &GrantTable {
        &self.grants
    }

    fn topology_zones(&self) -> TopologyZones {
        let pools = self
            .tree
            .nodes()
            .iter()
            .map(|n| {
                let supply = self.supplies.get(n.id);
                let mems: Vec<u32> = n.mem_nodes.clone();
                PoolDescriptor {
                    id: n.id,
                    name: n.name.clone(),
                    depth: n.depth,
                    cpus: n.cpus.len(),
                    free_shared_milli: self.supplies.effective_free_shared(&self.tree, n.id).0,
                    free_isolated: supply.free_isolated().len(),
                    free_reserved: supply.free_reserved_count(),
                    memory_capacity: self.mem.zone_capacity(&mems),
                    memory_free: self.mem.zone_free(&mems),
                }
            })
            .collect();
        TopologyZones { pools }
    }

    fn export_resource_data(&self, container_id: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(grant) = self.grants.get(container_id) {
            out.insert("CPU_SHARED".to_string(), grant.exclusive.to_string());
            out.insert(
                "MEMORY_NUMA_NODES".to_string(),
                grant.memory_zone.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(","),
            );
            out.insert("POOL".to_string(), grant.pool_name.clone());
        }
        out
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot { grants: self.grants.clone(), balloons: None }
    }

    fn restore(&mut self, snap: Snapshot) -> PolicyResult<()> {
        for (_, grant) in snap.grants.iter() {
            let req = placeholder_request(&grant.container_id, grant);
            let restored = self.commit(grant.node, &req)?;
            self.grants.insert(restored);
        }
        Ok(())
    }

    fn pending_cold_starts(&self) -> Vec<(ContainerId, Duration)> {
        self.grants
            .iter()
            .filter_map(|(id, g)| {
                g.cold_start.as_ref().map(|cs| (id.clone(), cs.total.saturating_sub(cs.elapsed)))
            })
            .collect()
    }

    fn cold_start_done(&mut self, container_id: &str) -> PolicyResult<()> {
        let node = self
            .grants
            .get(container_id)
            .ok_or_else(|| PolicyError::AllocatorInternal(format!("no grant for {}", container_id)))?
            .node;
        let current_mems: Vec<u32> = self
            .tree
            .subtree(node)
            .iter()
            .flat_map(|n| self.tree.node(*n).mem_nodes.clone())
            .collect();
        let widened = self.mem.realloc(container_id, &current_mems, MemoryType::DRAM | MemoryType::PMEM)?;
        if let Some(grant) = self.grants.get_mut(container_id) {
            grant.memory_zone = widened;
            grant.memory_type = MemoryType::DRAM | MemoryType::PMEM;
            if let Some(cs) = &mut grant.cold_start {
                cs.widened = true;
                cs.elapsed = cs.total;
            }
        }
        Ok(())
    }

    fn drain_pending_repins(&mut self) -> Vec<ContainerId> {
        let mut out: Vec<ContainerId> = self.pending_repins.drain(..).collect();
        out.sort();
        out.dedup();
        out
    }

    fn pinning_decision(&self, container_id: &str) -> Option<PinningDecision> {
        let grant = self.grants.get(container_id)?;
        Some(PinningDecision {
            cpuset_cpus: grant.exclusive.clone(),
            cpuset_mems: grant.memory_zone.clone(),
            cpu_shares: grant.cpu_portion.0,
            cpu_class: grant.scheduling.cpu_class.clone(),
            scheduling_priority: grant.scheduling.scheduling_priority,
        })
    }

    /// Device co-allocation claim (§4.4.2). Returns the ids of any shared
    /// grants evicted outright in step 3 — unlike the displaced exclusive
    /// holders (reallocated before this returns), those containers are left
    /// with no grant at all and the caller must tell the runtime adapter.
    fn allocate_claim(&mut self, container_id: &str, cpus: &CpuSet) -> PolicyResult<Vec<ContainerId>> {
        let displaced_ids: Vec<ContainerId> = self
            .grants
            .iter()
            .filter(|(_, g)| g.exclusive.intersects(cpus))
            .map(|(id, _)| id.clone())
            .collect();

        let mut displaced: Vec<(ContainerId, Grant)> = Vec::new();
        for id in displaced_ids {
            if let Some(grant) = self.grants.remove(&id) {
                self.undo_cpu(grant.node, &grant.exclusive, &grant.isolated_portion, grant.cpu_portion, grant.from_reserved);
                displaced.push((id, grant));
            }
        }

        let tightest = self
            .tree
            .nodes()
            .iter()
            .filter(|n| cpus.is_subset_of(&n.cpus))
            .max_by_key(|n| n.depth)
            .map(|n| n.id)
            .ok_or_else(|| PolicyError::NoSuitablePool("no pool contains the claimed cpus".into()))?;

        let affected_nodes: Vec<PoolId> = std::iter::once(tightest).chain(self.tree.ancestors_of(tightest)).collect();
        let needed_shared: Milli = displaced.iter().map(|(_, g)| g.cpu_portion).sum();
        let evicted = self.evict_largest_shared_until(&affected_nodes, needed_shared);

        for cpu in cpus.iter() {
            self.claimed_by.insert(*cpu, container_id.to_string());
            for &ancestor in &affected_nodes {
                self.supplies.get_mut(ancestor).claimed.insert(*cpu);
            }
        }
        for (id, grant) in displaced {
            let mut req = placeholder_request(&id, &grant);
            req.pool_hint = Some(grant.pool_name.clone());
            if self.allocate(req.clone()).is_err() {
                req.pool_hint = None;
                self.allocate(req)?;
            }
        }
        self.queue_repin(tightest);
        Ok(evicted)
    }

    fn release_claim(&mut self, cpus: &CpuSet) {
        for cpu in cpus.iter() {
            if let Some(node) = self
                .tree
                .nodes()
                .iter()
                .find(|n| n.children.is_empty() && n.cpus.contains(*cpu))
                .map(|n| n.id)
            {
                for ancestor in std::iter::once(node).chain(self.tree.ancestors_of(node)) {
                    self.supplies.get_mut(ancestor).claimed.remove(*cpu);
                }
                self.queue_repin(node);
            }
            self.claimed_by.remove(cpu);
        }
    }
}
