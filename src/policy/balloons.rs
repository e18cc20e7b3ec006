//! Balloons backend (§4.5): user-defined elastic CPU pools. Two built-in
//! singletons (`reserved`, `default`) always exist; every other balloon is
//! an instance of a user `BalloonDef`, picked by a definition-derived fill
//! chain and resized to fit its assigned containers.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::Config;
use crate::container::PinningDecision;
use crate::core::balloon::{Balloon, BalloonDef, BalloonIdx, DEFAULT_BALLOON, RESERVED_BALLOON};
use crate::core::cpu_allocator::CpuAllocator;
use crate::core::cpuset::CpuSet;
use crate::core::grant::{ColdStartState, Grant, GrantTable, SchedulingClass};
use crate::core::memory_allocator::MemoryAllocator;
use crate::core::request::{ContainerId, CpuType, Milli, MemoryType, Request};
use crate::core::snapshot::Snapshot;
use crate::core::topology::{CpuTopologyTree, Level};
use crate::error::{PolicyError, PolicyResult};
use crate::policy::{PolicyBackend, PoolDescriptor, TopologyZones};

fn builtin_def(name: &str) -> BalloonDef {
    BalloonDef {
        name: name.to_string(),
        min_cpus: 0,
        max_cpus: u32::MAX,
        min_balloons: 1,
        max_balloons: 1,
        cpu_class: None,
        allocator_priority: 0,
        namespaces: Vec::new(),
        match_expressions: Vec::new(),
        group_by: None,
        prefer_spreading_pods: true,
        prefer_per_namespace_balloon: false,
        prefer_new_balloons: false,
        prefer_core_type: None,
        prefer_isol_cpus: false,
        prefer_close_to_devices: Vec::new(),
        prefer_far_from_devices: Vec::new(),
        loads: Vec::new(),
        memory_types: MemoryType::all(),
        share_idle_cpus_in_same: None,
        hide_hyperthreads: false,
        components: Vec::new(),
    }
}

pub struct BalloonsBackend {
    tree: CpuTopologyTree,
    mem: MemoryAllocator,
    grants: GrantTable,
    config: Config,
    cold_start_enabled: bool,
    defs: Vec<BalloonDef>,
    balloons: Vec<Balloon>,
    free_cpus: CpuSet,
    pending_repins: Vec<ContainerId>,
    /// Per-container `preserve`/`hide_hyperthreads` overrides from the
    /// request (§4.5.5); neither belongs on `Grant` since only this backend
    /// consults them.
    pinning_overrides: BTreeMap<ContainerId, (bool, Option<bool>)>,
}

impl BalloonsBackend {
    pub fn new(tree: CpuTopologyTree, mem: MemoryAllocator, reserved: CpuSet, config: Config) -> Self {
        let cold_start_enabled = !mem.has_movable_non_dram();
        let mut free_cpus = tree.node(tree.root()).cpus.clone();
        free_cpus.subtract_from(&reserved);

        let mut balloons = vec![Balloon::new(0, RESERVED_BALLOON, 0), Balloon::new(1, DEFAULT_BALLOON, 0)];
        balloons[0].cpus = reserved;
        balloons[0].mems = tree.node(tree.root()).mem_nodes.clone();

        let mut backend = Self {
            tree,
            mem,
            grants: GrantTable::new(),
            config: config.clone(),
            cold_start_enabled,
            defs: config.balloon_defs.clone(),
            balloons,
            free_cpus,
            pending_repins: Vec::new(),
            pinning_overrides: BTreeMap::new(),
        };
        backend.seed_min_balloons();
        backend
    }

    /// Setup-time step (§8 scenario 1): every definition's `min_balloons`
    /// instances exist and are inflated to `min_cpus` before any container
    /// is assigned, not just materialized lazily on first assignment.
    fn seed_min_balloons(&mut self) {
        for def in self.defs.clone() {
            for _ in 0..def.min_balloons {
                let idx = self.create_instance(&def, None);
                let _ = self.ensure_size(idx);
            }
        }
    }

    fn def_by_name(&self, name: &str) -> Option<BalloonDef> {
        if name == RESERVED_BALLOON || name == DEFAULT_BALLOON {
            return Some(builtin_def(name));
        }
        self.defs.iter().find(|d| d.name == name).cloned()
    }

    /// §4.5.1: picks the definition name a container belongs to.
    fn choose_def_name(&self, req: &Request) -> PolicyResult<String> {
        if matches!(req.cpu_type, CpuType::Reserved) {
            return Ok(RESERVED_BALLOON.to_string());
        }
        if let Some(name) = &req.balloon_def_override {
            if self.def_by_name(name).is_none() {
                return Err(PolicyError::UnknownBalloon(name.clone()));
            }
            return Ok(name.clone());
        }
        for def in &self.defs {
            if def.match_expressions.iter().any(|m| m.evaluate(&req.labels)) {
                return Ok(def.name.clone());
            }
        }
        for def in &self.defs {
            if def.namespace_matches(&req.namespace) {
                return Ok(def.name.clone());
            }
        }
        Ok(DEFAULT_BALLOON.to_string())
    }

    fn instances_of(&self, def_name: &str) -> Vec<&Balloon> {
        self.balloons.iter().filter(|b| b.def_name == def_name).collect()
    }

    fn max_free_after_inflate(&self, balloon: &Balloon, def: &BalloonDef) -> i64 {
        let current = balloon.cpus.len() as i64;
        let used: i64 = self.assigned_milli(balloon);
        (def.max_cpus.min(i32::MAX as u32) as i64 * 1000).max(current * 1000) - used
    }

    fn free_milli(&self, balloon: &Balloon) -> i64 {
        balloon.cpus.len() as i64 * 1000 - self.assigned_milli(balloon)
    }

    fn assigned_milli(&self, balloon: &Balloon) -> i64 {
        self.grants
            .iter()
            .filter(|(_, g)| g.pool_name == balloon.name())
            .map(|(_, g)| g.cpu_portion.0)
            .sum()
    }

    /// §4.5.2: fill chain. Returns the chosen instance index, creating one
    /// if needed.
    fn choose_instance(&mut self, def_name: &str, req: &Request) -> PolicyResult<BalloonIdx> {
        if def_name == RESERVED_BALLOON {
            return Ok(0);
        }
        if def_name == DEFAULT_BALLOON {
            return Ok(1);
        }
        let def = self.def_by_name(def_name).ok_or_else(|| PolicyError::UnknownBalloon(def_name.to_string()))?;
        let group_key = def.group_by.as_ref().and_then(|k| req.labels.get(k)).cloned();
        let needed = req.fraction.0.max(req.full as i64 * 1000).max(1);

        if let Some(key) = &group_key {
            if let Some(idx) = self
                .instances_of(def_name)
                .into_iter()
                .filter(|b| b.group_key.as_deref() == Some(key.as_str()))
                .filter(|b| self.max_free_after_inflate(b, &def) >= needed)
                .max_by_key(|b| (self.max_free_after_inflate(b, &def), -(b.container_count() as i64)))
                .map(|b| b.idx)
            {
                return Ok(idx);
            }
        }
        if !def.prefer_spreading_pods {
            if let Some(idx) = self
                .instances_of(def_name)
                .into_iter()
                .find(|b| b.contains_pod(&req.pod_id))
                .map(|b| b.idx)
            {
                return Ok(idx);
            }
        }
        if def.prefer_per_namespace_balloon {
            if let Some(idx) = self
                .instances_of(def_name)
                .into_iter()
                .find(|b| b.group_key.as_deref() == Some(req.namespace.as_str()))
                .map(|b| b.idx)
            {
                return Ok(idx);
            }
        }

        let can_create_more = self.instances_of(def_name).len() < def.max_balloons as usize;
        let try_new = |backend: &mut Self| -> PolicyResult<BalloonIdx> {
            let idx = backend.create_instance(&def, group_key.clone().or_else(|| Some(req.namespace.clone())));
            let delta = (def.min_cpus as i64).max((needed + 999) / 1000);
            if backend.resize_balloon(idx, delta as i32 - backend.balloons[idx].cpus.len() as i32).is_err()
                || backend.max_free_after_inflate(&backend.balloons[idx], &def) < needed
            {
                backend.destroy_instance(idx);
                return Err(PolicyError::InsufficientCapacity(format!(
                    "new balloon for {} cannot fit request",
                    def.name
                )));
            }
            Ok(idx)
        };

        if def.prefer_new_balloons && can_create_more {
            if let Ok(idx) = try_new(self) {
                return Ok(idx);
            }
        }

        if let Some(idx) = self
            .instances_of(def_name)
            .into_iter()
            .filter(|b| self.free_milli(b) >= needed)
            .max_by_key(|b| self.free_milli(b))
            .map(|b| b.idx)
        {
            return Ok(idx);
        }
        if let Some(idx) = self
            .instances_of(def_name)
            .into_iter()
            .filter(|b| self.max_free_after_inflate(b, &def) >= needed)
            .max_by_key(|b| self.max_free_after_inflate(b, &def))
            .map(|b| b.idx)
        {
            return Ok(idx);
        }
        if can_create_more {
            return try_new(self);
        }
        Err(PolicyError::MaxBalloonsReached(def.name.clone()))
    }

    fn create_instance(&mut self, def: &BalloonDef, group_key: Option<String>) -> BalloonIdx {
        let instance_index = self.instances_of(&def.name).len() as u32;
        let idx = self.balloons.len();
        let mut balloon = Balloon::new(idx, &def.name, instance_index);
        balloon.group_key = group_key;
        if def.is_composite() {
            balloon.components = def
                .components
                .iter()
                .filter_map(|name| self.balloons.iter().find(|b| &b.def_name == name).map(|b| b.idx))
                .collect();
        }
        self.balloons.push(balloon);
        idx
    }

    /// Removes only `idx`, not the tail, then re-threads every reference to
    /// the indices shifted down behind it: `Balloon::idx` (the subscript
    /// every other method relies on matching its vec position) and any
    /// composite balloon's `components`.
    fn destroy_instance(&mut self, idx: BalloonIdx) {
        let removed = self.balloons.remove(idx);
        self.free_cpus.union_with(&removed.cpus);
        for balloon in self.balloons.iter_mut().skip(idx) {
            balloon.idx -= 1;
        }
        for balloon in self.balloons.iter_mut() {
            for comp in balloon.components.iter_mut() {
                if *comp > idx {
                    *comp -= 1;
                }
            }
        }
    }

    /// §4.5.3: grow/shrink a balloon's owned cpuset by `delta` whole CPUs.
    fn resize_balloon(&mut self, idx: BalloonIdx, delta: i32) -> PolicyResult<()> {
        if self.balloons[idx].def_name == RESERVED_BALLOON || delta == 0 {
            return Ok(());
        }
        let def = self.def_by_name(&self.balloons[idx].def_name.clone());
        if let Some(def) = &def {
            if def.is_composite() {
                return self.resize_composite(idx, delta, def);
            }
        }
        let allocator = CpuAllocator::new(&self.tree);
        let current = self.balloons[idx].cpus.clone();
        let prio = self.config.default_cpu_priority;
        let (added, removed) = allocator.resize(&current, &self.free_cpus, delta as i64, prio, &[])?;
        self.free_cpus.subtract_from(&added);
        self.balloons[idx].cpus.union_with(&added);
        self.balloons[idx].cpus.subtract_from(&removed);
        self.free_cpus.union_with(&removed);
        for b in self.balloons.iter_mut() {
            b.shared_idle_cpus.subtract_from(&added);
        }
        self.recompute_shared_idle();
        Ok(())
    }

    fn resize_composite(&mut self, idx: BalloonIdx, delta: i32, def: &BalloonDef) -> PolicyResult<()> {
        let components = self.balloons[idx].components.clone();
        if components.is_empty() {
            return Ok(());
        }
        let per = delta / components.len() as i32;
        let mut remainder = delta - per * components.len() as i32;
        for comp in components {
            let mut this_delta = per;
            if remainder != 0 {
                this_delta += remainder.signum();
                remainder -= remainder.signum();
            }
            self.resize_balloon(comp, this_delta)?;
        }
        let components = self.balloons[idx].components.clone();
        let mut union = CpuSet::new();
        for comp in &components {
            union.union_with(&self.balloons[*comp].cpus);
        }
        self.balloons[idx].cpus = union;
        let _ = def;
        Ok(())
    }

    /// §4.5.3 tail: recompute `shared_idle_cpus` for every opted-in balloon.
    fn recompute_shared_idle(&mut self) {
        let levels: Vec<(BalloonIdx, Level)> = self
            .balloons
            .iter()
            .filter_map(|b| self.def_by_name(&b.def_name).and_then(|d| d.share_idle_cpus_in_same).map(|l| (b.idx, l)))
            .collect();
        for (idx, level) in levels {
            let own_cpus = self.balloons[idx].cpus.clone();
            if own_cpus.is_empty() {
                continue;
            }
            let mut idle = CpuSet::new();
            for node in self.tree.nodes() {
                if level_matches(node.kind, level) && node.cpus.intersects(&own_cpus) {
                    idle.union_with(&node.cpus.intersection(&self.free_cpus));
                }
            }
            self.balloons[idx].shared_idle_cpus = idle;
        }
    }

    fn effective_cpuset(&self, balloon: &Balloon, hide_hyperthreads: bool) -> CpuSet {
        let set = balloon.cpus.union(&balloon.shared_idle_cpus);
        if hide_hyperthreads {
            self.tree.single_thread_for(&set)
        } else {
            set
        }
    }

    fn ensure_size(&mut self, idx: BalloonIdx) -> PolicyResult<()> {
        if self.balloons[idx].def_name == RESERVED_BALLOON {
            return Ok(());
        }
        let def = self
            .def_by_name(&self.balloons[idx].def_name.clone())
            .unwrap_or_else(|| builtin_def(DEFAULT_BALLOON));
        let used = self.assigned_milli(&self.balloons[idx]);
        let needed_cpus = ((used.max(1000) + 999) / 1000) as u32;
        let bounded = needed_cpus.clamp(def.min_cpus.max(1), def.max_cpus.max(def.min_cpus).max(1));
        let current = self.balloons[idx].cpus.len() as i32;
        let delta = bounded as i32 - current;
        if delta != 0 {
            self.resize_balloon(idx, delta)?;
        }
        Ok(())
    }

    fn commit_memory(&mut self, idx: BalloonIdx, req: &Request) -> PolicyResult<Vec<u32>> {
        let def = self.def_by_name(&self.balloons[idx].def_name.clone());
        let types = def.map(|d| d.memory_types).unwrap_or(MemoryType::all());
        let mems = self.balloons[idx].mems.clone();
        let candidate_mems = if mems.is_empty() {
            let leaf = self
                .tree
                .nodes()
                .iter()
                .find(|n| self.balloons[idx].cpus.iter().next().map(|c| n.cpus.contains(*c)).unwrap_or(false))
                .map(|n| n.mem_nodes.clone())
                .unwrap_or_default();
            leaf
        } else {
            mems
        };
        let offer = self.mem.offer(&req.container_id, req.mem_req.max(1), &candidate_mems, types);
        if !offer.satisfied {
            return Err(PolicyError::InsufficientCapacity(format!(
                "no memory offer for {}",
                req.container_id
            )));
        }
        let zone = self.mem.commit(&req.container_id, &offer, req.mem_req.max(1), types)?;
        if self.balloons[idx].mems.is_empty() {
            self.balloons[idx].mems = zone.clone();
        }
        Ok(zone)
    }
}

fn level_matches(kind: crate::core::topology::NodeKind, level: Level) -> bool {
    use crate::core::topology::NodeKind;
    matches!(
        (level, kind),
        (Level::System, NodeKind::VirtualRoot)
            | (Level::Package, NodeKind::Socket)
            | (Level::Die, NodeKind::Die)
            | (Level::Numa, NodeKind::NumaNode)
    )
}

impl PolicyBackend for BalloonsBackend {
    fn allocate(&mut self, req: Request) -> PolicyResult<Grant> {
        let def_name = self.choose_def_name(&req)?;
        let idx = self.choose_instance(&def_name, &req)?;
        self.balloons[idx].add_container(req.pod_id.clone(), req.container_id.clone());
        if let Err(e) = self.ensure_size(idx) {
            self.balloons[idx].remove_container(&req.pod_id, &req.container_id);
            return Err(e);
        }
        let zone = match self.commit_memory(idx, &req) {
            Ok(z) => z,
            Err(e) => {
                self.balloons[idx].remove_container(&req.pod_id, &req.container_id);
                let _ = self.ensure_size(idx);
                return Err(e);
            }
        };

        let pool_id_for_cold_start = self
            .tree
            .nodes()
            .iter()
            .find(|n| self.balloons[idx].cpus.iter().next().map(|c| n.cpus.contains(*c)).unwrap_or(false))
            .map(|n| n.id)
            .unwrap_or(self.tree.root());
        let cold_start = req.cold_start.filter(|d| d.as_nanos() > 0 && self.cold_start_enabled);

        let grant = Grant {
            container_id: req.container_id.clone(),
            node: pool_id_for_cold_start,
            pool_name: self.balloons[idx].name(),
            exclusive: CpuSet::new(),
            isolated_portion: CpuSet::new(),
            cpu_portion: Milli(req.fraction.0.max(req.full as i64 * 1000)),
            from_reserved: def_name == RESERVED_BALLOON,
            memory_zone: zone,
            memory_size: req.mem_req,
            memory_type: req.memory_type,
            cold_start: cold_start.map(|d| ColdStartState { total: d, elapsed: Duration::ZERO, widened: false }),
            scheduling: SchedulingClass {
                cpu_class: self.def_by_name(&def_name).and_then(|d| d.cpu_class),
                scheduling_priority: None,
            },
            prior_pool_hint: None,
        };
        self.pinning_overrides.insert(req.container_id.clone(), (req.preserve, req.hide_hyperthreads_override));
        self.pending_repins.extend(self.balloons[idx].pod_ids.values().flatten().cloned());
        self.grants.insert(grant.clone());
        Ok(grant)
    }

    fn release(&mut self, container_id: &str) -> PolicyResult<()> {
        let grant = match self.grants.remove(container_id) {
            Some(g) => g,
            None => return Ok(()),
        };
        self.pinning_overrides.remove(container_id);
        self.mem.release(container_id);
        if let Some(balloon) = self.balloons.iter_mut().find(|b| b.name() == grant.pool_name) {
            let idx = balloon.idx;
            for (pod_id, containers) in self.balloons[idx].pod_ids.clone() {
                if containers.iter().any(|c| c == container_id) {
                    self.balloons[idx].remove_container(&pod_id, container_id);
                    break;
                }
            }
            self.ensure_size(idx)?;
            self.pending_repins.extend(self.balloons[idx].pod_ids.values().flatten().cloned());
        }
        Ok(())
    }

    fn update(&mut self, container_id: &str, req: Request) -> PolicyResult<Grant> {
        self.release(container_id)?;
        self.allocate(req)
    }

    fn grants(&self) -> &GrantTable {
        &self.grants
    }

    fn topology_zones(&self) -> TopologyZones {
        let pools = self
            .balloons
            .iter()
            .map(|b| PoolDescriptor {
                id: b.idx,
                name: b.name(),
                depth: 0,
                cpus: b.cpus.len(),
                free_shared_milli: self.free_milli(b),
                free_isolated: 0,
                free_reserved: if b.def_name == RESERVED_BALLOON { b.cpus.len() } else { 0 },
                memory_capacity: self.mem.zone_capacity(&b.mems),
                memory_free: self.mem.zone_free(&b.mems),
            })
            .collect();
        TopologyZones { pools }
    }

    fn export_resource_data(&self, container_id: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(grant) = self.grants.get(container_id) {
            if let Some(balloon) = self.balloons.iter().find(|b| b.name() == grant.pool_name) {
                let hide = self.def_by_name(&balloon.def_name).map(|d| d.hide_hyperthreads).unwrap_or(false);
                out.insert("CPU_SHARED".to_string(), self.effective_cpuset(balloon, hide).to_string());
            }
            out.insert(
                "MEMORY_NUMA_NODES".to_string(),
                grant.memory_zone.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(","),
            );
            out.insert("BALLOON".to_string(), grant.pool_name.clone());
        }
        out
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot { grants: self.grants.clone(), balloons: Some(self.balloons.clone()) }
    }

    fn restore(&mut self, snap: Snapshot) -> PolicyResult<()> {
        if let Some(balloons) = snap.balloons {
            self.balloons = balloons;
        }
        let mut used = CpuSet::new();
        for b in &self.balloons {
            used.union_with(&b.cpus);
        }
        let mut free = self.tree.node(self.tree.root()).cpus.clone();
        free.subtract_from(&used);
        self.free_cpus = free;
        self.grants = snap.grants;
        Ok(())
    }

    fn pending_cold_starts(&self) -> Vec<(ContainerId, Duration)> {
        self.grants
            .iter()
            .filter_map(|(id, g)| g.cold_start.as_ref().map(|cs| (id.clone(), cs.total.saturating_sub(cs.elapsed))))
            .collect()
    }

    fn cold_start_done(&mut self, container_id: &str) -> PolicyResult<()> {
        let zone = self
            .grants
            .get(container_id)
            .map(|g| g.memory_zone.clone())
            .ok_or_else(|| PolicyError::AllocatorInternal(format!("no grant for {}", container_id)))?;
        let widened = self.mem.realloc(container_id, &zone, MemoryType::DRAM | MemoryType::PMEM)?;
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
        let (preserve, hide_override) = self.pinning_overrides.get(container_id).copied().unwrap_or((false, None));
        if preserve {
            return None;
        }
        let grant = self.grants.get(container_id)?;
        let balloon = self.balloons.iter().find(|b| b.name() == grant.pool_name)?;
        let hide = hide_override.unwrap_or_else(|| self.def_by_name(&balloon.def_name).map(|d| d.hide_hyperthreads).unwrap_or(false));
        Some(PinningDecision {
            cpuset_cpus: self.effective_cpuset(balloon, hide),
            cpuset_mems: grant.memory_zone.clone(),
            cpu_shares: grant.cpu_portion.0,
            cpu_class: grant.scheduling.cpu_class.clone(),
            scheduling_priority: grant.scheduling.scheduling_priority,
        })
    }
}
