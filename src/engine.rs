//! Event dispatcher (§4.6, §5, §6): the single entry point the runtime
//! adapter drives. Every public method runs to completion before the next
//! is accepted — there is no suspension point anywhere in this module.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::annotations::{self, AnnotationOverrides};
use crate::config::Config;
use crate::container::{Container, PinningDecision};
use crate::core::cpuset::CpuSet;
use crate::core::grant::Grant;
use crate::core::request::{ContainerId, CpuPriority, CpuType, Milli, MemoryType, QosClass, Request, TopologyHint};
use crate::core::snapshot::Snapshot;
use crate::error::{PolicyError, PolicyResult};
use crate::policy::{Backend, PolicyBackend, Stats, TopologyZones};
use crate::rwgate::RwGate;

/// Environment variable a container uses to demand device co-allocation
/// (§6 "environment list (for device claims)"), a `cpuset.cpus`-style
/// range list such as `"4-5,9"`.
pub const DEVICE_CLAIM_ENV_KEY: &str = "RESOURCE_POLICY_DEVICE_CLAIM_CPUS";

/// Internal events the engine itself enqueues and replays (§5
/// "Cancellation"/"Suspension" — the cold-start timer is the only one).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ContainerStarted(ContainerId),
    ColdStartDone(ContainerId),
}

/// Builds the `Request` the backends consume from a `Container` capability
/// and its resolved annotations (§6 "Container capability", "Annotations").
pub fn build_request(container: &dyn Container, cfg: &Config) -> Request {
    let ns = container.namespace();
    let overrides: AnnotationOverrides = annotations::resolve(container, &ns);
    let res = container.resources();
    let qos = container.qos_class();

    let exclusive_eligible = qos == QosClass::Guaranteed
        && res.cpu_limit_milli.map(|l| l == res.cpu_request_milli).unwrap_or(false)
        && res.cpu_request_milli % 1000 == 0
        && res.cpu_request_milli > 0;

    let (full, fraction) = if exclusive_eligible {
        ((res.cpu_request_milli / 1000) as u32, Milli::ZERO)
    } else {
        (0, Milli(res.cpu_request_milli.max(0)))
    };

    let cpu_type = if qos == QosClass::BestEffort {
        CpuType::Preserve
    } else if overrides.prefer_reserved_cpus == Some(true)
        || cfg.reserved_pool_namespaces.iter().any(|p| crate::core::balloon::glob_match(p, &ns))
    {
        CpuType::Reserved
    } else {
        CpuType::Normal
    };

    let isolate = overrides.prefer_isolated_cpus == Some(true);
    let cpu_prio = overrides.prefer_cpu_priority.unwrap_or(cfg.default_cpu_priority);
    let memory_type = overrides.memory_type.unwrap_or_default();
    let hide_hyperthreads_override = overrides.hide_hyperthreads;

    let topology_hints: Vec<TopologyHint> = if overrides.pick_by_hints.unwrap_or(false) {
        container
            .topology_hints()
            .into_iter()
            .map(|h| TopologyHint { provider: h.provider, cpus: h.cpus, nodes: h.nodes })
            .collect()
    } else {
        Vec::new()
    };

    Request {
        container_id: container.id(),
        pod_id: container.pod_id(),
        qos,
        full,
        fraction,
        isolate,
        cpu_type,
        cpu_prio,
        mem_req: res.memory_request_bytes,
        mem_limit: res.memory_limit_bytes.unwrap_or(res.memory_request_bytes),
        memory_type,
        cold_start: overrides.cold_start,
        affinity: BTreeMap::new(),
        topology_hints,
        pool_hint: None,
        namespace: ns,
        labels: container.labels(),
        balloon_def_override: overrides.balloon_def,
        hide_hyperthreads_override,
        preserve: matches!(cpu_type, CpuType::Preserve),
    }
}

/// The node-level resource policy engine: one backend, serialized behind a
/// reentrancy gate (§5 "Shared resource discipline").
pub struct Engine {
    backend: Backend,
    config: Config,
    gate: RwGate,
    errors_by_kind: BTreeMap<&'static str, u64>,
}

impl Engine {
    pub fn new(backend: Backend, config: Config) -> Self {
        Self { backend, config, gate: RwGate::new(), errors_by_kind: BTreeMap::new() }
    }

    /// Records a backend failure's kind for `stats()`, then passes the
    /// result through unchanged.
    fn track<T>(&mut self, result: PolicyResult<T>) -> PolicyResult<T> {
        if let Err(ref e) = result {
            *self.errors_by_kind.entry(e.kind()).or_insert(0) += 1;
        }
        result
    }

    /// In-memory health snapshot (grant count, per-kind error counters)
    /// alongside `GetTopologyZones()`.
    pub fn stats(&self) -> Stats {
        Stats {
            grant_count: self.gate.with_read(|| self.backend.grants().len()),
            errors_by_kind: self.errors_by_kind.clone(),
        }
    }

    /// `Start()`: restores grants from a cache snapshot, if one exists.
    pub fn start(&mut self, snapshot: Option<Snapshot>) -> PolicyResult<()> {
        let outcome = self.gate.with_write(|| {
            if let Some(snap) = snapshot {
                self.backend.restore(snap)?;
            }
            Ok(())
        });
        self.track(outcome)
    }

    /// `AllocateResources(c)`. Returns re-pin decisions for other containers
    /// whose shared/idle cpuset shifted as a side effect; the caller applies
    /// each through its own container handle.
    pub fn allocate_resources(
        &mut self,
        container: &mut dyn Container,
    ) -> PolicyResult<Vec<(ContainerId, PinningDecision)>> {
        let req = build_request(container, &self.config);
        let id = container.id();
        let outcome = self.gate.with_write(|| {
            let grant = self.backend.allocate(req)?;
            apply_pinning(&self.backend, &mut *container);
            Ok(grant)
        });
        self.track(outcome)?;
        Ok(self.apply_repins(id))
    }

    /// `ReleaseResources(c)`.
    pub fn release_resources(
        &mut self,
        container: &dyn Container,
    ) -> PolicyResult<Vec<(ContainerId, PinningDecision)>> {
        let id = container.id();
        let outcome = self.gate.with_write(|| self.backend.release(&id));
        self.track(outcome)?;
        Ok(self.apply_repins(id))
    }

    /// `UpdateResources(c)`: release + re-allocate with the prior pool as a
    /// hint (§6 Backend API).
    pub fn update_resources(
        &mut self,
        container: &mut dyn Container,
    ) -> PolicyResult<Vec<(ContainerId, PinningDecision)>> {
        let id = container.id();
        let prior_pool = self.backend.grants().get(&id).map(|g| g.pool_name.clone());
        let mut req = build_request(container, &self.config);
        req.pool_hint = prior_pool;
        let outcome = self.gate.with_write(|| {
            let grant = self.backend.update(&id, req)?;
            apply_pinning(&self.backend, &mut *container);
            Ok(grant)
        });
        self.track(outcome)?;
        Ok(self.apply_repins(id))
    }

    /// Device co-allocation claim (§4.4.2), sourced from the container's
    /// environment list (§6 "Container capability"). A no-op if the
    /// container does not set `DEVICE_CLAIM_ENV_KEY`.
    pub fn allocate_device_claim(
        &mut self,
        container: &dyn Container,
    ) -> PolicyResult<Vec<(ContainerId, PinningDecision)>> {
        let id = container.id();
        let Some(raw) = container.environment().get(DEVICE_CLAIM_ENV_KEY).cloned() else {
            return Ok(Vec::new());
        };
        let cpus: CpuSet = raw
            .parse()
            .map_err(|_| PolicyError::ConfigInvalid(format!("{} is not a valid cpu list: {}", DEVICE_CLAIM_ENV_KEY, raw)))?;
        let outcome = self.gate.with_write(|| self.backend.allocate_claim(&id, &cpus));
        let evicted = self.track(outcome)?;
        let mut out = self.apply_repins(id);
        for evicted_id in evicted {
            warn!("device claim evicted {} to free shared capacity; it holds no grant now", evicted_id);
            out.push((evicted_id, PinningDecision::default()));
        }
        Ok(out)
    }

    /// Releases a device co-allocation claim previously taken over `cpus`.
    pub fn release_device_claim(&mut self, cpus: &CpuSet) -> Vec<(ContainerId, PinningDecision)> {
        self.gate.with_write(|| self.backend.release_claim(cpus));
        self.apply_repins(String::new())
    }

    /// `Sync(add, del)` (§4.6, §5): releases precede allocations; `add` is
    /// processed in pod-then-container creation-time order. Returns the
    /// per-container allocate outcome alongside any re-pins triggered along
    /// the way.
    pub fn sync(
        &mut self,
        add: &mut [&mut dyn Container],
        del: &[ContainerId],
    ) -> (Vec<(ContainerId, PolicyResult<()>)>, Vec<(ContainerId, PinningDecision)>) {
        let mut results = Vec::new();
        let mut repins = Vec::new();
        self.gate.with_write(|| {
            for id in del {
                if let Err(e) = self.backend.release(id) {
                    warn!("sync: release {} failed: {}", id, e);
                    *self.errors_by_kind.entry(e.kind()).or_insert(0) += 1;
                }
            }
        });
        for id in del {
            repins.extend(self.apply_repins(id.clone()));
        }

        add.sort_by(|a, b| {
            a.pod_creation_time()
                .partial_cmp(&b.pod_creation_time())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.creation_time().partial_cmp(&b.creation_time()).unwrap_or(std::cmp::Ordering::Equal))
        });

        for i in 0..add.len() {
            let id = add[i].id();
            let req = build_request(&*add[i], &self.config);
            let outcome = self.gate.with_write(|| {
                let grant = self.backend.allocate(req)?;
                apply_pinning(&self.backend, &mut *add[i]);
                Ok::<Grant, PolicyError>(grant)
            });
            let ok = outcome.is_ok();
            if let Err(ref e) = outcome {
                *self.errors_by_kind.entry(e.kind()).or_insert(0) += 1;
            }
            results.push((id.clone(), outcome.map(|_| ())));
            if ok {
                repins.extend(self.apply_repins(id));
            }
        }
        (results, repins)
    }

    /// `Reconfigure(cfg)` (§4.6): in-place CPU-class rewrite when only class
    /// names differ, otherwise an atomic re-init with verbatim-then-affine
    /// reinstatement, restoring the saved state on total failure.
    pub fn reconfigure(&mut self, new_config: Config, rebuild: impl FnOnce(&Config) -> Backend) -> PolicyResult<()> {
        let outcome = self.gate.with_write(|| {
            if only_cpu_class_differs(&self.config, &new_config) {
                info!("reconfigure: cpu-class-only change, rewriting in place");
                self.config = new_config;
                return Ok(());
            }

            let saved_snapshot = self.backend.snapshot();
            let saved_config = self.config.clone();
            let mut new_backend = rebuild(&new_config);

            let mut failures = Vec::new();
            for (id, grant) in saved_snapshot.grants.iter() {
                if let Err(_) = reinstate_verbatim(&mut new_backend, grant) {
                    failures.push(id.clone());
                }
            }

            for id in &failures {
                let grant = saved_snapshot.grants.get(id).expect("id came from this table");
                if reinstate_with_affinity(&mut new_backend, grant).is_err() {
                    warn!("reconfigure: could not reinstate {} under new config, rolling back", id);
                    self.config = saved_config;
                    self.backend.restore(saved_snapshot)?;
                    return Err(PolicyError::AllocatorInternal(format!(
                        "reconfigure failed to reinstate {}",
                        id
                    )));
                }
            }

            self.backend = new_backend;
            self.config = new_config;
            Ok(())
        });
        self.track(outcome)
    }

    /// `HandleEvent(e)`.
    pub fn handle_event(&mut self, event: Event) -> PolicyResult<Vec<(ContainerId, PinningDecision)>> {
        match event {
            Event::ContainerStarted(id) => {
                info!("container {} started", id);
                Ok(Vec::new())
            }
            Event::ColdStartDone(id) => {
                let outcome = self.gate.with_write(|| self.backend.cold_start_done(&id));
                self.track(outcome)?;
                Ok(self.apply_repins(id))
            }
        }
    }

    /// `GetTopologyZones()`.
    pub fn get_topology_zones(&self) -> TopologyZones {
        self.gate.with_read(|| self.backend.topology_zones())
    }

    /// `ExportResourceData(c)`.
    pub fn export_resource_data(&self, container_id: &str) -> BTreeMap<String, String> {
        self.gate.with_read(|| self.backend.export_resource_data(container_id))
    }

    pub fn pending_cold_starts(&self) -> Vec<(ContainerId, std::time::Duration)> {
        self.gate.with_read(|| self.backend.pending_cold_starts())
    }

    /// Drains containers whose effective cpuset changed as a side effect of
    /// the operation just performed and resolves a fresh pinning decision
    /// for each. The engine holds no reference to these containers (only
    /// the runtime adapter's cache does), so it hands the decisions back
    /// for the adapter to apply through its own container handles.
    fn apply_repins(&mut self, _just_touched: ContainerId) -> Vec<(ContainerId, PinningDecision)> {
        let repins = self.gate.with_write(|| self.backend.drain_pending_repins());
        let mut out = Vec::new();
        for id in repins {
            if let Some(decision) = self.gate.with_read(|| self.backend.pinning_decision(&id)) {
                info!("re-pin {} -> {}", id, decision.cpuset_cpus);
                out.push((id, decision));
            }
        }
        out
    }
}

fn apply_pinning(backend: &Backend, container: &mut dyn Container) {
    if let Some(decision) = backend.pinning_decision(&container.id()) {
        container.set_pinning(decision);
    }
}

fn only_cpu_class_differs(old: &Config, new: &Config) -> bool {
    if old.balloon_defs.len() != new.balloon_defs.len() {
        return false;
    }
    let mut old_clean = old.clone();
    let mut new_clean = new.clone();
    old_clean.idle_cpu_class = String::new();
    new_clean.idle_cpu_class = String::new();
    for def in old_clean.balloon_defs.iter_mut() {
        def.cpu_class = None;
    }
    for def in new_clean.balloon_defs.iter_mut() {
        def.cpu_class = None;
    }
    let unrelated_unchanged = serde_json::to_string(&old_clean).ok() == serde_json::to_string(&new_clean).ok();
    let class_differs = old.idle_cpu_class != new.idle_cpu_class
        || old
            .balloon_defs
            .iter()
            .zip(new.balloon_defs.iter())
            .any(|(a, b)| a.cpu_class != b.cpu_class);
    unrelated_unchanged && class_differs
}

fn request_for_grant(grant: &Grant) -> Request {
    Request {
        container_id: grant.container_id.clone(),
        pod_id: String::new(),
        qos: QosClass::Burstable,
        full: grant.exclusive.len() as u32,
        fraction: grant.cpu_portion,
        isolate: !grant.isolated_portion.is_empty(),
        cpu_type: if grant.from_reserved { CpuType::Reserved } else { CpuType::Normal },
        cpu_prio: CpuPriority::None,
        mem_req: grant.memory_size,
        mem_limit: grant.memory_size,
        memory_type: grant.memory_type,
        cold_start: None,
        affinity: BTreeMap::new(),
        topology_hints: Vec::new(),
        pool_hint: Some(grant.pool_name.clone()),
        namespace: String::new(),
        labels: BTreeMap::new(),
        balloon_def_override: Some(grant.pool_name.split('[').next().unwrap_or(&grant.pool_name).to_string()),
        hide_hyperthreads_override: None,
        preserve: false,
    }
}

fn reinstate_verbatim(backend: &mut Backend, grant: &Grant) -> PolicyResult<()> {
    let req = request_for_grant(grant);
    let fresh = backend.allocate(req)?;
    if fresh.exclusive == grant.exclusive && fresh.memory_zone == grant.memory_zone {
        Ok(())
    } else {
        let _ = backend.release(&grant.container_id);
        Err(PolicyError::AllocatorInternal(format!("could not reinstate {} verbatim", grant.container_id)))
    }
}

fn reinstate_with_affinity(backend: &mut Backend, grant: &Grant) -> PolicyResult<()> {
    let mut req = request_for_grant(grant);
    for node in grant.memory_zone.iter() {
        req.affinity.insert(node.to_string(), 1);
    }
    backend.allocate(req).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ResourceRequirements;
    use crate::core::cpuset::CpuSet;
    use crate::core::memory_allocator::{MemoryAllocator, MemoryNode};
    use crate::core::topology::{CpuTopologyTree, NumaFact};
    use crate::policy::topology_aware::TopologyAwareBackend;
    use std::collections::BTreeMap as Map;

    struct FakeContainer {
        id: String,
        pod: String,
        ns: String,
        qos: QosClass,
        res: ResourceRequirements,
        annotations: BTreeMap<String, String>,
        env: BTreeMap<String, String>,
        last_pin: Option<PinningDecision>,
    }

    impl Container for FakeContainer {
        fn id(&self) -> ContainerId {
            self.id.clone()
        }
        fn pod_id(&self) -> String {
            self.pod.clone()
        }
        fn name(&self) -> String {
            self.id.clone()
        }
        fn namespace(&self) -> String {
            self.ns.clone()
        }
        fn qos_class(&self) -> QosClass {
            self.qos
        }
        fn resources(&self) -> ResourceRequirements {
            self.res.clone()
        }
        fn annotations(&self) -> BTreeMap<String, String> {
            self.annotations.clone()
        }
        fn pod_annotations(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
        fn labels(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
        fn topology_hints(&self) -> Vec<crate::container::TopologyHintSpec> {
            Vec::new()
        }
        fn environment(&self) -> BTreeMap<String, String> {
            self.env.clone()
        }
        fn creation_time(&self) -> f64 {
            0.0
        }
        fn pod_creation_time(&self) -> f64 {
            0.0
        }
        fn set_pinning(&mut self, decision: PinningDecision) {
            self.last_pin = Some(decision);
        }
    }

    fn test_engine() -> Engine {
        let facts = vec![NumaFact {
            socket_id: 0,
            die_id: 0,
            numa_id: 0,
            cpus: CpuSet::from_ids(0..8),
            has_memory: true,
            distance: Map::new(),
        }];
        let tree = CpuTopologyTree::build(&facts).unwrap();
        let mut mem = MemoryAllocator::new();
        mem.add_node(MemoryNode {
            id: 0,
            mem_type: MemoryType::DRAM,
            capacity: 1_000_000,
            used: 0,
            distance: Map::new(),
            movable: false,
        });
        let config = Config::new();
        let backend = Backend::TopologyAware(Box::new(TopologyAwareBackend::new(
            tree,
            mem,
            CpuSet::new(),
            CpuSet::new(),
            config.clone(),
        )));
        Engine::new(backend, config)
    }

    #[test]
    fn allocate_then_release_round_trips() {
        let mut engine = test_engine();
        let mut container = FakeContainer {
            id: "c1".into(),
            pod: "p1".into(),
            ns: "default".into(),
            qos: QosClass::Guaranteed,
            res: ResourceRequirements {
                cpu_request_milli: 2000,
                cpu_limit_milli: Some(2000),
                memory_request_bytes: 100,
                memory_limit_bytes: Some(100),
            },
            annotations: BTreeMap::new(),
            env: BTreeMap::new(),
            last_pin: None,
        };
        engine.allocate_resources(&mut container).unwrap();
        assert!(container.last_pin.is_some());
        assert_eq!(container.last_pin.as_ref().unwrap().cpuset_cpus.len(), 2);
        engine.release_resources(&container).unwrap();
    }

    #[test]
    fn sync_releases_before_allocating() {
        let mut engine = test_engine();
        let mut c1 = FakeContainer {
            id: "c1".into(),
            pod: "p1".into(),
            ns: "default".into(),
            qos: QosClass::Burstable,
            res: ResourceRequirements {
                cpu_request_milli: 500,
                cpu_limit_milli: None,
                memory_request_bytes: 10,
                memory_limit_bytes: None,
            },
            annotations: BTreeMap::new(),
            env: BTreeMap::new(),
            last_pin: None,
        };
        engine.allocate_resources(&mut c1).unwrap();
        let mut c2 = FakeContainer { id: "c2".into(), ..clone_shape(&c1) };
        let mut adds: Vec<&mut dyn Container> = vec![&mut c2];
        let (results, _repins) = engine.sync(&mut adds, &["c1".to_string()]);
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
    }

    fn clone_shape(c: &FakeContainer) -> FakeContainer {
        FakeContainer {
            id: c.id.clone(),
            pod: c.pod.clone(),
            ns: c.ns.clone(),
            qos: c.qos,
            res: c.res.clone(),
            annotations: c.annotations.clone(),
            env: c.env.clone(),
            last_pin: None,
        }
    }

    #[test]
    fn allocate_device_claim_surfaces_evicted_containers_to_caller() {
        let facts = vec![
            NumaFact { socket_id: 0, die_id: 0, numa_id: 0, cpus: CpuSet::from_ids(0..6), has_memory: true, distance: Map::new() },
            NumaFact { socket_id: 0, die_id: 0, numa_id: 1, cpus: CpuSet::from_ids(6..12), has_memory: true, distance: Map::new() },
        ];
        let tree = CpuTopologyTree::build(&facts).unwrap();
        let mut mem = MemoryAllocator::new();
        mem.add_node(MemoryNode { id: 0, mem_type: MemoryType::DRAM, capacity: 1_000_000, used: 0, distance: Map::new(), movable: false });
        mem.add_node(MemoryNode { id: 1, mem_type: MemoryType::DRAM, capacity: 1_000_000, used: 0, distance: Map::new(), movable: false });
        let config = Config::new();
        let backend =
            Backend::TopologyAware(Box::new(TopologyAwareBackend::new(tree, mem, CpuSet::new(), CpuSet::new(), config.clone())));
        let mut engine = Engine::new(backend, config);

        // c1 sits on numa0 with 1 exclusive cpu plus a shared slice that
        // eats the rest of numa0's local capacity.
        let base = Request {
            container_id: "c1".into(),
            pod_id: "p1".into(),
            qos: QosClass::Guaranteed,
            full: 1,
            fraction: Milli::from_cpus(5),
            isolate: false,
            cpu_type: CpuType::Normal,
            cpu_prio: CpuPriority::None,
            mem_req: 100,
            mem_limit: 100,
            memory_type: MemoryType::DRAM,
            cold_start: None,
            affinity: BTreeMap::new(),
            topology_hints: Vec::new(),
            pool_hint: Some("numa0".into()),
            namespace: String::new(),
            labels: BTreeMap::new(),
            balloon_def_override: None,
            hide_hyperthreads_override: None,
            preserve: false,
        };
        let grant = engine.gate.with_write(|| engine.backend.allocate(base.clone())).unwrap();
        let claim_cpus = grant.exclusive.clone();

        // big claims the rest of root's shared capacity directly at the
        // root pool, so root has no room left once c1's cpu is undone.
        let mut big = base.clone();
        big.container_id = "big".into();
        big.full = 0;
        big.fraction = Milli::from_cpus(11);
        big.pool_hint = Some("root".into());
        engine.gate.with_write(|| engine.backend.allocate(big)).unwrap();

        let claimant = FakeContainer {
            id: "device".into(),
            pod: "pdev".into(),
            ns: "default".into(),
            qos: QosClass::Guaranteed,
            res: ResourceRequirements::default(),
            annotations: BTreeMap::new(),
            env: BTreeMap::from([(DEVICE_CLAIM_ENV_KEY.to_string(), claim_cpus.to_string())]),
            last_pin: None,
        };

        let repins = engine.allocate_device_claim(&claimant).unwrap();
        assert!(
            repins.iter().any(|(id, pin)| id == "big" && pin.cpuset_cpus.is_empty()),
            "the evicted container must be surfaced to the caller, not silently dropped: {:?}",
            repins
        );
    }
}
