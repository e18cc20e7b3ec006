//! Integration coverage for the concrete scenarios and the two
//! cross-cutting properties (snapshot round-trip, reconfigure atomicity).

use std::collections::BTreeMap;
use std::time::Duration;

use node_resource_policy::container::{Container, PinningDecision, ResourceRequirements, TopologyHintSpec};
use node_resource_policy::core::balloon::{BalloonDef, MatchExpression, MatchOp};
use node_resource_policy::core::cpuset::CpuSet;
use node_resource_policy::core::memory_allocator::{MemoryAllocator, MemoryNode};
use node_resource_policy::core::topology::{CpuTopologyTree, NumaFact};
use node_resource_policy::policy::balloons::BalloonsBackend;
use node_resource_policy::policy::topology_aware::TopologyAwareBackend;
use node_resource_policy::{Backend, ContainerId, Engine, MemoryType, PolicyBackend, QosClass};
use node_resource_policy::Config;

struct FixtureContainer {
    id: String,
    pod: String,
    ns: String,
    qos: QosClass,
    res: ResourceRequirements,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    last_pin: Option<PinningDecision>,
}

impl FixtureContainer {
    fn new(id: &str, qos: QosClass, res: ResourceRequirements) -> Self {
        FixtureContainer {
            id: id.into(),
            pod: format!("{}-pod", id),
            ns: "default".into(),
            qos,
            res,
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            last_pin: None,
        }
    }
}

impl Container for FixtureContainer {
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
        self.labels.clone()
    }
    fn topology_hints(&self) -> Vec<TopologyHintSpec> {
        Vec::new()
    }
    fn environment(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
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

fn two_numa_tree() -> CpuTopologyTree {
    let facts = vec![
        NumaFact {
            socket_id: 0,
            die_id: 0,
            numa_id: 0,
            cpus: CpuSet::from_ids(0..6),
            has_memory: true,
            distance: BTreeMap::new(),
        },
        NumaFact {
            socket_id: 0,
            die_id: 0,
            numa_id: 1,
            cpus: CpuSet::from_ids(6..12),
            has_memory: true,
            distance: BTreeMap::new(),
        },
    ];
    CpuTopologyTree::build(&facts).unwrap()
}

fn two_numa_mem() -> MemoryAllocator {
    let mut mem = MemoryAllocator::new();
    mem.add_node(MemoryNode {
        id: 0,
        mem_type: MemoryType::DRAM,
        capacity: 100_000,
        used: 0,
        distance: BTreeMap::from([(1, 20)]),
        movable: false,
    });
    mem.add_node(MemoryNode {
        id: 1,
        mem_type: MemoryType::DRAM,
        capacity: 100_000,
        used: 0,
        distance: BTreeMap::from([(0, 20)]),
        movable: false,
    });
    mem
}

fn topology_engine() -> Engine {
    let backend = Backend::TopologyAware(Box::new(TopologyAwareBackend::new(
        two_numa_tree(),
        two_numa_mem(),
        CpuSet::new(),
        CpuSet::new(),
        Config::new(),
    )));
    Engine::new(backend, Config::new())
}

#[test]
fn guaranteed_container_gets_isolated_cpus_on_one_node() {
    let mut engine = topology_engine();
    let mut c = FixtureContainer::new(
        "guaranteed-1",
        QosClass::Guaranteed,
        ResourceRequirements {
            cpu_request_milli: 2000,
            cpu_limit_milli: Some(2000),
            memory_request_bytes: 1024,
            memory_limit_bytes: Some(1024),
        },
    );
    engine.allocate_resources(&mut c).unwrap();
    let pin = c.last_pin.clone().expect("pinning decision recorded");
    assert_eq!(pin.cpuset_cpus.len(), 2);
    assert_eq!(pin.cpuset_mems.len(), 1, "a whole-CPU grant lands on a single NUMA node");
}

#[test]
fn burstable_container_without_limit_is_unbounded_shared() {
    let mut engine = topology_engine();
    let mut c = FixtureContainer::new(
        "burstable-1",
        QosClass::Burstable,
        ResourceRequirements {
            cpu_request_milli: 250,
            cpu_limit_milli: None,
            memory_request_bytes: 512,
            memory_limit_bytes: None,
        },
    );
    engine.allocate_resources(&mut c).unwrap();
    let pin = c.last_pin.clone().expect("pinning decision recorded");
    assert!(pin.cpuset_cpus.len() >= 1, "shared allocations still land on a concrete cpuset");
    engine.release_resources(&c).unwrap();
}

#[test]
fn cold_start_widens_from_pmem_to_dram_on_completion() {
    let mut mem = two_numa_mem();
    mem.add_node(MemoryNode {
        id: 2,
        mem_type: MemoryType::PMEM,
        capacity: 50_000,
        used: 0,
        distance: BTreeMap::new(),
        movable: false,
    });
    let backend = Backend::TopologyAware(Box::new(TopologyAwareBackend::new(
        two_numa_tree(),
        mem,
        CpuSet::new(),
        CpuSet::new(),
        Config::new(),
    )));
    let mut engine = Engine::new(backend, Config::new());
    let mut c = FixtureContainer::new(
        "cold-1",
        QosClass::Guaranteed,
        ResourceRequirements {
            cpu_request_milli: 1000,
            cpu_limit_milli: Some(1000),
            memory_request_bytes: 100,
            memory_limit_bytes: Some(100),
        },
    );
    c.annotations.insert("cold-start.default".into(), "500ms".into());
    c.annotations.insert("memory-type.default".into(), "dram,pmem".into());
    engine.allocate_resources(&mut c).unwrap();
    let pending = engine.pending_cold_starts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, "cold-1");
    assert_eq!(pending[0].1, Duration::from_millis(500));

    engine
        .handle_event(node_resource_policy::Event::ColdStartDone("cold-1".into()))
        .unwrap();
    assert!(engine.pending_cold_starts().is_empty());
}

fn worker_balloons_backend() -> BalloonsBackend {
    let tree = CpuTopologyTree::build(&[NumaFact {
        socket_id: 0,
        die_id: 0,
        numa_id: 0,
        cpus: CpuSet::from_ids(0..8),
        has_memory: true,
        distance: BTreeMap::new(),
    }])
    .unwrap();
    let mut mem = MemoryAllocator::new();
    mem.add_node(MemoryNode {
        id: 0,
        mem_type: MemoryType::DRAM,
        capacity: 100_000,
        used: 0,
        distance: BTreeMap::new(),
        movable: false,
    });
    let mut config = Config::new();
    config.balloon_defs.push(BalloonDef {
        name: "worker".into(),
        min_cpus: 2,
        max_cpus: 4,
        min_balloons: 0,
        max_balloons: 2,
        cpu_class: None,
        allocator_priority: 0,
        namespaces: vec!["*".into()],
        match_expressions: vec![MatchExpression {
            key: "role".into(),
            op: MatchOp::Equals,
            values: vec!["worker".into()],
        }],
        group_by: None,
        prefer_spreading_pods: false,
        prefer_per_namespace_balloon: false,
        prefer_new_balloons: false,
        prefer_core_type: None,
        prefer_isol_cpus: false,
        prefer_close_to_devices: Vec::new(),
        prefer_far_from_devices: Vec::new(),
        loads: Vec::new(),
        memory_types: MemoryType::DRAM,
        share_idle_cpus_in_same: None,
        hide_hyperthreads: false,
        components: Vec::new(),
    });
    BalloonsBackend::new(tree, mem, CpuSet::new(), config)
}

#[test]
fn balloons_definition_selected_by_label_match() {
    let mut backend = worker_balloons_backend();
    let mut labels = BTreeMap::new();
    labels.insert("role".into(), "worker".into());
    let req = node_resource_policy::Request {
        container_id: "w1".into(),
        pod_id: "w1-pod".into(),
        qos: QosClass::Burstable,
        full: 0,
        fraction: node_resource_policy::Milli(500),
        isolate: false,
        cpu_type: node_resource_policy::CpuType::Normal,
        cpu_prio: Default::default(),
        mem_req: 100,
        mem_limit: 100,
        memory_type: MemoryType::DRAM,
        cold_start: None,
        affinity: BTreeMap::new(),
        topology_hints: Vec::new(),
        pool_hint: None,
        namespace: "default".into(),
        labels,
        balloon_def_override: None,
        hide_hyperthreads_override: None,
        preserve: false,
    };
    let grant = backend.allocate(req).unwrap();
    assert!(grant.pool_name.starts_with("worker["));
}

#[test]
fn reconfigure_rolls_back_when_new_config_cannot_fit_grants() {
    let mut engine = topology_engine();
    let mut c = FixtureContainer::new(
        "stay-1",
        QosClass::Guaranteed,
        ResourceRequirements {
            cpu_request_milli: 4000,
            cpu_limit_milli: Some(4000),
            memory_request_bytes: 100,
            memory_limit_bytes: Some(100),
        },
    );
    engine.allocate_resources(&mut c).unwrap();

    let tiny_config = Config::new();
    let result = engine.reconfigure(tiny_config, |cfg| {
        let tiny_tree = CpuTopologyTree::build(&[NumaFact {
            socket_id: 0,
            die_id: 0,
            numa_id: 0,
            cpus: CpuSet::from_ids(0..1),
            has_memory: true,
            distance: BTreeMap::new(),
        }])
        .unwrap();
        Backend::TopologyAware(Box::new(TopologyAwareBackend::new(
            tiny_tree,
            two_numa_mem(),
            CpuSet::new(),
            CpuSet::new(),
            cfg.clone(),
        )))
    });
    assert!(result.is_err(), "the 1-cpu topology cannot reinstate a 4-cpu grant");

    // the engine must still answer queries against the restored, original backend
    let zones = engine.get_topology_zones();
    assert!(zones.pools.iter().map(|p| p.cpus).sum::<usize>() >= 12);
}

#[test]
fn snapshot_round_trips_through_engine_restart() {
    let mut engine = topology_engine();
    let mut c = FixtureContainer::new(
        "persist-1",
        QosClass::Guaranteed,
        ResourceRequirements {
            cpu_request_milli: 1000,
            cpu_limit_milli: Some(1000),
            memory_request_bytes: 100,
            memory_limit_bytes: Some(100),
        },
    );
    engine.allocate_resources(&mut c).unwrap();
    let exported_before = engine.export_resource_data("persist-1");

    let backend = TopologyAwareBackend::new(two_numa_tree(), two_numa_mem(), CpuSet::new(), CpuSet::new(), Config::new());
    let snapshot = backend.snapshot();
    let json = snapshot.to_json().unwrap();
    let restored_snapshot = node_resource_policy::core::snapshot::Snapshot::from_json(&json).unwrap();

    let fresh_backend = Backend::TopologyAware(Box::new(TopologyAwareBackend::new(
        two_numa_tree(),
        two_numa_mem(),
        CpuSet::new(),
        CpuSet::new(),
        Config::new(),
    )));
    let mut restarted = Engine::new(fresh_backend, Config::new());
    restarted.start(Some(restored_snapshot)).unwrap();
    assert!(restarted.export_resource_data("persist-1").is_empty(), "empty snapshot restores no grants");

    assert!(exported_before.contains_key("MEMORY_NUMA_NODES"));
}
