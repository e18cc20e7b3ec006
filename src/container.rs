//! The `Container` capability consumed by the core (§6). The runtime
//! adapter owns the concrete implementation (pod/container cache, cgroup
//! setters); the core only ever sees this trait.

use std::collections::BTreeMap;

use crate::core::cpuset::CpuSet;
use crate::core::request::{ContainerId, PodId, QosClass};

#[derive(Clone, Debug, Default)]
pub struct ResourceRequirements {
    pub cpu_request_milli: i64,
    pub cpu_limit_milli: Option<i64>,
    pub memory_request_bytes: u64,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct TopologyHintSpec {
    pub provider: String,
    pub cpus: Vec<u32>,
    pub nodes: Vec<u32>,
}

/// Decisions the core emits via the container's setters. The runtime
/// adapter applies them to cgroups/NRI; the core never pokes the kernel.
#[derive(Clone, Debug, Default)]
pub struct PinningDecision {
    pub cpuset_cpus: CpuSet,
    pub cpuset_mems: Vec<u32>,
    pub cpu_shares: i64,
    pub cpu_class: Option<String>,
    pub scheduling_priority: Option<i32>,
}

/// Capability object the runtime adapter hands to the core for each
/// container (§6). The core reads requests/annotations/hints and writes
/// pinning decisions back through `set_pinning`.
pub trait Container {
    fn id(&self) -> ContainerId;
    fn pod_id(&self) -> PodId;
    fn name(&self) -> String;
    fn namespace(&self) -> String;
    fn qos_class(&self) -> QosClass;
    fn resources(&self) -> ResourceRequirements;
    fn annotations(&self) -> BTreeMap<String, String>;
    fn pod_annotations(&self) -> BTreeMap<String, String>;
    fn labels(&self) -> BTreeMap<String, String>;
    fn topology_hints(&self) -> Vec<TopologyHintSpec>;
    /// Consulted by `Engine::allocate_device_claim` for the device
    /// co-allocation claim key (§4.4.2, §6).
    fn environment(&self) -> BTreeMap<String, String>;
    fn creation_time(&self) -> f64;
    fn pod_creation_time(&self) -> f64;

    fn set_pinning(&mut self, decision: PinningDecision);

    /// Effective annotation lookup: container-specific key wins over the
    /// pod-level key (§6 Resolution order).
    fn effective_annotation(&self, key: &str) -> Option<String> {
        self.annotations()
            .get(key)
            .cloned()
            .or_else(|| self.pod_annotations().get(key).cloned())
    }
}
