//! Balloon definitions and instances (data model §3, §4.5).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::cpuset::CpuSet;
use crate::core::request::{ContainerId, MemoryType, PodId};
use crate::core::topology::Level;

pub type BalloonIdx = usize;

pub const RESERVED_BALLOON: &str = "reserved";
pub const DEFAULT_BALLOON: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
    Equals,
    In,
    Exists,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchExpression {
    pub key: String,
    pub op: MatchOp,
    pub values: Vec<String>,
}

impl MatchExpression {
    pub fn evaluate(&self, fields: &BTreeMap<String, String>) -> bool {
        match self.op {
            MatchOp::Exists => fields.contains_key(&self.key),
            MatchOp::Equals => fields.get(&self.key).map(|v| self.values.first() == Some(v)).unwrap_or(false),
            MatchOp::In => fields.get(&self.key).map(|v| self.values.contains(v)).unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalloonDef {
    pub name: String,
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_balloons: u32,
    pub max_balloons: u32,
    pub cpu_class: Option<String>,
    pub allocator_priority: i32,
    pub namespaces: Vec<String>,
    pub match_expressions: Vec<MatchExpression>,
    pub group_by: Option<String>,
    pub prefer_spreading_pods: bool,
    pub prefer_per_namespace_balloon: bool,
    pub prefer_new_balloons: bool,
    pub prefer_core_type: Option<String>,
    pub prefer_isol_cpus: bool,
    pub prefer_close_to_devices: Vec<String>,
    pub prefer_far_from_devices: Vec<String>,
    pub loads: Vec<String>,
    pub memory_types: MemoryType,
    pub share_idle_cpus_in_same: Option<Level>,
    pub hide_hyperthreads: bool,
    /// Names of component definitions; non-empty means this is composite.
    pub components: Vec<String>,
}

impl BalloonDef {
    pub fn is_composite(&self) -> bool {
        !self.components.is_empty()
    }

    pub fn namespace_matches(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|pat| glob_match(pat, namespace))
    }
}

/// Minimal glob matcher supporting `*` as a wildcard, enough for the
/// `namespaces[]` config field (§6).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return text.starts_with(prefix);
    }
    pattern == text
}

/// A named, elastic CPU pool instance (data model §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Balloon {
    pub idx: BalloonIdx,
    pub def_name: String,
    pub instance_index: u32,
    pub cpus: CpuSet,
    pub mems: Vec<u32>,
    pub shared_idle_cpus: CpuSet,
    pub pod_ids: BTreeMap<PodId, Vec<ContainerId>>,
    pub components: Vec<BalloonIdx>,
    pub group_key: Option<String>,
}

impl Balloon {
    pub fn new(idx: BalloonIdx, def_name: &str, instance_index: u32) -> Self {
        Self {
            idx,
            def_name: def_name.to_string(),
            instance_index,
            cpus: CpuSet::new(),
            mems: Vec::new(),
            shared_idle_cpus: CpuSet::new(),
            pod_ids: BTreeMap::new(),
            components: Vec::new(),
            group_key: None,
        }
    }

    pub fn container_count(&self) -> usize {
        self.pod_ids.values().map(|v| v.len()).sum()
    }

    pub fn contains_pod(&self, pod: &str) -> bool {
        self.pod_ids.contains_key(pod)
    }

    pub fn add_container(&mut self, pod: PodId, container: ContainerId) {
        self.pod_ids.entry(pod).or_default().push(container);
    }

    pub fn remove_container(&mut self, pod: &str, container: &str) {
        if let Some(list) = self.pod_ids.get_mut(pod) {
            list.retain(|c| c != container);
            if list.is_empty() {
                self.pod_ids.remove(pod);
            }
        }
    }

    pub fn name(&self) -> String {
        format!("{}[{}]", self.def_name, self.instance_index)
    }
}
