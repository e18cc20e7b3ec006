//! Allocation request derived from a `Container`, and the handful of small
//! value types (milli-CPU quantities, QoS class, memory type mask) it is
//! built from.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type ContainerId = String;
pub type PodId = String;

/// A milli-CPU quantity (1000 == one full CPU), the unit grants and
/// supplies account fractional allocations in throughout the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Milli(pub i64);

impl Milli {
    pub const ZERO: Milli = Milli(0);

    pub fn from_cpus(cpus: u32) -> Self {
        Milli(cpus as i64 * 1000)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl std::ops::Add for Milli {
    type Output = Milli;
    fn add(self, rhs: Milli) -> Milli {
        Milli(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Milli {
    type Output = Milli;
    fn sub(self, rhs: Milli) -> Milli {
        Milli(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Milli {
    fn sum<I: Iterator<Item = Milli>>(iter: I) -> Self {
        iter.fold(Milli::ZERO, |a, b| a + b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuType {
    Normal,
    Reserved,
    Preserve,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuPriority {
    High,
    Normal,
    Low,
    None,
}

impl Default for CpuPriority {
    fn default() -> Self {
        CpuPriority::None
    }
}

bitflags::bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct MemoryType: u8 {
        const DRAM = 0b0001;
        const PMEM = 0b0010;
        const HBM  = 0b0100;
        const PRESERVE = 0b1000;
    }
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::DRAM
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyHint {
    pub provider: String,
    pub cpus: Vec<u32>,
    pub nodes: Vec<u32>,
}

/// An allocation request derived from a `Container` (data model §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub container_id: ContainerId,
    pub pod_id: PodId,
    pub qos: QosClass,
    /// Whole exclusive CPUs to grant.
    pub full: u32,
    /// Milli-CPU to grant from the shared pool.
    pub fraction: Milli,
    pub isolate: bool,
    pub cpu_type: CpuType,
    pub cpu_prio: CpuPriority,
    pub mem_req: u64,
    pub mem_limit: u64,
    pub memory_type: MemoryType,
    pub cold_start: Option<Duration>,
    pub affinity: std::collections::BTreeMap<String, i32>,
    pub topology_hints: Vec<TopologyHint>,
    /// Name of the pool to prefer, set by `Update`/`Reconfigure` reinstate.
    pub pool_hint: Option<String>,
    /// Fields below are only consulted by the balloons backend (§4.5); the
    /// topology-aware backend ignores them.
    pub namespace: String,
    pub labels: std::collections::BTreeMap<String, String>,
    /// `balloon.<ns>` annotation override (§4.5.1 step 1).
    pub balloon_def_override: Option<String>,
    pub hide_hyperthreads_override: Option<bool>,
    /// Skip cgroup pinning entirely (§4.5.5).
    pub preserve: bool,
}

impl Request {
    pub fn is_exclusive(&self) -> bool {
        self.full > 0
    }

    pub fn is_shared(&self) -> bool {
        self.fraction.0 > 0
    }

    pub fn unlimited_cpu(&self) -> bool {
        self.qos == QosClass::Burstable && self.full == 0 && self.fraction == Milli::ZERO
    }
}
