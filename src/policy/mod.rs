//! The two interchangeable backends (§2) behind one shared shape.
//!
//! Backend selection is a closed tagged sum per the §9 design note, not
//! open inheritance: `Backend` wraps exactly one of the two and dispatches
//! through the `PolicyBackend` trait both implement.

pub mod balloons;
pub mod comparator;
pub mod topology_aware;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::container::PinningDecision;
use crate::core::cpuset::CpuSet;
use crate::core::grant::{Grant, GrantTable};
use crate::core::request::{ContainerId, Request};
use crate::core::snapshot::Snapshot;
use crate::error::{PolicyError, PolicyResult};

#[derive(Clone, Debug)]
pub struct PoolDescriptor {
    pub id: usize,
    pub name: String,
    pub depth: u32,
    pub cpus: usize,
    pub free_shared_milli: i64,
    pub free_isolated: usize,
    pub free_reserved: usize,
    pub memory_capacity: u64,
    pub memory_free: u64,
}

#[derive(Clone, Debug, Default)]
pub struct TopologyZones {
    pub pools: Vec<PoolDescriptor>,
}

/// In-memory health snapshot alongside `GetTopologyZones`: grant count and
/// per-kind error counters, not metrics export.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub grant_count: usize,
    pub errors_by_kind: BTreeMap<&'static str, u64>,
}

/// Shared operation trait both backends implement (§6 Backend API).
pub trait PolicyBackend {
    fn allocate(&mut self, req: Request) -> PolicyResult<Grant>;
    fn release(&mut self, container_id: &str) -> PolicyResult<()>;
    fn update(&mut self, container_id: &str, req: Request) -> PolicyResult<Grant>;
    fn grants(&self) -> &GrantTable;
    fn topology_zones(&self) -> TopologyZones;
    fn export_resource_data(&self, container_id: &str) -> BTreeMap<String, String>;
    fn snapshot(&self) -> Snapshot;
    fn restore(&mut self, snap: Snapshot) -> PolicyResult<()>;
    fn pending_cold_starts(&self) -> Vec<(ContainerId, Duration)>;
    fn cold_start_done(&mut self, container_id: &str) -> PolicyResult<()>;
    /// Container ids (besides the one just allocated/released/claimed) whose
    /// effective cpuset changed as a side effect and need a fresh pinning
    /// decision applied by the caller (§4.4 step 3, §4.5.3 shared-idle update).
    fn drain_pending_repins(&mut self) -> Vec<ContainerId>;
    fn pinning_decision(&self, container_id: &str) -> Option<PinningDecision>;

    /// Device co-allocation claim (§4.4.2). Topology-aware only; balloons
    /// has no concept of pinned device CPUs, so the default rejects it.
    /// On success, returns the ids of any containers whose shared grant was
    /// evicted outright (step 3) to make room for the claim — the caller
    /// must tell the runtime adapter those containers lost their grant.
    fn allocate_claim(&mut self, _container_id: &str, _cpus: &CpuSet) -> PolicyResult<Vec<ContainerId>> {
        Err(PolicyError::UnsupportedOperation(
            "device co-allocation claims require the topology-aware backend".into(),
        ))
    }

    fn release_claim(&mut self, _cpus: &CpuSet) {}
}

pub enum Backend {
    Balloons(Box<balloons::BalloonsBackend>),
    TopologyAware(Box<topology_aware::TopologyAwareBackend>),
}

impl PolicyBackend for Backend {
    fn allocate(&mut self, req: Request) -> PolicyResult<Grant> {
        match self {
            Backend::Balloons(b) => b.allocate(req),
            Backend::TopologyAware(b) => b.allocate(req),
        }
    }

    fn release(&mut self, container_id: &str) -> PolicyResult<()> {
        match self {
            Backend::Balloons(b) => b.release(container_id),
            Backend::TopologyAware(b) => b.release(container_id),
        }
    }

    fn update(&mut self, container_id: &str, req: Request) -> PolicyResult<Grant> {
        match self {
            Backend::Balloons(b) => b.update(container_id, req),
            Backend::TopologyAware(b) => b.update(container_id, req),
        }
    }

    fn grants(&self) -> &GrantTable {
        match self {
            Backend::Balloons(b) => b.grants(),
            Backend::TopologyAware(b) => b.grants(),
        }
    }

    fn topology_zones(&self) -> TopologyZones {
        match self {
            Backend::Balloons(b) => b.topology_zones(),
            Backend::TopologyAware(b) => b.topology_zones(),
        }
    }

    fn export_resource_data(&self, container_id: &str) -> BTreeMap<String, String> {
        match self {
            Backend::Balloons(b) => b.export_resource_data(container_id),
            Backend::TopologyAware(b) => b.export_resource_data(container_id),
        }
    }

    fn snapshot(&self) -> Snapshot {
        match self {
            Backend::Balloons(b) => b.snapshot(),
            Backend::TopologyAware(b) => b.snapshot(),
        }
    }

    fn restore(&mut self, snap: Snapshot) -> PolicyResult<()> {
        match self {
            Backend::Balloons(b) => b.restore(snap),
            Backend::TopologyAware(b) => b.restore(snap),
        }
    }

    fn pending_cold_starts(&self) -> Vec<(ContainerId, Duration)> {
        match self {
            Backend::Balloons(b) => b.pending_cold_starts(),
            Backend::TopologyAware(b) => b.pending_cold_starts(),
        }
    }

    fn cold_start_done(&mut self, container_id: &str) -> PolicyResult<()> {
        match self {
            Backend::Balloons(b) => b.cold_start_done(container_id),
            Backend::TopologyAware(b) => b.cold_start_done(container_id),
        }
    }

    fn drain_pending_repins(&mut self) -> Vec<ContainerId> {
        match self {
            Backend::Balloons(b) => b.drain_pending_repins(),
            Backend::TopologyAware(b) => b.drain_pending_repins(),
        }
    }

    fn pinning_decision(&self, container_id: &str) -> Option<PinningDecision> {
        match self {
            Backend::Balloons(b) => b.pinning_decision(container_id),
            Backend::TopologyAware(b) => b.pinning_decision(container_id),
        }
    }

    fn allocate_claim(&mut self, container_id: &str, cpus: &CpuSet) -> PolicyResult<Vec<ContainerId>> {
        match self {
            Backend::Balloons(b) => b.allocate_claim(container_id, cpus),
            Backend::TopologyAware(b) => b.allocate_claim(container_id, cpus),
        }
    }

    fn release_claim(&mut self, cpus: &CpuSet) {
        match self {
            Backend::Balloons(b) => b.release_claim(cpus),
            Backend::TopologyAware(b) => b.release_claim(cpus),
        }
    }
}
