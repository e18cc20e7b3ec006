//! Property tests (§8 universal invariants) against random
//! allocate/release/update sequences on the topology-aware backend.

use std::collections::BTreeMap;

use proptest::prelude::*;

use node_resource_policy::core::cpuset::CpuSet;
use node_resource_policy::core::memory_allocator::{MemoryAllocator, MemoryNode};
use node_resource_policy::core::topology::{CpuTopologyTree, NumaFact};
use node_resource_policy::policy::topology_aware::TopologyAwareBackend;
use node_resource_policy::{Config, CpuType, Milli, PolicyBackend, QosClass, Request};

const TOTAL_CPUS: u32 = 8;

fn fresh_backend() -> TopologyAwareBackend {
    let facts = vec![NumaFact {
        socket_id: 0,
        die_id: 0,
        numa_id: 0,
        cpus: CpuSet::from_ids(0..TOTAL_CPUS),
        has_memory: true,
        distance: BTreeMap::new(),
    }];
    let tree = CpuTopologyTree::build(&facts).unwrap();
    let mut mem = MemoryAllocator::new();
    mem.add_node(MemoryNode {
        id: 0,
        mem_type: node_resource_policy::MemoryType::DRAM,
        capacity: 1_000_000,
        used: 0,
        distance: BTreeMap::new(),
        movable: false,
    });
    TopologyAwareBackend::new(tree, mem, CpuSet::new(), CpuSet::new(), Config::new())
}

#[derive(Clone, Debug)]
enum Op {
    Allocate { id: u32, full: u32, mem: u64 },
    Release { id: u32 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..6, 0u32..3, 1u64..1000).prop_map(|(id, full, mem)| Op::Allocate { id, full, mem }),
        (0u32..6).prop_map(|id| Op::Release { id }),
    ]
}

fn request_for(id: u32, full: u32, mem: u64) -> Request {
    Request {
        container_id: format!("c{}", id),
        pod_id: format!("p{}", id),
        qos: if full > 0 { QosClass::Guaranteed } else { QosClass::Burstable },
        full,
        fraction: if full > 0 { Milli::ZERO } else { Milli(250) },
        isolate: false,
        cpu_type: CpuType::Normal,
        cpu_prio: Default::default(),
        mem_req: mem,
        mem_limit: mem,
        memory_type: node_resource_policy::MemoryType::DRAM,
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

proptest! {
    /// G1 (exclusivity) and G2 (non-overcommit) hold after every step of an
    /// arbitrary allocate/release sequence; release is idempotent.
    #[test]
    fn invariants_hold_across_random_sequences(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut backend = fresh_backend();
        for op in ops {
            match op {
                Op::Allocate { id, full, mem } => {
                    let _ = backend.allocate(request_for(id, full, mem));
                }
                Op::Release { id } => {
                    let before = backend.topology_zones();
                    let _ = backend.release(&format!("c{}", id));
                    let _ = backend.release(&format!("c{}", id));
                    let after = backend.topology_zones();
                    if !backend.grants().contains(&format!("c{}", id)) {
                        prop_assert_eq!(
                            before.pools.iter().map(|p| p.free_shared_milli).collect::<Vec<_>>(),
                            after.pools.iter().map(|p| p.free_shared_milli).collect::<Vec<_>>()
                        );
                    }
                }
            }
            prop_assert!(backend.grants().check_exclusivity());
            let exclusive_total: usize = backend.grants().iter().map(|(_, g)| g.exclusive.len()).sum();
            prop_assert!(exclusive_total <= TOTAL_CPUS as usize);
        }
    }
}
