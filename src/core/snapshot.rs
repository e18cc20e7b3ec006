//! Opaque snapshot written back to the cache between events (§1 Non-goals:
//! "no persistence beyond a single opaque snapshot"), and restored on
//! `Start` / after a failed `Reconfigure`.

use serde::{Deserialize, Serialize};

use crate::core::balloon::Balloon;
use crate::core::grant::GrantTable;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub grants: GrantTable,
    pub balloons: Option<Vec<Balloon>>,
}

impl Snapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cpuset::CpuSet;
    use crate::core::grant::Grant;
    use crate::core::request::{Milli, MemoryType};

    #[test]
    fn round_trips_through_json() {
        let mut grants = GrantTable::new();
        grants.insert(Grant {
            container_id: "c1".into(),
            node: 0,
            pool_name: "default[0]".into(),
            exclusive: CpuSet::from_ids([0, 1]),
            isolated_portion: CpuSet::new(),
            cpu_portion: Milli(0),
            from_reserved: false,
            memory_zone: vec![0],
            memory_size: 1024,
            memory_type: MemoryType::DRAM,
            cold_start: None,
            scheduling: Default::default(),
            prior_pool_hint: None,
        });
        let snap = Snapshot { grants, balloons: None };
        let json = snap.to_json().unwrap();
        let restored = Snapshot::from_json(&json).unwrap();
        assert_eq!(restored.grants.len(), 1);
        assert_eq!(restored.grants.get("c1").unwrap().exclusive.ordered(), vec![0, 1]);
    }
}
