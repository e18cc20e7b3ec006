//! Memory allocator (§4.3): per-NUMA zones by type, reservations per
//! container id, speculative offers committed atomically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::request::{ContainerId, MemoryType};
use crate::error::{PolicyError, PolicyResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: u32,
    pub mem_type: MemoryType,
    pub capacity: u64,
    pub used: u64,
    /// Distance to every other memory node, ascending = closer; used by the
    /// zone-widening policy to pick the next-closest node of an allowed type.
    pub distance: BTreeMap<u32, u32>,
    /// True on platforms where this zone can be hot-unplugged/moved; disables
    /// cold start globally when any such non-DRAM zone is present.
    pub movable: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reservation {
    pub zone: Vec<u32>,
    pub size: u64,
    pub types: MemoryType,
}

/// A speculative reservation quote: must be committed or discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offer {
    pub zone: Vec<u32>,
    pub satisfied: bool,
    pub quoted: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryAllocator {
    nodes: BTreeMap<u32, MemoryNode>,
    reservations: BTreeMap<ContainerId, Reservation>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self { nodes: BTreeMap::new(), reservations: BTreeMap::new() }
    }

    pub fn add_node(&mut self, node: MemoryNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn has_movable_non_dram(&self) -> bool {
        self.nodes.values().any(|n| n.movable && n.mem_type != MemoryType::DRAM)
    }

    fn nodes_of_type(&self, types: MemoryType) -> Vec<u32> {
        self.nodes
            .values()
            .filter(|n| types.contains(n.mem_type) || types.is_empty())
            .map(|n| n.id)
            .collect()
    }

    fn free(&self, id: u32) -> u64 {
        self.nodes.get(&id).map(|n| n.capacity.saturating_sub(n.used)).unwrap_or(0)
    }

    /// Pure: quotes how much of `size` would be satisfied starting from
    /// `nodes`, widening within `types` only if needed to meet `size`.
    pub fn offer(&self, _container_id: &str, size: u64, nodes: &[u32], types: MemoryType) -> Offer {
        let mut zone: Vec<u32> = nodes.to_vec();
        let mut total: u64 = zone.iter().map(|n| self.free(*n)).sum();

        if total < size {
            let mut candidates: Vec<u32> = self
                .nodes_of_type(types)
                .into_iter()
                .filter(|n| !zone.contains(n))
                .collect();
            candidates.sort_by_key(|n| self.min_distance(&zone, *n));
            for cand in candidates {
                if total >= size {
                    break;
                }
                zone.push(cand);
                total += self.free(cand);
            }
        }
        Offer {
            satisfied: total >= size,
            quoted: total.min(size),
            zone,
        }
    }

    fn min_distance(&self, zone: &[u32], candidate: u32) -> u32 {
        if zone.is_empty() {
            return 0;
        }
        zone.iter()
            .filter_map(|z| self.nodes.get(z).and_then(|n| n.distance.get(&candidate)))
            .min()
            .cloned()
            .unwrap_or(u32::MAX)
    }

    /// Atomically reserves the offer. Fails (G3/G5) if the zone cannot
    /// actually fit the size at commit time (state may have moved between
    /// `offer` and `commit` only if the caller broke the critical section).
    pub fn commit(&mut self, container_id: &str, offer: &Offer, size: u64, types: MemoryType) -> PolicyResult<Vec<u32>> {
        if !offer.satisfied {
            return Err(PolicyError::InsufficientCapacity(format!(
                "memory offer for {} could not satisfy {} bytes",
                container_id, size
            )));
        }
        let total: u64 = offer.zone.iter().map(|n| self.free(*n)).sum();
        if total < size {
            return Err(PolicyError::InsufficientCapacity(format!(
                "zone capacity changed since offer for {}",
                container_id
            )));
        }
        self.debit(&offer.zone, size);
        self.reservations.insert(
            container_id.to_string(),
            Reservation { zone: offer.zone.clone(), size, types },
        );
        Ok(offer.zone.clone())
    }

    fn debit(&mut self, zone: &[u32], mut size: u64) {
        // spread proportional to free space, simplest fair split.
        let total_free: u64 = zone.iter().map(|n| self.free(*n)).sum();
        if total_free == 0 {
            return;
        }
        for &n in zone {
            let share = ((self.free(n) as u128 * size as u128) / total_free as u128) as u64;
            let take = share.min(self.free(n));
            if let Some(node) = self.nodes.get_mut(&n) {
                node.used += take;
            }
            size = size.saturating_sub(take);
        }
        if size > 0 {
            if let Some(&last) = zone.last() {
                if let Some(node) = self.nodes.get_mut(&last) {
                    let extra = size.min(node.capacity.saturating_sub(node.used));
                    node.used += extra;
                }
            }
        }
    }

    fn credit(&mut self, zone: &[u32], reservation_size: u64) {
        // release proportionally to what each node currently holds for
        // this reservation isn't tracked per-node, so release evenly.
        if zone.is_empty() {
            return;
        }
        let mut remaining = reservation_size;
        let per = reservation_size / zone.len() as u64;
        for (i, &n) in zone.iter().enumerate() {
            let amount = if i + 1 == zone.len() { remaining } else { per };
            if let Some(node) = self.nodes.get_mut(&n) {
                node.used = node.used.saturating_sub(amount);
            }
            remaining = remaining.saturating_sub(amount);
        }
    }

    pub fn release(&mut self, container_id: &str) {
        if let Some(r) = self.reservations.remove(container_id) {
            self.credit(&r.zone, r.size);
        }
    }

    pub fn assigned_zone(&self, container_id: &str) -> Option<Vec<u32>> {
        self.reservations.get(container_id).map(|r| r.zone.clone())
    }

    /// Shrinks or widens an existing reservation to a new node/type mask.
    pub fn realloc(&mut self, container_id: &str, nodes: &[u32], types: MemoryType) -> PolicyResult<Vec<u32>> {
        let size = self
            .reservations
            .get(container_id)
            .map(|r| r.size)
            .ok_or_else(|| PolicyError::AllocatorInternal(format!("no reservation for {}", container_id)))?;
        self.release(container_id);
        let offer = self.offer(container_id, size, nodes, types);
        match self.commit(container_id, &offer, size, types) {
            Ok(zone) => Ok(zone),
            Err(e) => {
                // restore previous reservation best-effort via a fresh offer
                // on the original node set so we never leave the container
                // without any reservation.
                let fallback = self.offer(container_id, size, nodes, types);
                let _ = self.commit(container_id, &fallback, size, types);
                Err(e)
            }
        }
    }

    pub fn zone_capacity(&self, mask: &[u32]) -> u64 {
        mask.iter().filter_map(|n| self.nodes.get(n)).map(|n| n.capacity).sum()
    }

    pub fn zone_usage(&self, mask: &[u32]) -> u64 {
        mask.iter().filter_map(|n| self.nodes.get(n)).map(|n| n.used).sum()
    }

    pub fn zone_free(&self, mask: &[u32]) -> u64 {
        self.zone_capacity(mask).saturating_sub(self.zone_usage(mask))
    }

    pub fn zone_type(&self, mask: &[u32]) -> MemoryType {
        let mut t = MemoryType::empty();
        for n in mask {
            if let Some(node) = self.nodes.get(n) {
                t |= node.mem_type;
            }
        }
        t
    }

    pub fn nodes_present(&self) -> Vec<u32> {
        self.nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_with_two_nodes() -> MemoryAllocator {
        let mut a = MemoryAllocator::new();
        a.add_node(MemoryNode {
            id: 0,
            mem_type: MemoryType::DRAM,
            capacity: 1000,
            used: 0,
            distance: BTreeMap::from([(1, 10)]),
            movable: false,
        });
        a.add_node(MemoryNode {
            id: 1,
            mem_type: MemoryType::PMEM,
            capacity: 1000,
            used: 0,
            distance: BTreeMap::from([(0, 10)]),
            movable: false,
        });
        a
    }

    #[test]
    fn offer_widens_within_allowed_types_only() {
        let a = alloc_with_two_nodes();
        let offer = a.offer("c1", 1500, &[0], MemoryType::DRAM);
        // widening restricted to DRAM, node 1 is PMEM and must not be added
        assert!(!offer.satisfied);
        assert_eq!(offer.zone, vec![0]);
    }

    #[test]
    fn offer_widens_to_closest_allowed_node() {
        let a = alloc_with_two_nodes();
        let offer = a.offer("c1", 1500, &[0], MemoryType::DRAM | MemoryType::PMEM);
        assert!(offer.satisfied);
        assert!(offer.zone.contains(&1));
    }

    #[test]
    fn commit_then_release_round_trips_usage() {
        let mut a = alloc_with_two_nodes();
        let offer = a.offer("c1", 500, &[0], MemoryType::DRAM);
        let zone = a.commit("c1", &offer, 500, MemoryType::DRAM).unwrap();
        assert_eq!(a.zone_usage(&zone), 500);
        a.release("c1");
        assert_eq!(a.zone_usage(&zone), 0);
    }
}
