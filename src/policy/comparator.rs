//! Pool comparator (§4.4.1): orders candidate pools for a request. Ties are
//! broken in the declared rule order; the first non-tie decides.

use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestFlags {
    pub burstable: bool,
    pub unlimited_cpu: bool,
    pub mem_type_preference_set: bool,
    pub cpu_prio_preference_set: bool,
    pub reserved_request: bool,
    pub isolated_request: bool,
    pub exclusive_request: bool,
    pub shared_request: bool,
}

#[derive(Clone, Debug)]
pub struct PoolScore {
    pub pool_id: usize,
    pub depth: u32,
    pub feasible: bool,
    pub affinity: i64,
    pub hint_score: f64,
    pub nonzero_hints: u32,
    pub mem_offer_ok: bool,
    pub mem_exact_type: bool,
    pub mem_fits_limit: bool,
    pub mem_zone_size: usize,
    pub at_unlimited_burstable_level: bool,
    pub burstable_capacity: i64,
    pub has_preferred_mem_type: bool,
    pub prio_capacity_nonneg: bool,
    pub reserved_per_colocated: f64,
    pub isolated_capacity: i64,
    pub sliceable_shared_capacity: i64,
    pub colocated_containers: i64,
    pub shared_capacity: i64,
}

/// Returns `Ordering::Greater` when `a` should be preferred over `b`.
pub fn compare(a: &PoolScore, b: &PoolScore, req: RequestFlags) -> Ordering {
    // 1. feasibility
    if a.feasible != b.feasible {
        return bool_order(a.feasible, b.feasible);
    }
    if !a.feasible {
        return Ordering::Equal;
    }

    // 2. affinity score
    if a.affinity != b.affinity {
        return a.affinity.cmp(&b.affinity);
    }

    // 3. topology-hint score
    if a.hint_score != b.hint_score {
        return a.hint_score.partial_cmp(&b.hint_score).unwrap_or(Ordering::Equal);
    }
    if a.hint_score == 0.0 && b.hint_score == 0.0 {
        if a.nonzero_hints != b.nonzero_hints {
            return a.nonzero_hints.cmp(&b.nonzero_hints);
        }
        if a.nonzero_hints != 0 || b.nonzero_hints != 0 {
            // still tied on nonzero hint count: deeper pool, then smaller id
            return deeper_then_smaller_id(a, b);
        }
    }

    // 4. memory offer
    if a.mem_offer_ok != b.mem_offer_ok {
        return bool_order(a.mem_offer_ok, b.mem_offer_ok);
    }
    if a.mem_offer_ok {
        if a.mem_exact_type != b.mem_exact_type {
            return bool_order(a.mem_exact_type, b.mem_exact_type);
        }
        if req.burstable && a.mem_fits_limit != b.mem_fits_limit {
            return bool_order(a.mem_fits_limit, b.mem_fits_limit);
        }
        if a.mem_zone_size != b.mem_zone_size {
            // tighter (smaller) zone wins
            return b.mem_zone_size.cmp(&a.mem_zone_size);
        }
    }

    // 5. unlimited-burstable level
    if req.burstable && req.unlimited_cpu {
        if a.at_unlimited_burstable_level != b.at_unlimited_burstable_level {
            return bool_order(a.at_unlimited_burstable_level, b.at_unlimited_burstable_level);
        }
        if a.at_unlimited_burstable_level && a.burstable_capacity != b.burstable_capacity {
            return a.burstable_capacity.cmp(&b.burstable_capacity);
        }
    }

    // 6. typed memory preference
    if req.mem_type_preference_set && a.has_preferred_mem_type != b.has_preferred_mem_type {
        return bool_order(a.has_preferred_mem_type, b.has_preferred_mem_type);
    }

    // 7. cpu priority preference
    if req.cpu_prio_preference_set && a.prio_capacity_nonneg != b.prio_capacity_nonneg {
        return bool_order(a.prio_capacity_nonneg, b.prio_capacity_nonneg);
    }

    // 8. depth (deeper wins)
    if a.depth != b.depth {
        return a.depth.cmp(&b.depth);
    }

    // 9. reserved requests
    if req.reserved_request && a.reserved_per_colocated != b.reserved_per_colocated {
        return a.reserved_per_colocated.partial_cmp(&b.reserved_per_colocated).unwrap_or(Ordering::Equal);
    }

    // 10. isolated requests
    if req.isolated_request && a.isolated_capacity != b.isolated_capacity {
        return a.isolated_capacity.cmp(&b.isolated_capacity);
    }

    // 11. exclusive requests
    if req.exclusive_request && a.sliceable_shared_capacity != b.sliceable_shared_capacity {
        return a.sliceable_shared_capacity.cmp(&b.sliceable_shared_capacity);
    }

    // 12. shared requests
    if req.shared_request {
        if a.colocated_containers != b.colocated_containers {
            // fewer colocated wins
            return b.colocated_containers.cmp(&a.colocated_containers);
        }
        if a.shared_capacity != b.shared_capacity {
            return a.shared_capacity.cmp(&b.shared_capacity);
        }
    }

    // 13. lower pool id wins
    b.pool_id.cmp(&a.pool_id)
}

fn bool_order(a: bool, b: bool) -> Ordering {
    // true beats false
    a.cmp(&b)
}

fn deeper_then_smaller_id(a: &PoolScore, b: &PoolScore) -> Ordering {
    if a.depth != b.depth {
        return b.depth.cmp(&a.depth);
    }
    b.pool_id.cmp(&a.pool_id)
}

pub fn best_pool(scores: &[PoolScore], req: RequestFlags) -> Option<usize> {
    scores
        .iter()
        .filter(|s| s.feasible)
        .max_by(|a, b| compare(a, b, req))
        .map(|s| s.pool_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(pool_id: usize, depth: u32) -> PoolScore {
        PoolScore {
            pool_id,
            depth,
            feasible: true,
            affinity: 0,
            hint_score: 0.0,
            nonzero_hints: 0,
            mem_offer_ok: true,
            mem_exact_type: true,
            mem_fits_limit: true,
            mem_zone_size: 1,
            at_unlimited_burstable_level: false,
            burstable_capacity: 0,
            has_preferred_mem_type: true,
            prio_capacity_nonneg: true,
            reserved_per_colocated: 0.0,
            isolated_capacity: 0,
            sliceable_shared_capacity: 0,
            colocated_containers: 0,
            shared_capacity: 0,
        }
    }

    #[test]
    fn infeasible_always_loses() {
        let mut a = base(0, 1);
        a.feasible = false;
        let b = base(1, 1);
        assert_eq!(best_pool(&[a, b], RequestFlags::default()), Some(1));
    }

    #[test]
    fn higher_affinity_wins() {
        let mut a = base(0, 1);
        a.affinity = 5;
        let b = base(1, 1);
        assert_eq!(best_pool(&[a, b], RequestFlags::default()), Some(0));
    }

    #[test]
    fn deeper_pool_wins_when_otherwise_tied() {
        let a = base(0, 1);
        let b = base(1, 2);
        assert_eq!(best_pool(&[a, b], RequestFlags::default()), Some(1));
    }

    #[test]
    fn lower_pool_id_wins_final_tiebreak() {
        let a = base(5, 1);
        let b = base(2, 1);
        assert_eq!(best_pool(&[a, b], RequestFlags::default()), Some(2));
    }
}
