//! CPU id sets with the operations the topology tree and allocators need.

use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type CpuId = u32;

/// A set of nonnegative CPU ids, ordered, with the usual set algebra.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet(BTreeSet<CpuId>);

impl CpuSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn from_ids<I: IntoIterator<Item = CpuId>>(ids: I) -> Self {
        Self(ids.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: CpuId) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: CpuId) -> bool {
        self.0.insert(id)
    }

    pub fn remove(&mut self, id: CpuId) -> bool {
        self.0.remove(&id)
    }

    pub fn ordered(&self) -> Vec<CpuId> {
        self.0.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpuId> {
        self.0.iter()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersects(&self, other: &CpuSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    pub fn union_with(&mut self, other: &CpuSet) {
        for id in other.iter() {
            self.0.insert(*id);
        }
    }

    pub fn subtract_from(&mut self, other: &CpuSet) {
        for id in other.iter() {
            self.0.remove(id);
        }
    }

    /// Take up to `count` ids out of this set, removing them, in ascending order.
    pub fn take(&mut self, count: usize) -> CpuSet {
        let picked: Vec<CpuId> = self.0.iter().take(count).cloned().collect();
        for id in &picked {
            self.0.remove(id);
        }
        CpuSet(picked.into_iter().collect())
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        CpuSet(iter.into_iter().collect())
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = to_ranges(&self.ordered());
        write!(f, "{}", ranges.join(","))
    }
}

/// Parses the same `a-b,c,d-e` list format `Display` produces, e.g. for the
/// container-supplied device-claim CPU list (§6 "environment list").
impl FromStr for CpuSet {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = CpuSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start: CpuId = start.trim().parse().map_err(|_| ())?;
                let end: CpuId = end.trim().parse().map_err(|_| ())?;
                if start > end {
                    return Err(());
                }
                for id in start..=end {
                    out.insert(id);
                }
            } else {
                out.insert(part.parse().map_err(|_| ())?);
            }
        }
        Ok(out)
    }
}

fn to_ranges(ids: &[CpuId]) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        let mut end = start;
        while i + 1 < ids.len() && ids[i + 1] == end + 1 {
            i += 1;
            end = ids[i];
        }
        if start == end {
            out.push(format!("{}", start));
        } else {
            out.push(format!("{}-{}", start, end));
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_collapses_ranges() {
        let set = CpuSet::from_ids([0, 1, 2, 4, 6, 7]);
        assert_eq!(set.to_string(), "0-2,4,6-7");
    }

    #[test]
    fn take_removes_from_source() {
        let mut set = CpuSet::from_ids([3, 1, 2]);
        let picked = set.take(2);
        assert_eq!(picked.ordered(), vec![1, 2]);
        assert_eq!(set.ordered(), vec![3]);
    }

    #[test]
    fn union_intersection_difference() {
        let a = CpuSet::from_ids([0, 1, 2]);
        let b = CpuSet::from_ids([1, 2, 3]);
        assert_eq!(a.union(&b).ordered(), vec![0, 1, 2, 3]);
        assert_eq!(a.intersection(&b).ordered(), vec![1, 2]);
        assert_eq!(a.difference(&b).ordered(), vec![0]);
    }

    #[test]
    fn parse_round_trips_through_display() {
        let set = CpuSet::from_ids([0, 1, 2, 4, 6, 7]);
        let parsed: CpuSet = set.to_string().parse().unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("0-".parse::<CpuSet>().is_err());
        assert!("x".parse::<CpuSet>().is_err());
        assert!("3-1".parse::<CpuSet>().is_err());
    }
}
