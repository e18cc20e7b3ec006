//! Configuration shape (§6) and validation (§7 `ConfigInvalid`).
//!
//! A `*Raw` type with every field optional, merged against defaults by
//! `Config::from_raw`. The core never touches the filesystem — loading
//! YAML/JSON into a `ConfigRaw` is the runtime adapter's job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::balloon::BalloonDef;
use crate::core::cpuset::CpuSet;
use crate::core::request::{CpuPriority, Milli};
use crate::core::topology::Level;
use crate::error::{PolicyError, PolicyResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuSpec {
    Set(CpuSet),
    Quantity(Milli),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadClass {
    pub name: String,
    pub level: Level,
    pub overloads_level_in_balloon: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigRaw {
    pub available_resources_cpu: Option<CpuSpec>,
    pub reserved_resources_cpu: Option<CpuSpec>,
    pub pin_cpu: Option<bool>,
    pub pin_memory: Option<bool>,
    pub reserved_pool_namespaces: Option<Vec<String>>,
    pub idle_cpu_class: Option<String>,
    pub default_cpu_priority: Option<CpuPriority>,
    pub unlimited_burstable: Option<Level>,
    pub allocator_topology_balancing: Option<bool>,
    pub prefer_spread_on_physical_cores: Option<bool>,
    pub balloon_defs: Option<Vec<BalloonDef>>,
    pub load_classes: Option<Vec<LoadClass>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub available_resources_cpu: CpuSpec,
    pub reserved_resources_cpu: CpuSpec,
    pub pin_cpu: bool,
    pub pin_memory: bool,
    pub reserved_pool_namespaces: Vec<String>,
    pub idle_cpu_class: String,
    pub default_cpu_priority: CpuPriority,
    pub unlimited_burstable: Level,
    pub allocator_topology_balancing: bool,
    pub prefer_spread_on_physical_cores: bool,
    pub balloon_defs: Vec<BalloonDef>,
    pub load_classes: Vec<LoadClass>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            available_resources_cpu: CpuSpec::Set(CpuSet::new()),
            reserved_resources_cpu: CpuSpec::Set(CpuSet::new()),
            pin_cpu: true,
            pin_memory: true,
            reserved_pool_namespaces: Vec::new(),
            idle_cpu_class: "normal".to_string(),
            default_cpu_priority: CpuPriority::Normal,
            unlimited_burstable: Level::Numa,
            allocator_topology_balancing: false,
            prefer_spread_on_physical_cores: true,
            balloon_defs: Vec::new(),
            load_classes: Vec::new(),
        }
    }

    pub fn from_raw(raw: ConfigRaw) -> Self {
        let default = Config::new();
        Self {
            available_resources_cpu: raw.available_resources_cpu.unwrap_or(default.available_resources_cpu),
            reserved_resources_cpu: raw.reserved_resources_cpu.unwrap_or(default.reserved_resources_cpu),
            pin_cpu: raw.pin_cpu.unwrap_or(default.pin_cpu),
            pin_memory: raw.pin_memory.unwrap_or(default.pin_memory),
            reserved_pool_namespaces: raw.reserved_pool_namespaces.unwrap_or(default.reserved_pool_namespaces),
            idle_cpu_class: raw.idle_cpu_class.unwrap_or(default.idle_cpu_class),
            default_cpu_priority: raw.default_cpu_priority.unwrap_or(default.default_cpu_priority),
            unlimited_burstable: raw.unlimited_burstable.unwrap_or(default.unlimited_burstable),
            allocator_topology_balancing: raw
                .allocator_topology_balancing
                .unwrap_or(default.allocator_topology_balancing),
            prefer_spread_on_physical_cores: raw
                .prefer_spread_on_physical_cores
                .unwrap_or(default.prefer_spread_on_physical_cores),
            balloon_defs: raw.balloon_defs.unwrap_or(default.balloon_defs),
            load_classes: raw.load_classes.unwrap_or(default.load_classes),
        }
    }

    /// Validation errors abort `Setup`/`Reconfigure` (§7).
    pub fn validate(&self, available: &CpuSet, isolated: &CpuSet) -> PolicyResult<()> {
        let reserved = match &self.reserved_resources_cpu {
            CpuSpec::Set(s) => s.clone(),
            CpuSpec::Quantity(_) => CpuSet::new(),
        };
        if let CpuSpec::Set(reserved_set) = &self.reserved_resources_cpu {
            if !reserved_set.is_subset_of(available) {
                return Err(PolicyError::ConfigInvalid(
                    "reserved CPUs are not a subset of available CPUs".into(),
                ));
            }
            if reserved_set.intersects(isolated) {
                return Err(PolicyError::ConfigInvalid(
                    "isolated CPUs must not be mixed into the reserved set".into(),
                ));
            }
        }
        let _ = reserved;

        let names: Vec<&str> = self.balloon_defs.iter().map(|d| d.name.as_str()).collect();
        let mut seen = std::collections::BTreeSet::new();
        for name in &names {
            if !seen.insert(*name) {
                return Err(PolicyError::ConfigInvalid(format!("duplicate balloon definition {}", name)));
            }
        }

        let load_names: std::collections::BTreeSet<&str> =
            self.load_classes.iter().map(|l| l.name.as_str()).collect();

        for def in &self.balloon_defs {
            if def.min_cpus > def.max_cpus {
                return Err(PolicyError::ConfigInvalid(format!(
                    "balloon {} has min_cpus > max_cpus",
                    def.name
                )));
            }
            if def.min_balloons > def.max_balloons {
                return Err(PolicyError::ConfigInvalid(format!(
                    "balloon {} has min_balloons > max_balloons",
                    def.name
                )));
            }
            if def.is_composite() {
                if def.cpu_class.is_some() || def.allocator_priority != 0 {
                    return Err(PolicyError::ConfigInvalid(format!(
                        "composite balloon {} may not set cpu_class/allocator_priority",
                        def.name
                    )));
                }
                check_no_cycle(def, &self.balloon_defs, &mut Vec::new())?;
                for comp in &def.components {
                    if !names.contains(&comp.as_str()) {
                        return Err(PolicyError::ConfigInvalid(format!(
                            "balloon {} references undefined component {}",
                            def.name, comp
                        )));
                    }
                }
            }
            for load in &def.loads {
                if !load_names.contains(load.as_str()) {
                    return Err(PolicyError::ConfigInvalid(format!(
                        "balloon {} references undefined load class {}",
                        def.name, load
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_no_cycle(def: &BalloonDef, all: &[BalloonDef], path: &mut Vec<String>) -> PolicyResult<()> {
    if path.contains(&def.name) {
        return Err(PolicyError::ConfigInvalid(format!(
            "circular balloon composition involving {}",
            def.name
        )));
    }
    path.push(def.name.clone());
    for comp_name in &def.components {
        if let Some(comp) = all.iter().find(|d| &d.name == comp_name) {
            if comp.is_composite() {
                check_no_cycle(comp, all, path)?;
            }
        }
    }
    path.pop();
    Ok(())
}

pub type Annotations = BTreeMap<String, String>;
