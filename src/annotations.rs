//! Recognized annotations (§6) and their parsing into request overrides.

use std::time::Duration;

use crate::container::Container;
use crate::core::request::{CpuPriority, MemoryType};

pub const BALLOON_KEY: &str = "balloon";
pub const HIDE_HYPERTHREADS_KEY: &str = "hide-hyperthreads";
pub const PREFER_ISOLATED_CPUS_KEY: &str = "prefer-isolated-cpus";
pub const PREFER_SHARED_CPUS_KEY: &str = "prefer-shared-cpus";
pub const MEMORY_TYPE_KEY: &str = "memory-type";
pub const COLD_START_KEY: &str = "cold-start";
pub const PREFER_RESERVED_CPUS_KEY: &str = "prefer-reserved-cpus";
pub const PREFER_CPU_PRIORITY_KEY: &str = "prefer-cpu-priority";
pub const PICK_BY_HINTS_KEY: &str = "pick-resources-by-hints";

fn namespaced(ns: &str, key: &str) -> String {
    format!("{}.{}", key, ns)
}

#[derive(Clone, Debug, Default)]
pub struct AnnotationOverrides {
    pub balloon_def: Option<String>,
    pub hide_hyperthreads: Option<bool>,
    pub prefer_isolated_cpus: Option<bool>,
    pub prefer_shared_cpus: Option<bool>,
    pub memory_type: Option<MemoryType>,
    pub cold_start: Option<Duration>,
    pub prefer_reserved_cpus: Option<bool>,
    pub prefer_cpu_priority: Option<CpuPriority>,
    pub pick_by_hints: Option<bool>,
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "True" | "1" => Some(true),
        "false" | "False" | "0" => Some(false),
        _ => None,
    }
}

fn parse_memory_type(s: &str) -> MemoryType {
    let mut t = MemoryType::empty();
    for part in s.split(',') {
        match part.trim() {
            "dram" => t |= MemoryType::DRAM,
            "pmem" => t |= MemoryType::PMEM,
            "hbm" => t |= MemoryType::HBM,
            "mixed" => t |= MemoryType::DRAM | MemoryType::PMEM,
            _ => {}
        }
    }
    if t.is_empty() {
        MemoryType::DRAM
    } else {
        t
    }
}

fn parse_cold_start(s: &str) -> Option<Duration> {
    // accepts "{ duration: <go-style-duration> }" or a bare duration string.
    let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
    let value = trimmed.split(':').nth(1).unwrap_or(trimmed).trim();
    parse_duration(value)
}

/// Parses a small subset of Go-style duration strings (ms/s/m/h), enough
/// for the `cold-start` annotation's `{ duration: ... }` value.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = s.split_at(split_at);
    let value: f64 = num.parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };
    Some(Duration::from_millis(millis as u64))
}

fn parse_priority(s: &str) -> CpuPriority {
    match s {
        "high" => CpuPriority::High,
        "low" => CpuPriority::Low,
        "normal" => CpuPriority::Normal,
        _ => CpuPriority::None,
    }
}

/// Resolves every recognized annotation for a container under namespace
/// `ns`, honoring the container-over-pod resolution order via
/// `Container::effective_annotation`.
pub fn resolve(container: &dyn Container, ns: &str) -> AnnotationOverrides {
    let mut out = AnnotationOverrides::default();
    out.balloon_def = container.effective_annotation(&namespaced(ns, BALLOON_KEY));
    out.hide_hyperthreads = container
        .effective_annotation(&namespaced(ns, HIDE_HYPERTHREADS_KEY))
        .and_then(|v| parse_bool(&v));
    out.prefer_isolated_cpus = container
        .effective_annotation(&namespaced(ns, PREFER_ISOLATED_CPUS_KEY))
        .and_then(|v| parse_bool(&v));
    out.prefer_shared_cpus = container
        .effective_annotation(&namespaced(ns, PREFER_SHARED_CPUS_KEY))
        .and_then(|v| parse_bool(&v));
    out.memory_type = container
        .effective_annotation(&namespaced(ns, MEMORY_TYPE_KEY))
        .map(|v| parse_memory_type(&v));
    out.cold_start = container
        .effective_annotation(&namespaced(ns, COLD_START_KEY))
        .and_then(|v| parse_cold_start(&v))
        .filter(|d| *d <= Duration::from_secs(3600));
    out.prefer_reserved_cpus = container
        .effective_annotation(&namespaced(ns, PREFER_RESERVED_CPUS_KEY))
        .and_then(|v| parse_bool(&v));
    out.prefer_cpu_priority = container
        .effective_annotation(&namespaced(ns, PREFER_CPU_PRIORITY_KEY))
        .map(|v| parse_priority(&v));
    out.pick_by_hints = container
        .effective_annotation(&namespaced(ns, PICK_BY_HINTS_KEY))
        .and_then(|v| parse_bool(&v));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parses_common_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2s"), Some(Duration::from_millis(2000)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn cold_start_annotation_strips_braces() {
        assert_eq!(parse_cold_start("{ duration: 500ms }"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn memory_type_parses_comma_list() {
        let t = parse_memory_type("dram,pmem");
        assert!(t.contains(MemoryType::DRAM));
        assert!(t.contains(MemoryType::PMEM));
    }
}
