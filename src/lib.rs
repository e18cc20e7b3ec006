//! Node-level CPU/memory allocation engine (§1-§9): a single-threaded,
//! event-driven core a container runtime's node agent embeds to place
//! containers onto a CPU topology and named memory zones under either of
//! two interchangeable backends (§2 balloons, topology-aware).

pub mod annotations;
pub mod config;
pub mod container;
pub mod core;
pub mod engine;
pub mod error;
pub mod policy;
mod rwgate;

pub use config::Config;
pub use container::Container;
pub use core::request::{ContainerId, CpuType, MemoryType, Milli, QosClass, Request};
pub use engine::{build_request, Engine, Event};
pub use error::{PolicyError, PolicyResult};
pub use policy::{Backend, PolicyBackend, PoolDescriptor, Stats, TopologyZones};
