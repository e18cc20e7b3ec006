//! Typed error kinds, per the propagation policy of §7: validation errors
//! abort `Setup`/`Reconfigure`, placement errors propagate to the caller,
//! internal allocator errors are logged and returned with partial effects
//! undone, cold-start misuse is rejected at request-build time.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no suitable pool for request: {0}")]
    NoSuitablePool(String),

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("unknown balloon definition: {0}")]
    UnknownBalloon(String),

    #[error("maximum balloon instance count reached for definition {0}")]
    MaxBalloonsReached(String),

    #[error("allocator internal error: {0}")]
    AllocatorInternal(String),

    #[error("cold start requested on a platform with movable non-DRAM memory")]
    ColdStartMisuse,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl PolicyError {
    /// Stable name for the `Stats` error counters, one bucket per variant.
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyError::ConfigInvalid(_) => "config_invalid",
            PolicyError::NoSuitablePool(_) => "no_suitable_pool",
            PolicyError::InsufficientCapacity(_) => "insufficient_capacity",
            PolicyError::UnknownBalloon(_) => "unknown_balloon",
            PolicyError::MaxBalloonsReached(_) => "max_balloons_reached",
            PolicyError::AllocatorInternal(_) => "allocator_internal",
            PolicyError::ColdStartMisuse => "cold_start_misuse",
            PolicyError::UnsupportedOperation(_) => "unsupported_operation",
        }
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;
