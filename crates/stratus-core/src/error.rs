//! Error types for lifecycle mutations and configuration.

use std::fmt;

use thiserror::Error;

use crate::config::BusTransport;
use crate::types::PackageState;

/// Result type alias for lifecycle state machine operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Names the bound a rejected mutation tripped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    MinInstances,
    MaxInstances,
    MinCpuThreshold,
    MaxCpuThreshold,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Bound::MinInstances => "min_instances",
            Bound::MaxInstances => "max_instances",
            Bound::MinCpuThreshold => "min_cpu_threshold",
            Bound::MaxCpuThreshold => "max_cpu_threshold",
        })
    }
}

/// Errors raised synchronously by the application state machine.
///
/// A mutation that returns one of these leaves the application untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("{bound} must be at least 1")]
    BoundBelowOne { bound: Bound },

    #[error("{bound} violates min_instances ({min}) <= max_instances ({max})")]
    InvertedInstanceBounds { bound: Bound, min: u32, max: u32 },

    #[error("{bound} must be within 0..=100, got {value}")]
    CpuThresholdOutOfRange { bound: Bound, value: u32 },

    #[error("{bound} violates min_cpu_threshold ({min}) <= max_cpu_threshold ({max})")]
    InvertedCpuThresholds { bound: Bound, min: u32, max: u32 },

    #[error("package state cannot move from {from:?} to {to:?}")]
    InvalidPackageTransition { from: PackageState, to: PackageState },
}

impl LifecycleError {
    /// The bound this error identifies, if it is a bound violation.
    pub fn bound(&self) -> Option<Bound> {
        match self {
            LifecycleError::BoundBelowOne { bound }
            | LifecycleError::InvertedInstanceBounds { bound, .. }
            | LifecycleError::CpuThresholdOutOfRange { bound, .. }
            | LifecycleError::InvertedCpuThresholds { bound, .. } => Some(*bound),
            LifecycleError::InvalidPackageTransition { .. } => None,
        }
    }
}

/// Startup-time configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(
        "ledger sweep interval ({sweep_secs}s) must be shorter than the ledger ttl ({ttl_secs}s)"
    )]
    SweepNotShorterThanTtl { sweep_secs: u64, ttl_secs: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("daemon.bus = {0:?} needs a daemon.bus_addr")]
    MissingBusAddress(BusTransport),
}
