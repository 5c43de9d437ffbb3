//! Shared types used across Stratus crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for an application (also the droplet guid on the wire).
pub type AppId = String;

/// Unique identifier for a compute node.
pub type NodeId = String;

/// Opaque generation token distinguishing one desired-running snapshot
/// of an application from the next.
pub type Version = String;

/// What the owner of an application wants it to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    #[default]
    Stopped,
    Started,
}

/// Readiness of the application's uploaded package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    #[default]
    Pending,
    Staged,
    Failed,
}

/// How compute nodes decide an instance is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    #[default]
    Port,
    Process,
    Http,
}

/// Liveness of a single instance as last reported by a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Flapping,
    Down,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Flapping => "FLAPPING",
            InstanceState::Down => "DOWN",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time resource usage of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    /// CPU utilisation in percent of one core.
    pub cpu_percent: f64,
}

/// What the stager reported for the last successful staging attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StagingResponse {
    /// Instances the stager started itself while staging.
    pub instances_started: u32,
    /// Content hash of the produced droplet.
    pub droplet_hash: Option<String>,
    pub detected_buildpack: Option<String>,
}
