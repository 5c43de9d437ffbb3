//! stratus-core: shared domain model for the Stratus control plane.
//!
//! Holds the [`Application`] entity together with every transition and
//! validation rule that governs it, the wire-level enums shared by the
//! other crates, the daemon configuration, and a substitutable clock.

pub mod application;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use application::{Application, ApplicationDiff, ApplicationUpdate, AutoscalingBounds};
pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::{
    AutoscaleConfig, BusTransport, ControlPlaneConfig, DaemonConfig, HealthClientConfig,
    LedgerConfig, StagingConfig,
};
pub use error::{Bound, ConfigError, LifecycleError, LifecycleResult};
pub use types::*;
