//! stratus-scheduler: turns lifecycle changes and health signals into
//! run commands.
//!
//! # Architecture
//!
//! ```text
//! ApplicationDiff ──► DispatchObserver ──► RunBackend (start / stop / scale / routes)
//!                         │                    ▲
//!                         └─► StagingOrchestrator (bounded retry on no-capacity)
//!
//! hm.start / hm.stop / hm.adjust / hm.autoscaling.request
//!        ──► HealthSignalRespondent ──► RunBackend, StateStore, DispatchObserver
//! ```
//!
//! The collaborators (`RunBackend`, `ArtifactQueue`, `EventRecorder`) are
//! traits so tests can substitute recording doubles; the daemon wires the
//! bus-backed implementations.

pub mod backend;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod respondent;
pub mod staging;

#[cfg(test)]
mod testing;

pub use backend::{ArtifactQueue, BusArtifactQueue, BusRunBackend, RunBackend};
pub use dispatch::{DispatchDeps, DispatchObserver, Reaction, classify};
pub use error::{SchedulerError, SchedulerResult, StagingError};
pub use events::{AppEvent, AppEventKind, BusEventRecorder, EventRecorder};
pub use respondent::{AdjustOutcome, CommandOutcome, HealthSignalRespondent};
pub use staging::{StagingOrchestrator, StagingOutcome};
