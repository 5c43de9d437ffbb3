//! stratus-autoscale: CPU-driven scale-up.
//!
//! # Scaling Algorithm
//!
//! ```text
//! threshold = app.max_cpu_threshold (default 80)
//!
//! if autoscaling enabled and app started and cpu > threshold
//!    and the app's cooldown window has passed:
//!     desired = max(ceil(instances * cpu / threshold), instances + 1)
//!     ScaleTo(min(desired, max_instances))
//! ```
//!
//! The new count goes through the row-locked store update, so the
//! application's own bounds still clamp it, and the resulting change is
//! handed to the dispatch observer like any other mutation.

pub mod policy;
pub mod trigger;

pub use policy::{DEFAULT_MAX_CPU_THRESHOLD, ScaleDecision, ScalePolicy};
pub use trigger::AutoscaleTrigger;
