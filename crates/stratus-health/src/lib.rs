//! stratus-health: the control plane's side of the health-signal protocol.
//!
//! # Architecture
//!
//! ```text
//! HealthSignalClient
//!   ├── healthy_instances()       hm.health   (batched, one reply per app)
//!   ├── find_crashes()            hm.status   state = CRASHED
//!   ├── find_flapping_indices()   hm.status   state = FLAPPING
//!   ├── update_autoscaling_fields() ► hm.autoscaling.update  (fire-and-forget)
//!   └── notify_new_live_version()   ► hm.live_version        (fire-and-forget)
//! ```
//!
//! Inbound commands from the health-signal subsystem (`hm.start`,
//! `hm.stop`, ...) are handled by the respondent in `stratus-scheduler`.

pub mod client;

pub use client::HealthSignalClient;
