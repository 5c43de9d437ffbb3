//! stratus-cluster: instance accounting for the Stratus control plane.
//!
//! # Architecture
//!
//! ```text
//! node.heartbeat ──► InstanceLedger ──► ledger table ({app_id}:{index})
//!                        │
//!                        └─ unseen node ──► NodeRegistry::identify (node.status.<id>)
//!
//! node.status.response ──► NodeRegistry ──► nodes table
//!
//! StatsSweep (every sweep_interval < ttl)
//!   └─ one node.stats.<id> query per ledger key ──► InstanceLedger::merge_stats
//! ```
//!
//! Readers call [`InstanceLedger::get_instance_states`], which maps every
//! desired index to its last-known state, reading anything older than the
//! TTL as `DOWN`.

pub mod ledger;
pub mod membership;
pub mod sweep;

pub use ledger::{InstanceLedger, InstanceSlot};
pub use membership::NodeRegistry;
pub use sweep::{StatsSweep, SweepReport};
