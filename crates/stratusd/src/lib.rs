//! stratusd: the Stratus control plane daemon.
//!
//! The binary lives in `main.rs`; the wiring is a library so the
//! end-to-end scenario tests can run a whole control plane in-process.

pub mod control_plane;

pub use control_plane::{ControlPlane, SelfCheck, open_bus, run_control_plane};
