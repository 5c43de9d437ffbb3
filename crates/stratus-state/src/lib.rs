//! stratus-state: embedded state store for Stratus.
//!
//! Backed by [redb](https://docs.rs/redb), holds the application entities,
//! the instance ledger, and node records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Ledger records use the composite key `{app_id}:{index}` so one
//! application's slots can be found with a prefix scan.
//!
//! redb admits one write transaction at a time, so every read-modify-write
//! helper on [`StateStore`] (`update_application`, `upsert_ledger_record`,
//! `upsert_node`) runs its load, change, and store under that exclusive
//! lock. Callers keep the closures short: they execute inside the critical
//! section.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
