//! stratus-bus: the asynchronous transport between the control plane,
//! compute nodes, and the health-signal subsystem.
//!
//! Provides the [`Bus`] trait with an in-process implementation and a TCP
//! transport for remote peers, the subject names, the JSON wire messages,
//! and subscriber loops that keep running when a single message fails.

pub mod bus;
pub mod error;
pub mod handler;
pub mod messages;
pub mod server;
pub mod subjects;
pub mod tcp;
pub mod wire;

pub use bus::{Bus, Envelope, InMemoryBus, RequestOptions, Subscription};
pub use error::{BusError, BusResult, MalformedMessage};
pub use handler::{Handler, boxed_handler, spawn_handler};
pub use messages::*;
pub use server::BusServer;
pub use tcp::TcpBus;
