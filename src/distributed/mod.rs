//! Wire protocol and per-worker transport
//!
//! - `protocol`: frames, messages and version negotiation
//! - `connection`: one worker stream, with an urgent path ahead of normal traffic
//! - `monitor`: fans worker events into the coordinator, per ordinal
//! - `worker_service`: the worker side of the protocol

pub mod connection;
pub mod monitor;
pub mod protocol;
pub mod worker_service;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connection, UrgentSender};
pub use monitor::Monitor;
pub use protocol::{Message, PROTOCOL_VERSION};
pub use worker_service::{WorkerOptions, WorkerService};
