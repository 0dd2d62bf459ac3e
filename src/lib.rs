//! proof-coord - master-side coordinator for parallel processing workers
//!
//! A master connects to the workers listed in a cluster file, keeps track of
//! which ones are usable, pushes files and packages to them, and runs jobs
//! across the active set while streaming progress back.
//!
//! # Architecture
//!
//! - **Coordinator**: session setup, parallelism, job submission, interrupts
//! - **Registry and monitor**: worker views and per-worker event delivery
//! - **Cache and packages**: fingerprint-checked file sync, locked builds
//! - **Worker service**: the other end of the protocol, one master at a time

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod error;
pub mod job;
pub mod package;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{ProofError, Result};
