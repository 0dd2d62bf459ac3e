//! Session state
//!
//! Process-wide state bounded by the coordinator's lifetime. Aggregate
//! counters are only written by the collector, from STATS replies.

use crate::distributed::protocol::{WorkerStats, PROTOCOL_VERSION};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Whether this process drives workers directly or talks to a remote master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Client,
}

/// Aggregate resource counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counters {
    bytes_read: u64,
    real_time: f64,
    cpu_time: f64,
}

impl Counters {
    pub(crate) fn record(&mut self, stats: &WorkerStats) {
        self.bytes_read += stats.bytes_read;
        self.real_time += f64::from(stats.real_time);
        self.cpu_time += f64::from(stats.cpu_time);
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn real_time(&self) -> f64 {
        self.real_time
    }

    pub fn cpu_time(&self) -> f64 {
        self.cpu_time
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub master: String,
    pub user: String,
    pub port: u16,
    pub conf_file: String,
    pub conf_dir: PathBuf,
    pub work_dir: PathBuf,

    /// Negotiated protocol version (min over all workers)
    pub protocol: u32,

    /// Log level forwarded to workers
    pub log_level: i32,
    pub log_mask: u32,

    pub valid: bool,
    pub role: Role,

    /// Status of the last completed request (0 on success)
    pub status: i32,

    pub counters: Counters,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(master: impl Into<String>, role: Role) -> Self {
        Self {
            master: master.into(),
            user: current_user(),
            port: crate::distributed::protocol::DEFAULT_PORT,
            conf_file: String::new(),
            conf_dir: PathBuf::new(),
            work_dir: PathBuf::new(),
            protocol: PROTOCOL_VERSION,
            log_level: 0,
            log_mask: u32::MAX,
            valid: false,
            role,
            status: 0,
            counters: Counters::default(),
            started_at: Utc::now(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Lower the session protocol to a newly negotiated worker version
    pub fn adopt_protocol(&mut self, negotiated: u32) {
        self.protocol = self.protocol.min(negotiated);
    }
}

/// Login name of the current user
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "nobody".to_string())
}
