//! Error taxonomy for the coordinator
//!
//! Worker-level failures are normally absorbed by marking the worker bad, so
//! most of these only reach the caller when recovery is impossible.

use crate::coordinator::registry::Ordinal;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProofError {
    /// The session never became valid (see `Coordinator::init`)
    #[error("session is not valid")]
    InvalidSession,

    #[error("protocol version {negotiated} unsupported (client {client}, worker {worker}, minimum {minimum})")]
    ProtocolUnsupported {
        client: u32,
        worker: u32,
        negotiated: u32,
        minimum: u32,
    },

    #[error("no usable workers remain")]
    NoWorkers,

    /// The operation's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    #[error("worker {ordinal} failed: {reason}")]
    WorkerFailure { ordinal: Ordinal, reason: String },

    #[error("protocol violation from worker {ordinal}: unexpected {kind}")]
    ProtocolViolation { ordinal: Ordinal, kind: String },

    #[error("package '{name}' failed to build: {reason}")]
    PackageBuild { name: String, reason: String },

    /// Another builder holds the package lock
    #[error("package '{name}' is busy (lock held by another builder)")]
    PackageBusy { name: String },

    #[error("package '{name}' not found in {}", dir.display())]
    PackageNotFound { name: String, dir: PathBuf },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ProofError>;

impl ProofError {
    pub fn worker(ordinal: Ordinal, reason: impl Into<String>) -> Self {
        Self::WorkerFailure {
            ordinal,
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the error is confined to a single worker
    pub fn is_worker_local(&self) -> bool {
        matches!(
            self,
            Self::WorkerFailure { .. } | Self::ProtocolViolation { .. } | Self::Transport(_)
        )
    }
}
