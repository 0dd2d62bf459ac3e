//! Worker registry
//!
//! Owns every `WorkerNode` of the session and the four views over them:
//!
//! ```text
//! All     every registered worker, in registration order (canonical owner)
//! Active  workers participating in the current work
//! Unique  first Active worker per distinct host
//! Bad     failed workers; a worker never leaves this view
//! ```
//!
//! Views are kept as ordinal lists. All membership changes go through
//! `activate`, `mark_bad` and `set_parallelism`, each of which recomputes
//! Unique before returning.

use crate::distributed::connection::Connection;
use crate::distributed::protocol::{WorkerInfoMessage, WorkerState};
use std::collections::HashSet;

/// Stable worker identity within a session
pub type Ordinal = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Active,
    NotActive,
    Bad,
}

impl From<WorkerStatus> for WorkerState {
    fn from(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Active => WorkerState::Active,
            WorkerStatus::NotActive => WorkerState::NotActive,
            WorkerStatus::Bad => WorkerState::Bad,
        }
    }
}

/// Worker view selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSet {
    All,
    Active,
    Unique,
    Bad,
}

/// One worker process
#[derive(Debug)]
pub struct WorkerNode {
    pub ordinal: Ordinal,

    /// Host identity, used to detect shared filesystems
    pub host: String,

    /// Relative speed (higher is faster)
    pub perf_index: i32,

    pub status: WorkerStatus,

    /// Negotiated protocol version for this worker
    pub protocol: u32,

    pub conn: Connection,
}

impl WorkerNode {
    pub fn new(ordinal: Ordinal, host: impl Into<String>, perf_index: i32, protocol: u32, conn: Connection) -> Self {
        Self {
            ordinal,
            host: host.into(),
            perf_index,
            status: WorkerStatus::NotActive,
            protocol,
            conn,
        }
    }

    pub fn info(&self) -> WorkerInfoMessage {
        WorkerInfoMessage {
            ordinal: self.ordinal,
            host: self.host.clone(),
            perf_index: self.perf_index,
            status: self.status.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    nodes: Vec<WorkerNode>,
    active: Vec<Ordinal>,
    unique: Vec<Ordinal>,
    bad: Vec<Ordinal>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker to All (not yet Active)
    pub fn register(&mut self, node: WorkerNode) {
        self.nodes.push(node);
    }

    /// Move a registered, non-bad worker into Active
    ///
    /// Returns false if the worker is unknown or bad.
    pub fn activate(&mut self, ordinal: Ordinal) -> bool {
        match self.node(ordinal) {
            Some(node) if node.status == WorkerStatus::Bad => return false,
            Some(node) if node.status == WorkerStatus::Active => return true,
            Some(_) => {}
            None => return false,
        }
        self.set_status(ordinal, WorkerStatus::Active);
        self.active.push(ordinal);
        self.sort_active();
        self.recompute_unique();
        true
    }

    /// Snapshot of a view, in registration order
    pub fn select_set(&self, which: WorkerSet) -> Vec<Ordinal> {
        match which {
            WorkerSet::All => self.nodes.iter().map(|n| n.ordinal).collect(),
            WorkerSet::Active => self.active.clone(),
            WorkerSet::Unique => self.unique.clone(),
            WorkerSet::Bad => self.bad.clone(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkerNode> {
        self.nodes.iter()
    }

    pub fn node(&self, ordinal: Ordinal) -> Option<&WorkerNode> {
        self.nodes.iter().find(|n| n.ordinal == ordinal)
    }

    pub fn node_mut(&mut self, ordinal: Ordinal) -> Option<&mut WorkerNode> {
        self.nodes.iter_mut().find(|n| n.ordinal == ordinal)
    }

    pub fn connection(&self, ordinal: Ordinal) -> Option<&Connection> {
        self.node(ordinal).map(|n| &n.conn)
    }

    /// True if the worker exists and is not bad
    pub fn is_usable(&self, ordinal: Ordinal) -> bool {
        self.node(ordinal).is_some_and(|n| n.status != WorkerStatus::Bad)
    }

    pub fn is_bad(&self, ordinal: Ordinal) -> bool {
        self.bad.contains(&ordinal)
    }

    /// Move a worker to Bad and close its connection
    ///
    /// Idempotent. Returns true only on the first call for a worker.
    pub fn mark_bad(&mut self, ordinal: Ordinal) -> bool {
        let Some(node) = self.node_mut(ordinal) else {
            return false;
        };
        if node.status == WorkerStatus::Bad {
            return false;
        }

        node.status = WorkerStatus::Bad;
        node.conn.close();
        tracing::warn!(worker = ordinal, host = %node.host, "worker marked bad");

        self.active.retain(|&o| o != ordinal);
        self.bad.push(ordinal);
        self.recompute_unique();
        true
    }

    /// Rebuild Unique: first Active worker per distinct host
    pub fn recompute_unique(&mut self) {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for &ordinal in &self.active {
            if let Some(node) = self.node(ordinal) {
                if seen.insert(node.host.as_str()) {
                    unique.push(ordinal);
                }
            }
        }
        self.unique = unique;
    }

    /// Resize Active to `n` workers
    ///
    /// Grows by promoting non-bad workers in ordinal order; shrinks by
    /// demoting the slowest workers first (ties: highest ordinal first).
    /// Returns the achieved Active count.
    pub fn set_parallelism(&mut self, n: usize) -> usize {
        if n > self.active.len() {
            let mut candidates: Vec<Ordinal> = self
                .nodes
                .iter()
                .filter(|node| node.status == WorkerStatus::NotActive)
                .map(|node| node.ordinal)
                .collect();
            candidates.sort_unstable();

            for ordinal in candidates.into_iter().take(n - self.active.len()) {
                self.set_status(ordinal, WorkerStatus::Active);
                self.active.push(ordinal);
            }
        } else if n < self.active.len() {
            let mut ranked: Vec<(i32, Ordinal)> = self
                .active
                .iter()
                .filter_map(|&o| self.node(o).map(|node| (node.perf_index, o)))
                .collect();
            ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

            let excess = self.active.len() - n;
            for (_, ordinal) in ranked.into_iter().take(excess) {
                self.set_status(ordinal, WorkerStatus::NotActive);
                self.active.retain(|&o| o != ordinal);
            }
        }

        self.sort_active();
        self.recompute_unique();
        self.active.len()
    }

    /// Unique subset (by host) of an arbitrary target list, preserving order
    pub fn unique_of(&self, targets: &[Ordinal]) -> Vec<Ordinal> {
        let mut seen = HashSet::new();
        targets
            .iter()
            .copied()
            .filter(|&o| self.node(o).is_some_and(|node| seen.insert(node.host.as_str())))
            .collect()
    }

    /// Check the view invariants
    pub fn invariants_hold(&self) -> bool {
        let known = |o: &Ordinal| self.node(*o).is_some();
        self.active.iter().all(known)
            && self.bad.iter().all(known)
            && self.unique.iter().all(|o| self.active.contains(o))
            && self.active.iter().all(|o| !self.bad.contains(o))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn unique_count(&self) -> usize {
        self.unique.len()
    }

    pub fn bad_count(&self) -> usize {
        self.bad.len()
    }

    /// Close every connection (views are left untouched)
    pub fn close_all(&mut self) {
        for node in &mut self.nodes {
            node.conn.close();
        }
    }

    fn set_status(&mut self, ordinal: Ordinal, status: WorkerStatus) {
        if let Some(node) = self.node_mut(ordinal) {
            node.status = status;
        }
    }

    fn sort_active(&mut self) {
        let position = |o: &Ordinal| self.nodes.iter().position(|n| n.ordinal == *o);
        let mut keyed: Vec<(Option<usize>, Ordinal)> =
            self.active.iter().map(|o| (position(o), *o)).collect();
        keyed.sort_unstable();
        self.active = keyed.into_iter().map(|(_, o)| o).collect();
    }
}
