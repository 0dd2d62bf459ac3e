//! Readiness multiplexing over worker connections
//!
//! Every connection's reader pump feeds one shared inbox. The monitor keeps a
//! set of *active* ordinals and hands out events only for those; events from
//! inactive workers are parked in a per-worker queue and delivered, in
//! arrival order, once the worker is activated again. Per-worker ordering is
//! therefore preserved across collect calls.

use crate::coordinator::registry::Ordinal;
use crate::distributed::connection::{Envelope, Inbound, InboxSender};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct Monitor {
    sender: InboxSender,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    parked: HashMap<Ordinal, VecDeque<Inbound>>,
    active: BTreeSet<Ordinal>,
}

impl Monitor {
    pub fn new() -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            sender,
            inbox,
            parked: HashMap::new(),
            active: BTreeSet::new(),
        }
    }

    /// Inbox handle for a new connection's reader pump
    pub fn sender(&self) -> InboxSender {
        self.sender.clone()
    }

    pub fn activate(&mut self, ordinal: Ordinal) {
        self.active.insert(ordinal);
    }

    pub fn deactivate(&mut self, ordinal: Ordinal) {
        self.active.remove(&ordinal);
    }

    pub fn deactivate_all(&mut self) {
        self.active.clear();
    }

    pub fn is_active(&self, ordinal: Ordinal) -> bool {
        self.active.contains(&ordinal)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drop everything buffered for a worker and stop watching it
    pub fn discard(&mut self, ordinal: Ordinal) {
        self.active.remove(&ordinal);
        self.parked.remove(&ordinal);
    }

    /// Wait until an active worker has an event, or the timeout elapses
    pub async fn select(&mut self, timeout: Duration) -> Option<(Ordinal, Inbound)> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(ready) = self.take_parked() {
                return Some(ready);
            }

            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(envelope)) => {
                    if self.active.contains(&envelope.ordinal) {
                        return Some((envelope.ordinal, envelope.event));
                    }
                    self.parked
                        .entry(envelope.ordinal)
                        .or_default()
                        .push_back(envelope.event);
                }
                // The monitor holds a sender itself, so the inbox never closes.
                Ok(None) => return None,
                Err(_) => return None,
            }
        }
    }

    fn take_parked(&mut self) -> Option<(Ordinal, Inbound)> {
        let ordinal = self
            .active
            .iter()
            .copied()
            .find(|o| self.parked.get(o).is_some_and(|q| !q.is_empty()))?;

        let queue = self.parked.get_mut(&ordinal)?;
        let event = queue.pop_front()?;
        if queue.is_empty() {
            self.parked.remove(&ordinal);
        }
        Some((ordinal, event))
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
