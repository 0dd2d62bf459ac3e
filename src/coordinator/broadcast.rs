//! One-to-many sends
//!
//! Messages are encoded once and the frame bytes shared between targets.
//! Sends run one worker at a time; a failed send marks that worker bad and
//! the broadcast moves on.

use crate::coordinator::registry::{Ordinal, WorkerRegistry, WorkerSet};
use crate::distributed::protocol::*;
use crate::error::{ProofError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Broadcaster<'a> {
    registry: &'a mut WorkerRegistry,
    cancel: CancellationToken,
}

impl<'a> Broadcaster<'a> {
    pub fn new(registry: &'a mut WorkerRegistry, cancel: CancellationToken) -> Self {
        Self { registry, cancel }
    }

    /// Send a structured message to `targets`
    ///
    /// Returns the number of workers the message reached.
    pub async fn broadcast(&mut self, msg: &Message, targets: &[Ordinal]) -> Result<usize> {
        let bytes = serialize_message(msg).map_err(|e| ProofError::transport(format!("{:#}", e)))?;
        tracing::debug!(kind = msg.kind_name(), targets = targets.len(), "broadcast");
        Ok(self.send_shared(Arc::new(bytes), targets).await)
    }

    pub async fn broadcast_set(&mut self, msg: &Message, which: WorkerSet) -> Result<usize> {
        let targets = self.registry.select_set(which);
        self.broadcast(msg, &targets).await
    }

    /// Send a short textual command
    pub async fn broadcast_command(&mut self, kind: CommandKind, text: &str, targets: &[Ordinal]) -> Result<usize> {
        self.broadcast(&Message::command(kind, text), targets).await
    }

    pub async fn broadcast_object(&mut self, kind: ObjectKind, object: NamedObject, targets: &[Ordinal]) -> Result<usize> {
        self.broadcast(&Message::Object(ObjectMessage { kind, object }), targets)
            .await
    }

    /// Send one RAW frame carrying `buffer`
    pub async fn broadcast_raw(&mut self, buffer: &[u8], targets: &[Ordinal]) -> Result<usize> {
        let bytes = serialize_raw(buffer).map_err(|e| ProofError::transport(format!("{:#}", e)))?;
        Ok(self.send_shared(Arc::new(bytes), targets).await)
    }

    async fn send_shared(&mut self, bytes: Arc<Vec<u8>>, targets: &[Ordinal]) -> usize {
        let mut sent = 0;

        for &ordinal in targets {
            if self.cancel.is_cancelled() {
                tracing::debug!(sent, remaining = targets.len() - sent, "broadcast cancelled");
                break;
            }
            if !self.registry.is_usable(ordinal) {
                continue;
            }
            let Some(conn) = self.registry.connection(ordinal) else {
                continue;
            };

            let result = conn.send_encoded(bytes.clone()).await;
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(worker = ordinal, error = %e, "send failed");
                    self.registry.mark_bad(ordinal);
                }
            }
        }

        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::registry::WorkerNode;
    use crate::distributed::connection::Connection;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn registry_of(count: u32) -> (WorkerRegistry, Vec<DuplexStream>) {
        let (inbox, _rx) = mpsc::unbounded_channel();
        let mut registry = WorkerRegistry::new();
        let mut peers = Vec::new();
        for ordinal in 0..count {
            let (master, worker) = tokio::io::duplex(64 * 1024);
            let conn = Connection::spawn(ordinal, master, inbox.clone(), Duration::from_secs(5));
            registry.register(WorkerNode::new(ordinal, format!("host-{}", ordinal), 100, PROTOCOL_VERSION, conn));
            registry.activate(ordinal);
            peers.push(worker);
        }
        (registry, peers)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_target() {
        let (mut registry, mut peers) = registry_of(3);
        let mut broadcaster = Broadcaster::new(&mut registry, CancellationToken::new());

        let sent = broadcaster.broadcast_set(&Message::Ping, WorkerSet::Active).await.unwrap();
        assert_eq!(sent, 3);

        for peer in &mut peers {
            assert!(matches!(read_frame(peer).await.unwrap(), Frame::Message(Message::Ping)));
        }
    }

    #[tokio::test]
    async fn test_failed_send_marks_worker_bad() {
        let (mut registry, mut peers) = registry_of(3);
        drop(peers.remove(1));

        let sent = Broadcaster::new(&mut registry, CancellationToken::new())
            .broadcast_set(&Message::Ping, WorkerSet::Active)
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(registry.select_set(WorkerSet::Bad), vec![1]);
        assert_eq!(registry.select_set(WorkerSet::Active), vec![0, 2]);
        assert!(registry.invariants_hold());
    }

    #[tokio::test]
    async fn test_bad_targets_are_skipped() {
        let (mut registry, _peers) = registry_of(2);
        registry.mark_bad(0);

        let sent = Broadcaster::new(&mut registry, CancellationToken::new())
            .broadcast(&Message::Ping, &[0, 1])
            .await
            .unwrap();
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_cancelled_broadcast_sends_nothing() {
        let (mut registry, _peers) = registry_of(2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sent = Broadcaster::new(&mut registry, cancel)
            .broadcast_raw(&[1, 2, 3], &[0, 1])
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert_eq!(registry.bad_count(), 0);
    }
}
