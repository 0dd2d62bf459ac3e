//! Many-to-one reply gathering
//!
//! The collector watches a target set through the monitor until every target
//! has finished, the call's timeout elapses, or the cancellation token fires.
//!
//! ```text
//! LOGFILE / OUTPUT / PROGRESS / FEEDBACK / STATS   kept, worker still pending
//! LOGDONE(status)                                  worker finished
//! stream closed                                    worker marked bad, finished
//! anything else the handler refuses                protocol violation, bad
//! ```
//!
//! Targets still pending on return are deactivated in the monitor; later
//! events from them stay parked until the next collect that includes them.

use crate::coordinator::registry::{Ordinal, WorkerRegistry};
use crate::coordinator::session::Session;
use crate::distributed::connection::Inbound;
use crate::distributed::monitor::Monitor;
use crate::distributed::protocol::*;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to do with a reply the collector has no built-in rule for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Consumed; keep waiting for this worker
    Continue,
    /// Consumed; the worker is done
    Finished,
    /// Not expected in this exchange
    Unexpected,
}

/// Receives the payload of a collect cycle
pub trait ReplyHandler: Send {
    fn on_log(&mut self, ordinal: Ordinal, chunk: &str) {
        for line in chunk.lines() {
            tracing::info!(worker = ordinal, "{}", line);
        }
    }

    fn on_output(&mut self, ordinal: Ordinal, object: NamedObject) {
        tracing::debug!(worker = ordinal, name = %object.name, "output ignored");
    }

    fn on_progress(&mut self, _ordinal: Ordinal, _progress: ProgressMessage) {}

    fn on_feedback(&mut self, _ordinal: Ordinal, _objects: Vec<NamedObject>) {}

    fn on_done(&mut self, _ordinal: Ordinal, _status: i32) {}

    fn on_reply(&mut self, _ordinal: Ordinal, _msg: Message) -> Reply {
        Reply::Unexpected
    }
}

/// Handler that only logs
#[derive(Debug, Default)]
pub struct LogOnly;

impl ReplyHandler for LogOnly {}

/// Handler keeping log chunks for the caller
#[derive(Debug, Default)]
pub struct LogCapture {
    pub chunks: Vec<(Ordinal, String)>,
}

impl ReplyHandler for LogCapture {
    fn on_log(&mut self, ordinal: Ordinal, chunk: &str) {
        self.chunks.push((ordinal, chunk.to_string()));
    }
}

#[derive(Debug, Default, Clone)]
pub struct CollectReport {
    /// Targets that finished, successfully or not
    pub finished: usize,

    /// Targets marked bad during (or before) the call
    pub failed: BTreeSet<Ordinal>,

    /// Targets that had not finished on return
    pub pending: Vec<Ordinal>,

    /// LOGDONE status per worker
    pub statuses: BTreeMap<Ordinal, i32>,

    pub timed_out: bool,
    pub cancelled: bool,
}

impl CollectReport {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Workers that finished with status 0
    pub fn succeeded(&self) -> impl Iterator<Item = Ordinal> + '_ {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == 0)
            .map(|(&o, _)| o)
    }

    pub(crate) fn merge(&mut self, next: CollectReport) {
        self.finished += next.finished;
        self.failed.extend(next.failed);
        self.statuses.extend(next.statuses);
        self.pending = next.pending;
        self.timed_out = next.timed_out;
        self.cancelled |= next.cancelled;
    }
}

pub struct Collector<'a> {
    registry: &'a mut WorkerRegistry,
    monitor: &'a mut Monitor,
    session: &'a mut Session,
    cancel: CancellationToken,
}

impl<'a> Collector<'a> {
    pub fn new(
        registry: &'a mut WorkerRegistry,
        monitor: &'a mut Monitor,
        session: &'a mut Session,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            monitor,
            session,
            cancel,
        }
    }

    /// Gather replies from `targets` for at most `timeout`
    pub async fn collect(
        &mut self,
        targets: &[Ordinal],
        timeout: Duration,
        handler: &mut dyn ReplyHandler,
    ) -> CollectReport {
        let deadline = Instant::now() + timeout;
        let mut report = CollectReport::default();
        let mut pending = BTreeSet::new();

        for &ordinal in targets {
            if self.registry.is_usable(ordinal) {
                if pending.insert(ordinal) {
                    self.monitor.activate(ordinal);
                }
            } else {
                report.failed.insert(ordinal);
                report.finished += 1;
            }
        }

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ready = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                ready = self.monitor.select(remaining) => ready,
            };

            let Some((ordinal, event)) = ready else {
                report.timed_out = true;
                break;
            };
            if !pending.contains(&ordinal) {
                continue;
            }

            let finished = match event {
                Inbound::Frame(Frame::Message(msg)) => self.dispatch(ordinal, msg, handler, &mut report),
                Inbound::Frame(Frame::Raw(_)) => self.violation(ordinal, "RAW", &mut report),
                Inbound::Frame(Frame::Urgent(_)) => self.violation(ordinal, "URGENT", &mut report),
                Inbound::Closed(reason) => {
                    tracing::warn!(worker = ordinal, reason = reason.as_deref().unwrap_or("eof"), "connection lost");
                    self.fail(ordinal, &mut report);
                    true
                }
            };

            if finished {
                pending.remove(&ordinal);
                self.monitor.deactivate(ordinal);
                report.finished += 1;
            }
        }

        for &ordinal in &pending {
            self.monitor.deactivate(ordinal);
        }
        report.pending = pending.into_iter().collect();
        if report.timed_out {
            tracing::debug!(pending = ?report.pending, "collect timed out");
        }
        report
    }

    fn dispatch(
        &mut self,
        ordinal: Ordinal,
        msg: Message,
        handler: &mut dyn ReplyHandler,
        report: &mut CollectReport,
    ) -> bool {
        match msg {
            Message::LogFile(log) => {
                handler.on_log(ordinal, &log.chunk);
                false
            }
            Message::Output(object) => {
                handler.on_output(ordinal, object);
                false
            }
            Message::Progress(progress) => {
                handler.on_progress(ordinal, progress);
                false
            }
            Message::Feedback(objects) => {
                handler.on_feedback(ordinal, objects);
                false
            }
            Message::Stats(stats) => {
                self.session.counters.record(&stats);
                false
            }
            Message::LogDone(done) => {
                handler.on_done(ordinal, done.status);
                report.statuses.insert(ordinal, done.status);
                self.session.status = done.status;
                true
            }
            other => {
                let kind = other.kind_name();
                match handler.on_reply(ordinal, other) {
                    Reply::Continue => false,
                    Reply::Finished => {
                        report.statuses.insert(ordinal, 0);
                        true
                    }
                    Reply::Unexpected => self.violation(ordinal, kind, report),
                }
            }
        }
    }

    fn violation(&mut self, ordinal: Ordinal, kind: &str, report: &mut CollectReport) -> bool {
        tracing::warn!(worker = ordinal, kind, "protocol violation");
        self.fail(ordinal, report);
        true
    }

    fn fail(&mut self, ordinal: Ordinal, report: &mut CollectReport) {
        self.registry.mark_bad(ordinal);
        self.monitor.discard(ordinal);
        report.failed.insert(ordinal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::registry::{WorkerNode, WorkerSet};
    use crate::coordinator::session::Role;
    use crate::distributed::connection::Connection;
    use tokio::io::DuplexStream;

    struct Fixture {
        registry: WorkerRegistry,
        monitor: Monitor,
        session: Session,
        peers: Vec<DuplexStream>,
    }

    impl Fixture {
        fn new(count: u32) -> Self {
            let monitor = Monitor::new();
            let mut registry = WorkerRegistry::new();
            let mut peers = Vec::new();
            for ordinal in 0..count {
                let (master, worker) = tokio::io::duplex(64 * 1024);
                let conn = Connection::spawn(ordinal, master, monitor.sender(), Duration::from_secs(5));
                registry.register(WorkerNode::new(ordinal, "host", 100, PROTOCOL_VERSION, conn));
                registry.activate(ordinal);
                peers.push(worker);
            }
            Self {
                registry,
                monitor,
                session: Session::new("localhost", Role::Master),
                peers,
            }
        }

        async fn reply(&mut self, ordinal: usize, msg: Message) {
            write_frame(&mut self.peers[ordinal], &msg.into()).await.unwrap();
        }

        async fn collect(&mut self, timeout: Duration, handler: &mut dyn ReplyHandler) -> CollectReport {
            let targets = self.registry.select_set(WorkerSet::Active);
            Collector::new(&mut self.registry, &mut self.monitor, &mut self.session, CancellationToken::new())
                .collect(&targets, timeout, handler)
                .await
        }
    }

    fn done(status: i32) -> Message {
        Message::LogDone(LogDoneMessage { status })
    }

    #[tokio::test]
    async fn test_collect_until_all_done() {
        let mut fx = Fixture::new(2);
        fx.reply(0, Message::LogFile(LogFileMessage { chunk: "hello".into() })).await;
        fx.reply(0, done(0)).await;
        fx.reply(1, Message::Stats(WorkerStats { bytes_read: 10, real_time: 1.0, cpu_time: 1.0 })).await;
        fx.reply(1, done(3)).await;

        let mut capture = LogCapture::default();
        let report = fx.collect(Duration::from_secs(5), &mut capture).await;

        assert_eq!(report.finished, 2);
        assert!(report.is_complete());
        assert!(!report.timed_out);
        assert_eq!(report.statuses.get(&1), Some(&3));
        assert_eq!(capture.chunks, vec![(0, "hello".to_string())]);
        assert_eq!(fx.session.counters.bytes_read(), 10);
    }

    #[tokio::test]
    async fn test_collect_times_out_with_pending() {
        let mut fx = Fixture::new(3);
        fx.reply(0, done(0)).await;
        fx.reply(2, done(0)).await;

        let start = std::time::Instant::now();
        let report = fx.collect(Duration::from_millis(100), &mut LogOnly).await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(report.timed_out);
        assert_eq!(report.finished, 2);
        assert_eq!(report.pending, vec![1]);
        assert_eq!(report.finished, 3 - report.pending.len());
    }

    #[tokio::test]
    async fn test_closed_connection_marks_bad() {
        let mut fx = Fixture::new(2);
        fx.reply(0, done(0)).await;
        drop(fx.peers.remove(1));

        let report = fx.collect(Duration::from_secs(5), &mut LogOnly).await;

        assert_eq!(report.finished, 2);
        assert!(report.failed.contains(&1));
        assert_eq!(fx.registry.select_set(WorkerSet::Active), vec![0]);
        assert!(fx.registry.invariants_hold());
    }

    #[tokio::test]
    async fn test_unexpected_kind_is_violation() {
        let mut fx = Fixture::new(2);
        fx.reply(0, Message::Process(ProcessMessage {
            dataset: String::new(),
            selector: String::new(),
            options: String::new(),
            entries: -1,
            first_entry: 0,
            inputs: Vec::new(),
        }))
        .await;
        fx.reply(1, done(0)).await;

        let report = fx.collect(Duration::from_secs(5), &mut LogOnly).await;

        assert_eq!(report.failed.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(fx.registry.select_set(WorkerSet::Bad), vec![0]);
        assert_eq!(report.succeeded().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_handler_accepts_custom_reply() {
        struct InfoHandler(Vec<WorkerInfoMessage>);
        impl ReplyHandler for InfoHandler {
            fn on_reply(&mut self, _ordinal: Ordinal, msg: Message) -> Reply {
                match msg {
                    Message::WorkerInfo(info) => {
                        self.0.push(info);
                        Reply::Finished
                    }
                    _ => Reply::Unexpected,
                }
            }
        }

        let mut fx = Fixture::new(1);
        fx.reply(0, Message::WorkerInfo(WorkerInfoMessage {
            ordinal: 0,
            host: "host".into(),
            perf_index: 100,
            status: WorkerState::Active,
        }))
        .await;

        let mut handler = InfoHandler(Vec::new());
        let report = fx.collect(Duration::from_secs(5), &mut handler).await;
        assert!(report.is_complete());
        assert_eq!(handler.0.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_collect() {
        let mut fx = Fixture::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let targets = vec![0];
        let report = Collector::new(&mut fx.registry, &mut fx.monitor, &mut fx.session, cancel)
            .collect(&targets, Duration::from_secs(30), &mut LogOnly)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.pending, vec![0]);
        assert_eq!(fx.registry.bad_count(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_kept_for_next_collect() {
        let mut fx = Fixture::new(1);
        let report = fx.collect(Duration::from_millis(20), &mut LogOnly).await;
        assert_eq!(report.pending, vec![0]);

        fx.reply(0, done(0)).await;
        let report = fx.collect(Duration::from_secs(5), &mut LogOnly).await;
        assert!(report.is_complete());
        assert_eq!(report.statuses.get(&0), Some(&0));
    }
}
