//! Job execution strategies
//!
//! A `Player` submits one PROCESS job and drives it to completion. The
//! coordinator only sees the trait; `RemotePlayer` runs the job on the Active
//! workers, `LocalPlayer` runs it in-process through a `JobRunner`.

use crate::coordinator::collect::{CollectReport, ReplyHandler};
use crate::coordinator::registry::Ordinal;
use crate::coordinator::Cluster;
use crate::distributed::protocol::*;
use crate::error::{ProofError, Result};
use crate::job::{InterruptFlag, JobControl, JobEvent, JobRunner};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Progress and feedback notifications raised during `process`
pub trait CoordinatorObserver: Send {
    fn on_progress(&mut self, _total: i64, _processed: i64) {}

    fn on_feedback(&mut self, _objects: &[NamedObject]) {}
}

/// Observer that ignores everything
#[derive(Debug, Default)]
pub struct NoObserver;

impl CoordinatorObserver for NoObserver {}

/// Parameters of one job
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub dataset: String,
    pub selector: String,
    pub options: String,
    /// Number of entries, -1 for all
    pub entries: i64,
    pub first_entry: i64,
}

impl JobSpec {
    pub fn new(dataset: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            selector: selector.into(),
            options: String::new(),
            entries: -1,
            first_entry: 0,
        }
    }

    pub fn to_message(&self, inputs: Vec<NamedObject>) -> ProcessMessage {
        ProcessMessage {
            dataset: self.dataset.clone(),
            selector: self.selector.clone(),
            options: self.options.clone(),
            entries: self.entries,
            first_entry: self.first_entry,
            inputs,
        }
    }
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    /// Some workers failed; the rest completed
    PartialFailure { failed: usize },
    /// No worker completed the job
    TotalFailure,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Workers that completed with status 0
    pub succeeded: BTreeSet<Ordinal>,
    /// Workers that failed, were marked bad, or reported a non-zero status
    pub failed: BTreeSet<Ordinal>,
    pub statuses: BTreeMap<Ordinal, i32>,
    /// OUTPUT objects, merged by name (last one wins)
    pub outputs: Vec<NamedObject>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl JobOutcome {
    fn from_report(submitted: &[Ordinal], report: CollectReport, outputs: Vec<NamedObject>, elapsed: Duration) -> Self {
        let succeeded: BTreeSet<Ordinal> = report.succeeded().collect();
        let failed: BTreeSet<Ordinal> = submitted
            .iter()
            .copied()
            .filter(|o| !succeeded.contains(o))
            .chain(report.failed.iter().copied())
            .collect();

        let status = if succeeded.is_empty() {
            JobStatus::TotalFailure
        } else if failed.is_empty() {
            JobStatus::Success
        } else {
            JobStatus::PartialFailure { failed: failed.len() }
        };

        Self {
            status,
            succeeded,
            failed,
            statuses: report.statuses,
            outputs,
            cancelled: report.cancelled,
            elapsed,
        }
    }
}

/// A submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job: ProcessMessage,
    /// Targets the job reached
    pub submitted: Vec<Ordinal>,
    /// Targets requested but not reached
    pub unreached: Vec<Ordinal>,
    pub started: Instant,
}

/// Pluggable job execution strategy
#[async_trait]
pub trait Player: Send {
    async fn submit(&mut self, cluster: &mut Cluster, job: ProcessMessage, targets: &[Ordinal]) -> Result<JobHandle>;

    async fn collect_results(
        &mut self,
        cluster: &mut Cluster,
        handle: JobHandle,
        observer: &mut dyn CoordinatorObserver,
    ) -> Result<JobOutcome>;

    /// False when the job runs without any Active worker
    fn needs_workers(&self) -> bool {
        true
    }
}

/// Merge an OUTPUT object into a list, replacing any object of the same name
pub fn merge_output(outputs: &mut Vec<NamedObject>, object: NamedObject) {
    match outputs.iter_mut().find(|o| o.name == object.name) {
        Some(existing) => *existing = object,
        None => outputs.push(object),
    }
}

/// Reply handler for a running job
struct JobCollector<'a> {
    observer: &'a mut dyn CoordinatorObserver,
    progress: BTreeMap<Ordinal, (i64, i64)>,
    outputs: Vec<NamedObject>,
}

impl<'a> JobCollector<'a> {
    fn new(observer: &'a mut dyn CoordinatorObserver) -> Self {
        Self {
            observer,
            progress: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }
}

impl ReplyHandler for JobCollector<'_> {
    fn on_output(&mut self, ordinal: Ordinal, object: NamedObject) {
        tracing::debug!(worker = ordinal, name = %object.name, bytes = object.payload.len(), "output received");
        merge_output(&mut self.outputs, object);
    }

    fn on_progress(&mut self, ordinal: Ordinal, progress: ProgressMessage) {
        self.progress.insert(ordinal, (progress.total, progress.processed));
        let (total, processed) = self
            .progress
            .values()
            .fold((0, 0), |(t, p), (wt, wp)| (t + wt, p + wp));
        self.observer.on_progress(total, processed);
    }

    fn on_feedback(&mut self, ordinal: Ordinal, objects: Vec<NamedObject>) {
        tracing::debug!(worker = ordinal, objects = objects.len(), "feedback received");
        self.observer.on_feedback(&objects);
    }
}

/// Runs the job on remote workers
#[derive(Debug, Default)]
pub struct RemotePlayer;

impl RemotePlayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Player for RemotePlayer {
    async fn submit(&mut self, cluster: &mut Cluster, job: ProcessMessage, targets: &[Ordinal]) -> Result<JobHandle> {
        let started = Instant::now();
        let msg = Message::Process(job.clone());
        let sent = cluster.broadcaster().broadcast(&msg, targets).await?;

        let (submitted, unreached): (Vec<Ordinal>, Vec<Ordinal>) =
            targets.iter().copied().partition(|&o| cluster.registry.is_usable(o));
        if sent == 0 {
            return Err(ProofError::NoWorkers);
        }

        tracing::info!(
            selector = %job.selector,
            workers = submitted.len(),
            unreached = unreached.len(),
            "job submitted"
        );
        Ok(JobHandle {
            job,
            submitted,
            unreached,
            started,
        })
    }

    async fn collect_results(
        &mut self,
        cluster: &mut Cluster,
        handle: JobHandle,
        observer: &mut dyn CoordinatorObserver,
    ) -> Result<JobOutcome> {
        let deadline = cluster.timeouts.job.map(|t| handle.started + t);
        let tick = cluster.timeouts.collect;
        let grace = cluster.timeouts.grace;
        let mut handler = JobCollector::new(observer);
        let mut report = CollectReport::default();
        report.failed.extend(handle.unreached.iter().copied());
        let mut pending = handle.submitted.clone();

        loop {
            let wait = match deadline {
                Some(deadline) => tick.min(deadline.saturating_duration_since(Instant::now())),
                None => tick,
            };
            let next = cluster.collector().collect(&pending, wait, &mut handler).await;
            report.merge(next);
            pending = report.pending.clone();

            if report.is_complete() {
                break;
            }

            if report.cancelled {
                tracing::warn!(pending = pending.len(), "job cancelled, aborting workers");
                for &ordinal in &pending {
                    if let Some(conn) = cluster.registry.connection(ordinal) {
                        if let Err(e) = conn.send_urgent(InterruptKind::Hard) {
                            tracing::debug!(worker = ordinal, error = %e, "abort not delivered");
                        }
                    }
                }
                let next = cluster.uncancellable_collector().collect(&pending, grace, &mut handler).await;
                report.merge(next);
                report.cancelled = true;
                cluster.mark_pending_bad(&report);
                break;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(pending = ?pending, "job timed out");
                cluster.mark_pending_bad(&report);
                break;
            }

            tracing::debug!(pending = pending.len(), elapsed = ?handle.started.elapsed(), "job still running");
        }

        let outputs = std::mem::take(&mut handler.outputs);
        let outcome = JobOutcome::from_report(&handle.submitted, report, outputs, handle.started.elapsed());
        tracing::info!(status = ?outcome.status, elapsed = ?outcome.elapsed, "job finished");
        Ok(outcome)
    }
}

/// Runs the job in this process
///
/// Used for pure-local sessions and tests; the interrupt flag is raised
/// (Hard) when the cluster's cancellation token fires.
pub struct LocalPlayer {
    runner: Arc<dyn JobRunner>,
}

impl LocalPlayer {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Player for LocalPlayer {
    fn needs_workers(&self) -> bool {
        false
    }

    async fn submit(&mut self, _cluster: &mut Cluster, job: ProcessMessage, _targets: &[Ordinal]) -> Result<JobHandle> {
        Ok(JobHandle {
            job,
            submitted: Vec::new(),
            unreached: Vec::new(),
            started: Instant::now(),
        })
    }

    async fn collect_results(
        &mut self,
        cluster: &mut Cluster,
        handle: JobHandle,
        observer: &mut dyn CoordinatorObserver,
    ) -> Result<JobOutcome> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let interrupt = Arc::new(InterruptFlag::default());
        let control = JobControl::new(events_tx, interrupt.clone());
        let runner = self.runner.clone();
        let job = handle.job.clone();
        let mut task = tokio::task::spawn_blocking(move || runner.run(&job, &control));

        let cancel = cluster.cancel_token();
        let mut outputs = Vec::new();
        let mut cancelled = false;
        let result = loop {
            tokio::select! {
                Some(event) = events.recv() => apply_local_event(event, &mut outputs, observer),
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    interrupt.raise(InterruptKind::Hard);
                }
                result = &mut task => break result,
            }
        };
        while let Ok(event) = events.try_recv() {
            apply_local_event(event, &mut outputs, observer);
        }

        let report = result
            .map_err(|e| ProofError::Other(anyhow::anyhow!("local job panicked: {}", e)))??;
        cluster.session.counters.record(&report.stats);
        cluster.session.status = report.status;

        let status = if report.status == 0 {
            JobStatus::Success
        } else {
            JobStatus::TotalFailure
        };
        Ok(JobOutcome {
            status,
            succeeded: BTreeSet::new(),
            failed: BTreeSet::new(),
            statuses: BTreeMap::new(),
            outputs,
            cancelled,
            elapsed: handle.started.elapsed(),
        })
    }
}

fn apply_local_event(event: JobEvent, outputs: &mut Vec<NamedObject>, observer: &mut dyn CoordinatorObserver) {
    match event {
        JobEvent::Progress { total, processed } => observer.on_progress(total, processed),
        JobEvent::Output(object) => merge_output(outputs, object),
        JobEvent::Feedback(objects) => observer.on_feedback(&objects),
        JobEvent::Log(line) => tracing::info!(local = true, "{}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::testing::{Behavior, TestCluster};
    use crate::job::CountingRunner;

    #[derive(Default)]
    struct Recorder {
        progress: Vec<(i64, i64)>,
    }

    impl CoordinatorObserver for Recorder {
        fn on_progress(&mut self, total: i64, processed: i64) {
            self.progress.push((total, processed));
        }
    }

    fn job(entries: i64) -> ProcessMessage {
        JobSpec {
            entries,
            ..JobSpec::new("ds", "count")
        }
        .to_message(Vec::new())
    }

    #[test]
    fn test_merge_output_replaces_by_name() {
        let mut outputs = Vec::new();
        merge_output(&mut outputs, NamedObject::new("h", vec![1]));
        merge_output(&mut outputs, NamedObject::new("g", vec![2]));
        merge_output(&mut outputs, NamedObject::new("h", vec![3]));
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].payload, vec![3]);
    }

    #[tokio::test]
    async fn test_remote_job_succeeds() {
        let mut tc = TestCluster::healthy(&["A", "B"]).await;
        let targets = tc.cluster.registry.select_set(crate::coordinator::registry::WorkerSet::Active);
        let mut player = RemotePlayer::new();
        let mut recorder = Recorder::default();

        let handle = player.submit(&mut tc.cluster, job(10), &targets).await.unwrap();
        let outcome = player.collect_results(&mut tc.cluster, handle, &mut recorder).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(tc.cluster.session.counters.bytes_read(), 2 * 10 * 1024);
        assert_eq!(recorder.progress.last(), Some(&(20, 20)));
    }

    #[tokio::test]
    async fn test_dead_worker_is_partial_failure() {
        let mut tc = TestCluster::with_behaviors(&[("A", Behavior::Normal), ("B", Behavior::DieAfterHello)]).await;
        let targets = tc.cluster.registry.select_set(crate::coordinator::registry::WorkerSet::Active);
        let mut player = RemotePlayer::new();

        let handle = player.submit(&mut tc.cluster, job(5), &targets).await.unwrap();
        let outcome = player
            .collect_results(&mut tc.cluster, handle, &mut NoObserver)
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::PartialFailure { failed: 1 });
        assert!(outcome.failed.contains(&1));
        assert!(tc.cluster.registry.is_bad(1));
    }

    #[tokio::test]
    async fn test_job_timeout_marks_silent_worker_bad() {
        let mut tc = TestCluster::with_behaviors(&[("A", Behavior::Normal), ("B", Behavior::Silent)]).await;
        tc.cluster.timeouts.job = Some(Duration::from_millis(300));
        tc.cluster.timeouts.collect = Duration::from_millis(50);
        let targets = tc.cluster.registry.select_set(crate::coordinator::registry::WorkerSet::Active);
        let mut player = RemotePlayer::new();

        let handle = player.submit(&mut tc.cluster, job(5), &targets).await.unwrap();
        let outcome = player
            .collect_results(&mut tc.cluster, handle, &mut NoObserver)
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::PartialFailure { failed: 1 });
        assert!(tc.cluster.registry.is_bad(1));
        assert!(tc.cluster.registry.invariants_hold());
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_job() {
        let mut tc = TestCluster::with_behaviors(&[("A", Behavior::Slow(Duration::from_millis(20)))]).await;
        tc.cluster.timeouts.collect = Duration::from_millis(50);
        let targets = vec![0];
        let mut player = RemotePlayer::new();

        let handle = player.submit(&mut tc.cluster, job(10_000), &targets).await.unwrap();
        let cancel = tc.cluster.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let outcome = player
            .collect_results(&mut tc.cluster, handle, &mut NoObserver)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        // the worker acknowledged the abort with a non-zero status
        assert_eq!(outcome.statuses.get(&0), Some(&1));
        assert_eq!(outcome.status, JobStatus::TotalFailure);
        assert!(!tc.cluster.registry.is_bad(0));
    }

    #[tokio::test]
    async fn test_local_player_runs_in_process() {
        let mut tc = TestCluster::healthy(&[]).await;
        let mut player = LocalPlayer::new(Arc::new(CountingRunner::default()));
        let mut recorder = Recorder::default();

        let handle = player.submit(&mut tc.cluster, job(50), &[]).await.unwrap();
        let outcome = player.collect_results(&mut tc.cluster, handle, &mut recorder).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(recorder.progress.last(), Some(&(50, 50)));
        assert_eq!(tc.cluster.session.counters.bytes_read(), 50 * 1024);
    }
}
