//! Master-side coordination
//!
//! `Cluster` bundles the state every collaborator works on (registry,
//! monitor, session, timeouts, cancellation). Broadcaster and collector
//! borrow exactly the parts they need from it.
//!
//! `Coordinator` is the façade: session setup, parallelism control, job
//! submission, urgent signals, and the cache/package operations.
//!
//! # Session setup
//!
//! ```text
//! cluster file ──> connect each worker ──> HELLO handshake ──> register
//!                  (bounded by setup timeout)     │
//!                                                  └─ failed: registered Bad
//! activate all (or `parallel`) ──> LOGLEVEL + GROUPVIEW ──> session valid
//! ```

pub mod broadcast;
pub mod collect;
pub mod player;
pub mod registry;
pub mod session;

pub use broadcast::Broadcaster;
pub use collect::{CollectReport, Collector, LogCapture, LogOnly, Reply, ReplyHandler};
pub use player::{
    CoordinatorObserver, JobHandle, JobOutcome, JobSpec, JobStatus, LocalPlayer, NoObserver, Player, RemotePlayer,
};
pub use registry::{Ordinal, WorkerNode, WorkerRegistry, WorkerSet, WorkerStatus};
pub use session::{Counters, Role, Session};

use crate::cache::CacheSynchronizer;
use crate::config::cluster::{parse_cluster_file, WorkerEntry};
use crate::config::{CoordinatorConfig, TimeoutConfig};
use crate::distributed::connection::{handshake, Connection, UrgentSender};
use crate::distributed::monitor::Monitor;
use crate::distributed::protocol::*;
use crate::error::{ProofError, Result};
use crate::package::lock::render_lock_name;
use crate::package::{PackageListing, PackageManager};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token shared with interrupt handles
///
/// A fired token stays fired until `renew` swaps in a fresh one; handles
/// always cancel whichever token is current.
#[derive(Debug, Clone, Default)]
pub struct CancelSlot(Arc<Mutex<CancellationToken>>);

impl CancelSlot {
    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> CancellationToken {
        self.lock().clone()
    }

    pub fn cancel(&self) {
        self.lock().cancel();
    }

    /// Replace the token if it has fired
    pub fn renew(&self) {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

/// Renews the cancel slot when an operation ends
#[must_use]
struct CancelScope(CancelSlot);

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.0.renew();
    }
}

/// Registry, monitor and session of one coordinator
pub struct Cluster {
    pub registry: WorkerRegistry,
    pub monitor: Monitor,
    pub session: Session,
    pub timeouts: TimeoutConfig,
    cancel: CancelSlot,
}

impl Cluster {
    pub fn new(session: Session, timeouts: TimeoutConfig) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            monitor: Monitor::new(),
            session,
            timeouts,
            cancel: CancelSlot::default(),
        }
    }

    pub fn broadcaster(&mut self) -> Broadcaster<'_> {
        Broadcaster::new(&mut self.registry, self.cancel.current())
    }

    pub fn collector(&mut self) -> Collector<'_> {
        Collector::new(
            &mut self.registry,
            &mut self.monitor,
            &mut self.session,
            self.cancel.current(),
        )
    }

    /// Broadcaster that ignores the session token (used to finish a
    /// transfer already under way)
    pub(crate) fn uncancellable_broadcaster(&mut self) -> Broadcaster<'_> {
        Broadcaster::new(&mut self.registry, CancellationToken::new())
    }

    /// Collector that ignores the session token (used while winding down a
    /// cancelled job)
    pub(crate) fn uncancellable_collector(&mut self) -> Collector<'_> {
        Collector::new(
            &mut self.registry,
            &mut self.monitor,
            &mut self.session,
            CancellationToken::new(),
        )
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.current()
    }

    pub fn cancel_slot(&self) -> CancelSlot {
        self.cancel.clone()
    }

    /// Replace a fired token so later calls are not cancelled
    pub fn reset_cancel(&mut self) {
        self.cancel.renew();
    }

    /// Handshake a worker stream and register it
    ///
    /// Returns the negotiated protocol version. Host identity comes from the
    /// worker's own description, falling back to the configured host; a
    /// configured performance index overrides the reported one.
    pub async fn attach<S>(&mut self, ordinal: Ordinal, entry: &WorkerEntry, stream: S) -> Result<u32>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let timeout = self.timeouts.setup;
        self.attach_within(ordinal, entry, stream, timeout).await
    }

    /// `attach` with the handshake bounded by `timeout`
    pub async fn attach_within<S>(
        &mut self,
        ordinal: Ordinal,
        entry: &WorkerEntry,
        mut stream: S,
        timeout: Duration,
    ) -> Result<u32>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let hello = handshake(&mut stream, ordinal, timeout).await?;
        let negotiated = negotiate_version(PROTOCOL_VERSION, hello.protocol_version).ok_or(
            ProofError::ProtocolUnsupported {
                client: PROTOCOL_VERSION,
                worker: hello.protocol_version,
                negotiated: PROTOCOL_VERSION.min(hello.protocol_version),
                minimum: MIN_PROTOCOL_VERSION,
            },
        )?;

        let info = hello.info;
        let host = info
            .as_ref()
            .map(|i| i.host.clone())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| entry.host.clone());
        let perf_index = entry
            .perf_index
            .or(info.as_ref().map(|i| i.perf_index))
            .unwrap_or(100);

        let conn = Connection::spawn(ordinal, stream, self.monitor.sender(), self.timeouts.send);
        tracing::info!(worker = ordinal, host = %host, perf_index, protocol = negotiated, "worker attached");
        self.registry
            .register(WorkerNode::new(ordinal, host, perf_index, negotiated, conn));
        self.session.adopt_protocol(negotiated);
        Ok(negotiated)
    }

    /// Keep a worker that never attached visible in All, as Bad
    pub fn register_failed(&mut self, ordinal: Ordinal, entry: &WorkerEntry, reason: &str) {
        tracing::warn!(worker = ordinal, address = %entry.address(), reason, "worker did not attach");
        let node = WorkerNode::new(
            ordinal,
            entry.host.clone(),
            entry.perf_index.unwrap_or(0),
            0,
            Connection::closed(ordinal),
        );
        self.registry.register(node);
        self.registry.mark_bad(ordinal);
    }

    /// Broadcast `msg` and gather the replies
    ///
    /// Targets still pending when `timeout` elapses are marked bad. A
    /// cancelled request leaves them as they are.
    pub async fn request(
        &mut self,
        msg: &Message,
        targets: &[Ordinal],
        timeout: Duration,
        handler: &mut dyn ReplyHandler,
    ) -> Result<CollectReport> {
        self.broadcaster().broadcast(msg, targets).await?;
        let report = self.gather(targets, timeout, handler).await;
        if report.cancelled {
            tracing::debug!(pending = ?report.pending, "request cancelled");
            for &ordinal in &report.pending {
                self.monitor.discard(ordinal);
            }
        } else {
            self.mark_pending_bad(&report);
        }
        Ok(report)
    }

    /// Collect in ticks of `timeouts.collect` until done, cancelled or `timeout`
    pub async fn gather(
        &mut self,
        targets: &[Ordinal],
        timeout: Duration,
        handler: &mut dyn ReplyHandler,
    ) -> CollectReport {
        let deadline = Instant::now() + timeout;
        let tick = self.timeouts.collect;
        let mut report = CollectReport::default();
        let mut pending = targets.to_vec();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(tick);
            let next = self.collector().collect(&pending, wait, handler).await;
            report.merge(next);

            if report.is_complete() || report.cancelled || remaining <= tick {
                return report;
            }
            pending = report.pending.clone();
            tracing::debug!(pending = ?pending, "still waiting for replies");
        }
    }

    pub fn mark_pending_bad(&mut self, report: &CollectReport) {
        for &ordinal in &report.pending {
            if self.registry.mark_bad(ordinal) {
                tracing::warn!(worker = ordinal, "no reply within timeout");
            }
            self.monitor.discard(ordinal);
        }
    }
}

/// Urgent-signal handle usable while the coordinator is busy
///
/// Interrupts travel on each worker's urgent path; registry state is only
/// updated by the coordinator's own loop when the effects show up.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    senders: Vec<UrgentSender>,
    cancel: CancelSlot,
}

impl InterruptHandle {
    /// Send `kind` to every worker of the handle; returns the number reached
    pub fn interrupt(&self, kind: InterruptKind) -> usize {
        self.senders
            .iter()
            .filter(|s| match s.send(kind) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(worker = s.ordinal(), error = %e, "interrupt not delivered");
                    false
                }
            })
            .count()
    }

    /// Stop the running collect; pending job workers get a Hard interrupt
    ///
    /// Outside an operation this has no lasting effect: the next one starts
    /// with a fresh token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Output of `exec`
#[derive(Debug, Default, Clone)]
pub struct ExecOutput {
    pub logs: Vec<(Ordinal, String)>,
    pub statuses: BTreeMap<Ordinal, i32>,
}

/// Top-level coordinator
pub struct Coordinator {
    cluster: Cluster,
    cache: CacheSynchronizer,
    packages: PackageManager,
    player: Box<dyn Player>,
    inputs: Vec<NamedObject>,
    outputs: Vec<NamedObject>,
    setup_error: Option<String>,
}

impl Coordinator {
    /// Connect to the workers named in the cluster file
    ///
    /// With a remote master this process is a client and the master is its
    /// only peer. The session is valid only if at least one worker attached
    /// within the setup window; check `is_valid()` / `setup_error()`.
    pub async fn init(config: &CoordinatorConfig) -> Self {
        let role = if is_local_master(&config.session.master) {
            Role::Master
        } else {
            Role::Client
        };
        let mut coordinator = Self::unconnected(config, role);

        let entries = match role {
            Role::Master => match parse_cluster_file(&config.cluster_file(), config.session.port) {
                Ok(cluster) => cluster.workers,
                Err(e) => {
                    coordinator.fail_setup(format!("{:#}", e));
                    return coordinator;
                }
            },
            Role::Client => vec![WorkerEntry::new(config.session.master.clone(), config.session.port)],
        };

        let deadline = Instant::now() + config.timeouts.setup;
        for (index, entry) in entries.iter().enumerate() {
            let ordinal = index as Ordinal;
            let address = entry.address();
            let connected = tokio::time::timeout_at(deadline, TcpStream::connect(&address)).await;
            let result = match connected {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    coordinator
                        .cluster
                        .attach_within(ordinal, entry, stream, remaining)
                        .await
                        .map(|_| ())
                }
                Ok(Err(e)) => Err(ProofError::worker(ordinal, format!("connect to {} failed: {}", address, e))),
                Err(_) => Err(ProofError::worker(ordinal, "setup window elapsed")),
            };
            if let Err(e) = result {
                coordinator.attach_failed(ordinal, entry, e);
            }
        }

        coordinator.finish_setup(config.session.parallel).await;
        coordinator
    }

    /// Build a session over already-open worker streams
    pub async fn with_streams<S>(config: &CoordinatorConfig, workers: Vec<(WorkerEntry, S)>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut coordinator = Self::unconnected(config, Role::Master);
        let deadline = Instant::now() + config.timeouts.setup;
        for (index, (entry, stream)) in workers.into_iter().enumerate() {
            let ordinal = index as Ordinal;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = coordinator.cluster.attach_within(ordinal, &entry, stream, remaining).await {
                coordinator.attach_failed(ordinal, &entry, e);
            }
        }
        coordinator.finish_setup(config.session.parallel).await;
        coordinator
    }

    fn unconnected(config: &CoordinatorConfig, role: Role) -> Self {
        let mut session = Session::new(config.session.master.clone(), role);
        session.port = config.session.port;
        session.conf_file = config.session.conf_file.clone();
        session.conf_dir = config.session.conf_dir.clone();
        session.work_dir = config.work_dir();
        session.log_level = config.session.log_level;
        session.log_mask = config.session.log_mask;

        let lock_dir = config.lock_dir();
        let cache_lock = lock_dir.join(render_lock_name(&config.locks.cache_template, &session.user, ""));
        let cache = CacheSynchronizer::new(config.cache.fingerprint_mode)
            .with_chunk_size(config.cache.chunk_size)
            .with_lock_path(cache_lock);
        let packages = PackageManager::new(
            config.package_dir(),
            lock_dir,
            config.locks.package_template.clone(),
            session.user.clone(),
        );

        Self {
            cluster: Cluster::new(session, config.timeouts.clone()),
            cache,
            packages,
            player: Box::new(RemotePlayer::new()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            setup_error: None,
        }
    }

    /// Replace the job execution strategy
    pub fn with_player(mut self, player: Box<dyn Player>) -> Self {
        self.player = player;
        self
    }

    /// Replace the package manager (custom builder or directories)
    pub fn with_packages(mut self, packages: PackageManager) -> Self {
        self.packages = packages;
        self
    }

    fn attach_failed(&mut self, ordinal: Ordinal, entry: &WorkerEntry, error: ProofError) {
        if matches!(error, ProofError::ProtocolUnsupported { .. }) && self.setup_error.is_none() {
            self.setup_error = Some(error.to_string());
        }
        self.cluster.register_failed(ordinal, entry, &error.to_string());
    }

    fn fail_setup(&mut self, reason: String) {
        tracing::warn!(reason = %reason, "session setup failed");
        self.setup_error = Some(reason);
        self.cluster.session.valid = false;
    }

    async fn finish_setup(&mut self, parallel: Option<usize>) {
        if let Some(reason) = self.setup_error.clone() {
            self.fail_setup(reason);
            self.cluster.registry.close_all();
            return;
        }

        for ordinal in self.cluster.registry.select_set(WorkerSet::All) {
            self.cluster.registry.activate(ordinal);
        }
        if let Some(n) = parallel {
            self.cluster.registry.set_parallelism(n);
        }

        if self.cluster.registry.active_count() == 0 {
            self.fail_setup(ProofError::NoWorkers.to_string());
            return;
        }

        self.cluster.session.valid = true;
        if let Err(e) = self.send_initial_state().await {
            tracing::warn!(error = %e, "failed to send initial state");
        }
        tracing::info!(
            master = %self.cluster.session.master,
            workers = self.cluster.registry.len(),
            active = self.cluster.registry.active_count(),
            bad = self.cluster.registry.bad_count(),
            protocol = self.cluster.session.protocol,
            "session ready"
        );
    }

    /// Check the session and start the operation with an unfired token
    fn begin(&self) -> Result<CancelScope> {
        if !self.cluster.session.valid {
            return Err(ProofError::InvalidSession);
        }
        let slot = self.cluster.cancel_slot();
        slot.renew();
        Ok(CancelScope(slot))
    }

    fn active(&self) -> Vec<Ordinal> {
        self.cluster.registry.select_set(WorkerSet::Active)
    }

    /// Why the session is not valid, if it is not
    pub fn setup_error(&self) -> Option<&str> {
        self.setup_error.as_deref()
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut Cluster {
        &mut self.cluster
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.cluster.registry
    }

    pub fn session(&self) -> &Session {
        &self.cluster.session
    }

    /// Log level and group view for every Active worker
    pub async fn send_initial_state(&mut self) -> Result<()> {
        let active = self.active();
        self.send_log_level(&active).await?;
        self.send_group_view().await
    }

    /// Group view for every Active worker (after Active changed)
    pub async fn send_current_state(&mut self) -> Result<()> {
        self.send_group_view().await
    }

    async fn send_log_level(&mut self, targets: &[Ordinal]) -> Result<usize> {
        let msg = Message::LogLevel(LogLevelMessage {
            level: self.cluster.session.log_level,
            mask: self.cluster.session.log_mask,
        });
        self.cluster.broadcaster().broadcast(&msg, targets).await
    }

    async fn send_group_view(&mut self) -> Result<()> {
        let active = self.active();
        let size = active.len() as u32;
        for (rank, ordinal) in active.into_iter().enumerate() {
            let msg = Message::GroupView(GroupViewMessage {
                rank: rank as u32,
                size,
            });
            self.cluster.broadcaster().broadcast(&msg, &[ordinal]).await?;
        }
        Ok(())
    }

    /// Resize Active to `n` workers; returns the achieved count
    pub async fn set_parallel(&mut self, n: usize) -> Result<usize> {
        let _scope = self.begin()?;
        let before = self.active();
        let achieved = self.cluster.registry.set_parallelism(n);
        if achieved < n {
            tracing::warn!(requested = n, achieved, "not enough usable workers");
        }

        let newly: Vec<Ordinal> = self.active().into_iter().filter(|o| !before.contains(o)).collect();
        if !newly.is_empty() {
            self.send_log_level(&newly).await?;
        }
        self.send_current_state().await?;
        tracing::info!(parallel = achieved, "parallelism set");
        Ok(achieved)
    }

    /// Run a job on the Active workers
    pub async fn process(&mut self, spec: &JobSpec, observer: &mut dyn CoordinatorObserver) -> Result<JobOutcome> {
        let _scope = self.begin()?;
        let targets = self.active();
        self.cluster.session.counters.reset();
        if targets.is_empty() && self.player.needs_workers() {
            tracing::warn!("no active workers, job not submitted");
            return Ok(JobOutcome {
                status: JobStatus::TotalFailure,
                succeeded: Default::default(),
                failed: Default::default(),
                statuses: Default::default(),
                outputs: Vec::new(),
                cancelled: false,
                elapsed: Duration::ZERO,
            });
        }

        let job = spec.to_message(self.inputs.clone());
        let handle = self.player.submit(&mut self.cluster, job, &targets).await?;
        let outcome = self.player.collect_results(&mut self.cluster, handle, observer).await?;

        for object in &outcome.outputs {
            player::merge_output(&mut self.outputs, object.clone());
        }
        Ok(outcome)
    }

    /// Deliver an urgent signal to `which`; returns the number of workers reached
    ///
    /// Shutdown also tears the connection down and marks the worker bad.
    pub async fn interrupt(&mut self, kind: InterruptKind, which: WorkerSet) -> Result<usize> {
        let _scope = self.begin()?;
        let grace = self.cluster.timeouts.grace;
        let mut reached = 0;

        for ordinal in self.cluster.registry.select_set(which) {
            if !self.cluster.registry.is_usable(ordinal) {
                continue;
            }
            let sent = match self.cluster.registry.connection(ordinal) {
                Some(conn) => conn.send_urgent(kind),
                None => continue,
            };
            match sent {
                Ok(()) => reached += 1,
                Err(e) => {
                    tracing::warn!(worker = ordinal, error = %e, "interrupt failed");
                    self.cluster.registry.mark_bad(ordinal);
                    continue;
                }
            }

            if kind == InterruptKind::Shutdown {
                if let Some(node) = self.cluster.registry.node_mut(ordinal) {
                    node.conn.shutdown(grace).await;
                }
                self.cluster.registry.mark_bad(ordinal);
                self.cluster.monitor.discard(ordinal);
            }
        }

        tracing::info!(?kind, reached, "interrupt sent");
        Ok(reached)
    }

    /// Handle for interrupting Active workers from another task
    pub fn interrupt_handle(&self) -> InterruptHandle {
        let senders = self
            .active()
            .into_iter()
            .filter_map(|o| self.cluster.registry.connection(o).and_then(Connection::urgent_sender))
            .collect();
        InterruptHandle {
            senders,
            cancel: self.cluster.cancel_slot(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cluster.cancel_token()
    }

    /// Soft (finish current unit) or Hard (abandon) stop of the Active workers
    pub async fn stop_process(&mut self, abort: bool) -> Result<usize> {
        let kind = if abort { InterruptKind::Hard } else { InterruptKind::Soft };
        self.interrupt(kind, WorkerSet::Active).await
    }

    /// Liveness check; returns the number of workers that answered
    pub async fn ping(&mut self, which: WorkerSet) -> Result<usize> {
        let _scope = self.begin()?;
        let targets = self.cluster.registry.select_set(which);
        let timeout = self.cluster.timeouts.ping;
        let report = self
            .cluster
            .request(&Message::Ping, &targets, timeout, &mut LogOnly)
            .await?;
        Ok(report.statuses.len())
    }

    /// Run a shell command line on every Active worker
    pub async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let _scope = self.begin()?;
        let targets = self.active();
        let mut capture = LogCapture::default();
        let timeout = self.cluster.timeouts.request;
        let report = self
            .cluster
            .request(&Message::command(CommandKind::Exec, command), &targets, timeout, &mut capture)
            .await?;
        Ok(ExecOutput {
            logs: capture.chunks,
            statuses: report.statuses,
        })
    }

    /// Self-description of every worker
    ///
    /// Usable workers are asked; bad ones are reported from the registry.
    pub async fn worker_info(&mut self) -> Result<Vec<WorkerInfoMessage>> {
        let _scope = self.begin()?;
        let targets: Vec<Ordinal> = self
            .cluster
            .registry
            .select_set(WorkerSet::All)
            .into_iter()
            .filter(|&o| self.cluster.registry.is_usable(o))
            .collect();

        let mut replies = InfoReplies::default();
        let timeout = self.cluster.timeouts.request;
        self.cluster
            .request(&Message::GetWorkerInfo, &targets, timeout, &mut replies)
            .await?;

        Ok(self
            .cluster
            .registry
            .nodes()
            .map(|node| match replies.infos.remove(&node.ordinal) {
                Some(reported) => WorkerInfoMessage {
                    ordinal: node.ordinal,
                    status: node.status.into(),
                    ..reported
                },
                None => node.info(),
            })
            .collect())
    }

    pub async fn set_log_level(&mut self, level: i32, mask: u32) -> Result<usize> {
        let _scope = self.begin()?;
        self.cluster.session.log_level = level;
        self.cluster.session.log_mask = mask;
        let targets = self.active();
        self.send_log_level(&targets).await
    }

    pub fn log_level(&self) -> i32 {
        self.cluster.session.log_level
    }

    /// Objects shipped with every following job
    pub fn add_input(&mut self, object: NamedObject) {
        self.inputs.push(object);
    }

    pub fn clear_input(&mut self) {
        self.inputs.clear();
    }

    pub fn inputs(&self) -> &[NamedObject] {
        &self.inputs
    }

    pub fn output(&self, name: &str) -> Option<&NamedObject> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn output_list(&self) -> &[NamedObject] {
        &self.outputs
    }

    /// Log a session summary; with `workers`, Active workers print theirs
    pub async fn print(&mut self, workers: bool) -> Result<()> {
        let session = &self.cluster.session;
        let registry = &self.cluster.registry;
        tracing::info!(
            master = %session.master,
            user = %session.user,
            role = ?session.role,
            valid = session.valid,
            protocol = session.protocol,
            log_level = session.log_level,
            workers = registry.len(),
            active = registry.active_count(),
            unique = registry.unique_count(),
            bad = registry.bad_count(),
            bytes_read = session.counters.bytes_read(),
            real_time = session.counters.real_time(),
            cpu_time = session.counters.cpu_time(),
            started = %session.started_at.to_rfc3339(),
            "session"
        );
        if workers {
            let _scope = self.begin()?;
            let targets = self.active();
            let timeout = self.cluster.timeouts.request;
            self.cluster
                .request(&Message::command(CommandKind::Print, ""), &targets, timeout, &mut LogOnly)
                .await?;
        }
        Ok(())
    }

    /// Push `path` to every Unique worker lacking a current copy
    ///
    /// Returns the number of transfers.
    pub async fn send_file(&mut self, path: &Path, binary: bool) -> Result<usize> {
        let _scope = self.begin()?;
        self.cache.sync_file(&mut self.cluster, path, binary).await
    }

    pub async fn show_cache(&mut self, all: bool) -> Result<Vec<(Ordinal, String)>> {
        let _scope = self.begin()?;
        self.cache.show_cache(&mut self.cluster, all).await
    }

    pub async fn clear_cache(&mut self) -> Result<usize> {
        let _scope = self.begin()?;
        self.cache.clear_cache(&mut self.cluster).await
    }

    /// Copy a package archive into the package directory; returns its name
    pub fn upload_package(&mut self, path: &Path) -> Result<String> {
        let _scope = self.begin()?;
        self.packages.upload_package(path)
    }

    /// Build, distribute and enable a package on the Active workers
    pub async fn enable_package(&mut self, name: &str) -> Result<usize> {
        let _scope = self.begin()?;
        let targets = self.active();
        self.packages
            .enable_package(&mut self.cluster, &mut self.cache, name, &targets)
            .await
    }

    pub async fn show_packages(&mut self, all: bool) -> Result<PackageListing> {
        let _scope = self.begin()?;
        self.packages.show_packages(&mut self.cluster, all).await
    }

    pub async fn show_enabled_packages(&mut self, all: bool) -> Result<PackageListing> {
        let _scope = self.begin()?;
        self.packages.show_enabled_packages(&mut self.cluster, all).await
    }

    pub async fn clear_package(&mut self, name: &str) -> Result<()> {
        let _scope = self.begin()?;
        self.packages
            .clear_package(&mut self.cluster, &mut self.cache, name)
            .await
    }

    pub async fn clear_packages(&mut self) -> Result<()> {
        let _scope = self.begin()?;
        self.packages.clear_packages(&mut self.cluster, &mut self.cache).await
    }

    /// Stop every reachable worker and end the session
    pub async fn close(&mut self) {
        if self.cluster.session.valid {
            let all = self.cluster.registry.select_set(WorkerSet::All);
            if let Err(e) = self.cluster.broadcaster().broadcast(&Message::Stop, &all).await {
                tracing::debug!(error = %e, "stop broadcast failed");
            }
        }
        self.cluster.registry.close_all();
        self.cluster.monitor.deactivate_all();
        self.cache.clear();
        self.cluster.session.valid = false;
        tracing::info!("session closed");
    }

    pub fn master(&self) -> &str {
        &self.cluster.session.master
    }

    pub fn conf_dir(&self) -> &Path {
        &self.cluster.session.conf_dir
    }

    pub fn conf_file(&self) -> &str {
        &self.cluster.session.conf_file
    }

    pub fn work_dir(&self) -> &Path {
        &self.cluster.session.work_dir
    }

    pub fn package_dir(&self) -> &Path {
        self.packages.package_dir()
    }

    pub fn user(&self) -> &str {
        &self.cluster.session.user
    }

    pub fn port(&self) -> u16 {
        self.cluster.session.port
    }

    /// Negotiated protocol (lowest over all attached workers)
    pub fn remote_protocol(&self) -> u32 {
        self.cluster.session.protocol
    }

    pub fn client_protocol(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Status of the last completed request
    pub fn status(&self) -> i32 {
        self.cluster.session.status
    }

    pub fn parallel(&self) -> usize {
        self.cluster.registry.active_count()
    }

    pub fn bytes_read(&self) -> u64 {
        self.cluster.session.counters.bytes_read()
    }

    pub fn real_time(&self) -> f64 {
        self.cluster.session.counters.real_time()
    }

    pub fn cpu_time(&self) -> f64 {
        self.cluster.session.counters.cpu_time()
    }

    pub fn is_master(&self) -> bool {
        self.cluster.session.is_master()
    }

    pub fn is_valid(&self) -> bool {
        self.cluster.session.valid
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel() > 0
    }
}

/// Collects GETWORKERINFO replies
#[derive(Default)]
struct InfoReplies {
    infos: BTreeMap<Ordinal, WorkerInfoMessage>,
}

impl ReplyHandler for InfoReplies {
    fn on_reply(&mut self, ordinal: Ordinal, msg: Message) -> Reply {
        match msg {
            Message::WorkerInfo(info) => {
                self.infos.insert(ordinal, info);
                Reply::Finished
            }
            _ => Reply::Unexpected,
        }
    }
}

/// True when `master` names this machine
fn is_local_master(master: &str) -> bool {
    let host = master.rsplit_once(':').map_or(master, |(h, _)| h);
    matches!(host, "" | "localhost" | "127.0.0.1" | "::1")
        || host == crate::distributed::worker_service::local_host()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::testing::{test_coordinator, test_coordinator_with, Behavior, TestCluster};
    use crate::job::CountingRunner;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cancel_after(handle: InterruptHandle, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.cancel();
        });
    }

    #[test]
    fn test_local_master_detection() {
        assert!(is_local_master("localhost"));
        assert!(is_local_master("127.0.0.1:1093"));
        assert!(!is_local_master("remote.example.org"));
    }

    #[tokio::test]
    async fn test_gather_ticks_until_timeout() {
        let mut tc = TestCluster::with_behaviors(&[("A", Behavior::Silent)]).await;
        tc.cluster.timeouts.collect = Duration::from_millis(20);

        let start = std::time::Instant::now();
        let report = tc
            .cluster
            .request(&Message::Ping, &[0], Duration::from_millis(100), &mut LogOnly)
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(90));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(report.pending, vec![0]);
        assert!(tc.cluster.registry.is_bad(0));
    }

    #[tokio::test]
    async fn test_attach_rejects_old_protocol() {
        let tc = TestCluster::with_behaviors(&[("A", Behavior::Normal), ("B", Behavior::OldProtocol(1))]).await;
        assert_eq!(tc.cluster.registry.len(), 2);
        assert!(tc.cluster.registry.is_bad(1));
        assert!(!tc.cluster.registry.is_bad(0));
    }

    #[tokio::test]
    async fn test_protocol_negotiates_down() {
        let tc = TestCluster::with_behaviors(&[("A", Behavior::Normal), ("B", Behavior::OldProtocol(2))]).await;
        assert_eq!(tc.cluster.session.protocol, 2);
        assert_eq!(tc.cluster.registry.node(0).map(|n| n.protocol), Some(PROTOCOL_VERSION));
        assert_eq!(tc.cluster.registry.node(1).map(|n| n.protocol), Some(2));
    }

    #[tokio::test]
    async fn test_session_setup_and_accessors() {
        let (coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Normal)]).await;

        assert!(coordinator.is_valid());
        assert!(coordinator.is_master());
        assert!(coordinator.is_parallel());
        assert_eq!(coordinator.parallel(), 2);
        assert_eq!(coordinator.port(), 1093);
        assert_eq!(coordinator.client_protocol(), PROTOCOL_VERSION);
        assert_eq!(coordinator.remote_protocol(), PROTOCOL_VERSION);
        assert!(coordinator.setup_error().is_none());
    }

    #[tokio::test]
    async fn test_no_workers_invalidates_session() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::DieBeforeHello)]).await;

        assert!(!coordinator.is_valid());
        assert!(coordinator.setup_error().is_some());
        assert!(matches!(coordinator.ping(WorkerSet::All).await, Err(ProofError::InvalidSession)));
        assert!(matches!(
            coordinator.process(&JobSpec::new("ds", "count"), &mut NoObserver).await,
            Err(ProofError::InvalidSession)
        ));
        assert!(matches!(coordinator.set_parallel(1).await, Err(ProofError::InvalidSession)));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_invalidates_session() {
        let (coordinator, _tc) = test_coordinator(&[("A", Behavior::OldProtocol(1))]).await;
        assert!(!coordinator.is_valid());
        assert!(coordinator.setup_error().is_some_and(|e| e.contains("unsupported")));
    }

    #[tokio::test]
    async fn test_ping_marks_silent_worker_bad() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Silent)]).await;
        coordinator.cluster_mut().timeouts.ping = Duration::from_millis(200);

        assert_eq!(coordinator.ping(WorkerSet::Active).await.unwrap(), 1);
        assert_eq!(coordinator.registry().select_set(WorkerSet::Bad), vec![1]);
        assert_eq!(coordinator.parallel(), 1);
        assert!(coordinator.registry().invariants_hold());
    }

    #[tokio::test]
    async fn test_process_success_and_outputs() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Normal)]).await;
        coordinator.add_input(NamedObject::new("cuts", b"pt > 10".to_vec()));

        let spec = JobSpec {
            entries: 20,
            ..JobSpec::new("ds", "count")
        };
        let outcome = coordinator.process(&spec, &mut NoObserver).await.unwrap();

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(coordinator.bytes_read(), 2 * 20 * 1024);
        assert_eq!(coordinator.status(), 0);
        assert!(coordinator.output("entries").is_some());
        assert_eq!(coordinator.output_list().len(), 1);
    }

    #[tokio::test]
    async fn test_process_survives_dead_worker() {
        let (mut coordinator, _tc) =
            test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Normal), ("C", Behavior::DieAfterHello)]).await;

        let spec = JobSpec {
            entries: 5,
            ..JobSpec::new("ds", "count")
        };
        // C is dropped either while sending the initial state or during the job
        let outcome = coordinator.process(&spec, &mut NoObserver).await.unwrap();
        assert!(matches!(
            outcome.status,
            JobStatus::Success | JobStatus::PartialFailure { failed: 1 }
        ));
        assert_eq!(outcome.succeeded.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(coordinator.parallel(), 2);
        assert!(coordinator.registry().is_bad(2));
    }

    #[tokio::test]
    async fn test_set_parallel_resends_state() {
        let (mut coordinator, _tc) =
            test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Normal), ("C", Behavior::Normal)]).await;

        assert_eq!(coordinator.set_parallel(1).await.unwrap(), 1);
        assert_eq!(coordinator.registry().select_set(WorkerSet::Active).len(), 1);
        assert_eq!(coordinator.set_parallel(5).await.unwrap(), 3);
        assert!(coordinator.registry().invariants_hold());

        // Newly activated workers still answer normally
        assert_eq!(coordinator.ping(WorkerSet::Active).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exec_and_worker_info() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::DieBeforeHello)]).await;

        let out = coordinator.exec("echo ready").await.unwrap();
        assert_eq!(out.statuses.get(&0), Some(&0));
        assert!(out.logs.iter().any(|(o, line)| *o == 0 && line.contains("ready")));

        let infos = coordinator.worker_info().await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].host, "A");
        assert_eq!(infos[0].status, WorkerState::Active);
        assert_eq!(infos[1].status, WorkerState::Bad);
    }

    #[tokio::test]
    async fn test_shutdown_interrupt_marks_bad() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Normal)]).await;

        let reached = coordinator.interrupt(InterruptKind::Shutdown, WorkerSet::Active).await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(coordinator.registry().bad_count(), 2);
        let outcome = coordinator.process(&JobSpec::new("ds", "count"), &mut NoObserver).await.unwrap();
        assert_eq!(outcome.status, JobStatus::TotalFailure);
    }

    #[tokio::test]
    async fn test_interrupt_handle_stops_running_job() {
        let (mut coordinator, _tc) =
            test_coordinator(&[("A", Behavior::Slow(Duration::from_millis(10)))]).await;
        coordinator.cluster_mut().timeouts.collect = Duration::from_millis(50);
        let handle = coordinator.interrupt_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.interrupt(InterruptKind::Soft);
        });

        let spec = JobSpec {
            entries: 100_000,
            ..JobSpec::new("ds", "count")
        };
        let outcome = coordinator.process(&spec, &mut NoObserver).await.unwrap();

        // Soft stop finishes cleanly
        assert_eq!(outcome.status, JobStatus::Success);
        assert!(!outcome.cancelled);
        assert!(coordinator.bytes_read() < 100_000 * 1024);
    }

    #[tokio::test]
    async fn test_cancelled_job_resets_token() {
        let (mut coordinator, _tc) =
            test_coordinator(&[("A", Behavior::Slow(Duration::from_millis(10)))]).await;
        coordinator.cluster_mut().timeouts.collect = Duration::from_millis(50);
        let handle = coordinator.interrupt_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let spec = JobSpec {
            entries: 100_000,
            ..JobSpec::new("ds", "count")
        };
        let outcome = coordinator.process(&spec, &mut NoObserver).await.unwrap();
        assert!(outcome.cancelled);
        assert!(!coordinator.cancellation_token().is_cancelled());
        assert_eq!(coordinator.ping(WorkerSet::Active).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_file_and_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.so");
        std::fs::write(&path, b"payload").unwrap();
        let (mut coordinator, _tc) =
            test_coordinator(&[("A", Behavior::Normal), ("A", Behavior::Normal), ("B", Behavior::Normal)]).await;

        assert_eq!(coordinator.send_file(&path, true).await.unwrap(), 2);
        assert_eq!(coordinator.send_file(&path, true).await.unwrap(), 0);

        coordinator.close().await;
        assert!(!coordinator.is_valid());
        assert!(matches!(coordinator.send_file(&path, true).await, Err(ProofError::InvalidSession)));
    }

    #[tokio::test]
    async fn test_log_level_round_trip() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal)]).await;
        assert_eq!(coordinator.set_log_level(3, 0xff).await.unwrap(), 1);
        assert_eq!(coordinator.log_level(), 3);
        coordinator.print(true).await.unwrap();
        assert_eq!(coordinator.status(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_idle_does_not_poison_session() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Normal)]).await;
        coordinator.interrupt_handle().cancel();

        assert_eq!(coordinator.ping(WorkerSet::All).await.unwrap(), 2);
        assert_eq!(coordinator.registry().bad_count(), 0);
        assert_eq!(coordinator.parallel(), 2);
        for _ in 0..2 {
            let outcome = coordinator.process(&JobSpec::new("ds", "count"), &mut NoObserver).await.unwrap();
            assert_eq!(outcome.status, JobStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_cancelled_ping_leaves_workers_usable() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Silent)]).await;
        coordinator.cluster_mut().timeouts.ping = Duration::from_secs(30);
        coordinator.cluster_mut().timeouts.collect = Duration::from_millis(50);
        cancel_after(coordinator.interrupt_handle(), Duration::from_millis(300));

        let started = std::time::Instant::now();
        let answered = coordinator.ping(WorkerSet::All).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(answered, 1);
        assert!(!coordinator.registry().is_bad(1));
        assert_eq!(coordinator.parallel(), 2);
        assert!(!coordinator.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_exec_then_exec_again() {
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Silent)]).await;
        coordinator.cluster_mut().timeouts.request = Duration::from_secs(30);
        coordinator.cluster_mut().timeouts.collect = Duration::from_millis(50);
        cancel_after(coordinator.interrupt_handle(), Duration::from_millis(300));

        let out = coordinator.exec("echo first").await.unwrap();
        assert_eq!(out.statuses.get(&0), Some(&0));
        assert!(!out.statuses.contains_key(&1));
        assert_eq!(coordinator.registry().bad_count(), 0);

        // Without a cancel the silent worker times out and goes bad
        coordinator.cluster_mut().timeouts.request = Duration::from_millis(200);
        let out = coordinator.exec("echo second").await.unwrap();
        assert_eq!(out.statuses.get(&0), Some(&0));
        assert!(coordinator.registry().is_bad(1));
        assert!(!coordinator.registry().is_bad(0));
    }

    #[tokio::test]
    async fn test_cancelled_send_file_keeps_workers_and_retries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.so");
        std::fs::write(&path, b"payload").unwrap();
        let (mut coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal), ("B", Behavior::Silent)]).await;
        coordinator.cluster_mut().timeouts.request = Duration::from_secs(30);
        coordinator.cluster_mut().timeouts.collect = Duration::from_millis(50);
        cancel_after(coordinator.interrupt_handle(), Duration::from_millis(300));

        let started = std::time::Instant::now();
        assert!(matches!(coordinator.send_file(&path, true).await, Err(ProofError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(coordinator.registry().bad_count(), 0);
        assert!(!coordinator.cancellation_token().is_cancelled());

        // A has its copy; B is still waited on and times out this time
        coordinator.cluster_mut().timeouts.request = Duration::from_millis(200);
        assert_eq!(coordinator.send_file(&path, true).await.unwrap(), 0);
        assert!(coordinator.registry().is_bad(1));
        assert!(!coordinator.registry().is_bad(0));
    }

    #[tokio::test]
    async fn test_silent_handshakes_share_one_setup_window() {
        let started = std::time::Instant::now();
        let (coordinator, _tc) = test_coordinator_with(
            &[("A", Behavior::MuteAtHello), ("B", Behavior::MuteAtHello)],
            |config| config.timeouts.setup = Duration::from_millis(300),
        )
        .await;

        assert!(started.elapsed() < Duration::from_millis(550));
        assert!(!coordinator.is_valid());
        assert_eq!(coordinator.registry().bad_count(), 2);
    }

    #[tokio::test]
    async fn test_local_player_runs_without_active_workers() {
        let (coordinator, _tc) = test_coordinator(&[("A", Behavior::Normal)]).await;
        let mut coordinator = coordinator.with_player(Box::new(LocalPlayer::new(Arc::new(CountingRunner::default()))));
        coordinator.interrupt(InterruptKind::Shutdown, WorkerSet::Active).await.unwrap();
        assert_eq!(coordinator.parallel(), 0);

        let spec = JobSpec {
            entries: 20,
            ..JobSpec::new("ds", "count")
        };
        let outcome = coordinator.process(&spec, &mut NoObserver).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(coordinator.bytes_read(), 20 * 1024);
    }
}
