//! In-process worker fixtures for tests
//!
//! Workers run `WorkerService` on one end of a duplex pipe; the master end is
//! attached to a `Cluster` the same way a TCP stream would be. Workers that
//! share a host name share their directories, like nodes on one filesystem.

use crate::config::cluster::WorkerEntry;
use crate::config::{CoordinatorConfig, TimeoutConfig};
use crate::coordinator::{Cluster, Coordinator, Role, Session};
use crate::distributed::protocol::*;
use crate::distributed::worker_service::{WorkerOptions, WorkerService};
use crate::job::CountingRunner;
use crate::package::PackageBuilder;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

/// Builder that just creates the package directory
#[derive(Debug, Default)]
pub struct NoopBuilder;

impl PackageBuilder for NoopBuilder {
    fn build(&self, package_dir: &Path, _archive: Option<&Path>, name: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(package_dir.join(name))?;
        Ok(())
    }
}

pub fn worker_options(host: &str, base: &Path) -> WorkerOptions {
    WorkerOptions {
        host: host.to_string(),
        perf_index: 100,
        cache_dir: base.join("cache"),
        package_dir: base.join("packages"),
        lock_dir: base.join("locks"),
        package_lock_template: "proof-package-lock-{user}-{package}".to_string(),
        user: "tester".to_string(),
    }
}

/// How a fixture worker behaves
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Normal,
    /// Closes the pipe before the handshake
    DieBeforeHello,
    /// Answers the handshake, then closes the pipe
    DieAfterHello,
    /// Answers the handshake, then never replies to anything
    Silent,
    /// Reads the handshake and never answers it
    MuteAtHello,
    /// Real worker speaking an older protocol
    OldProtocol(u32),
    /// Real worker whose jobs sleep between entries
    Slow(Duration),
}

/// Worker tasks and their directories
pub struct TestWorkers {
    handles: Vec<Option<JoinHandle<()>>>,
    _dirs: HashMap<String, TempDir>,
    /// Master-side scratch (work dir, locks)
    pub master_dir: TempDir,
}

impl TestWorkers {
    /// Abort worker `ordinal`, dropping its end of the pipe
    pub fn kill(&mut self, ordinal: usize) {
        if let Some(handle) = self.handles.get_mut(ordinal).and_then(Option::take) {
            handle.abort();
        }
    }
}

impl Drop for TestWorkers {
    fn drop(&mut self) {
        for handle in self.handles.iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }
}

/// Spawn one fixture worker per entry and return the master ends
pub fn spawn_workers(specs: &[(&str, Behavior)]) -> (Vec<(WorkerEntry, DuplexStream)>, TestWorkers) {
    let mut dirs: HashMap<String, TempDir> = HashMap::new();
    let mut handles = Vec::new();
    let mut streams = Vec::new();

    for &(host, behavior) in specs {
        let base = dirs
            .entry(host.to_string())
            .or_insert_with(|| TempDir::new().unwrap())
            .path()
            .to_path_buf();
        let (master_end, worker_end) = tokio::io::duplex(256 * 1024);

        let handle = match behavior {
            Behavior::DieBeforeHello => {
                drop(worker_end);
                None
            }
            Behavior::MuteAtHello => Some(tokio::spawn(async move {
                let mut stream = worker_end;
                while read_frame(&mut stream).await.is_ok() {}
            })),
            Behavior::DieAfterHello | Behavior::Silent => {
                let host = host.to_string();
                Some(tokio::spawn(fake_peer(worker_end, host, behavior == Behavior::Silent)))
            }
            Behavior::Normal | Behavior::OldProtocol(_) | Behavior::Slow(_) => {
                let runner = match behavior {
                    Behavior::Slow(delay) => CountingRunner {
                        entry_delay: delay,
                        ..CountingRunner::default()
                    },
                    _ => CountingRunner::default(),
                };
                let mut service = WorkerService::new(worker_options(host, &base), Arc::new(runner))
                    .with_builder(Arc::new(NoopBuilder));
                if let Behavior::OldProtocol(version) = behavior {
                    service = service.with_protocol_version(version);
                }
                Some(tokio::spawn(async move {
                    let _ = service.serve(worker_end).await;
                }))
            }
        };

        handles.push(handle);
        streams.push((WorkerEntry::new(host, DEFAULT_PORT), master_end));
    }

    let workers = TestWorkers {
        handles,
        _dirs: dirs,
        master_dir: TempDir::new().unwrap(),
    };
    (streams, workers)
}

async fn fake_peer(mut stream: DuplexStream, host: String, stay: bool) {
    let hello = match read_frame(&mut stream).await {
        Ok(Frame::Message(Message::Hello(hello))) => hello,
        _ => return,
    };
    let reply = Message::Hello(HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        ordinal: hello.ordinal,
        info: Some(WorkerInfoMessage {
            ordinal: hello.ordinal,
            host,
            perf_index: 100,
            status: WorkerState::NotActive,
        }),
    });
    if write_frame(&mut stream, &reply.into()).await.is_err() || !stay {
        return;
    }
    while read_frame(&mut stream).await.is_ok() {}
}

/// A `Cluster` wired to fixture workers, all Active
pub struct TestCluster {
    pub cluster: Cluster,
    workers: TestWorkers,
}

impl TestCluster {
    pub async fn healthy(hosts: &[&str]) -> Self {
        let specs: Vec<(&str, Behavior)> = hosts.iter().map(|&h| (h, Behavior::Normal)).collect();
        Self::with_behaviors(&specs).await
    }

    pub async fn with_behaviors(specs: &[(&str, Behavior)]) -> Self {
        let (streams, workers) = spawn_workers(specs);
        let mut session = Session::new("localhost", Role::Master);
        session.valid = true;
        let mut cluster = Cluster::new(session, TimeoutConfig::default());

        for (index, (entry, stream)) in streams.into_iter().enumerate() {
            let ordinal = index as u32;
            if let Err(e) = cluster.attach(ordinal, &entry, stream).await {
                cluster.register_failed(ordinal, &entry, &e.to_string());
            }
        }
        for ordinal in cluster.registry.select_set(crate::coordinator::WorkerSet::All) {
            cluster.registry.activate(ordinal);
        }

        Self { cluster, workers }
    }

    pub fn kill(&mut self, ordinal: usize) {
        self.workers.kill(ordinal);
    }
}

/// A `Coordinator` over fixture workers, set up with default settings
pub async fn test_coordinator(specs: &[(&str, Behavior)]) -> (Coordinator, TestWorkers) {
    test_coordinator_with(specs, |_| {}).await
}

/// `test_coordinator` with `tweak` applied to the config before setup
pub async fn test_coordinator_with(
    specs: &[(&str, Behavior)],
    tweak: impl FnOnce(&mut CoordinatorConfig),
) -> (Coordinator, TestWorkers) {
    let (streams, workers) = spawn_workers(specs);
    let mut config = CoordinatorConfig::default();
    config.session.work_dir = workers.master_dir.path().join("work");
    config.locks.dir = Some(workers.master_dir.path().join("locks"));
    config.timeouts.setup = Duration::from_secs(2);
    tweak(&mut config);

    let coordinator = Coordinator::with_streams(&config, streams)
        .await
        .with_packages(
            crate::package::PackageManager::new(
                config.package_dir(),
                config.lock_dir(),
                config.locks.package_template.clone(),
                crate::coordinator::session::current_user(),
            )
            .with_builder(Arc::new(NoopBuilder)),
        );
    (coordinator, workers)
}
