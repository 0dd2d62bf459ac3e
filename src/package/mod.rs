//! Package management
//!
//! A package is a gzipped tar archive `<name>.par` in the package directory.
//! Building unpacks it into `<name>/` and runs `PROOF-INF/BUILD.sh` when the
//! package ships one. A successful build leaves a `.proof-built` marker
//! holding the archive hash, so rebuilding an unchanged package is skipped.
//!
//! ```text
//! Unbuilt --build--> Building --ok--> Built --enable--> Enabled{workers}
//!    ^                  |                                   |
//!    +------ fail ------+------------- clear ---------------+
//! ```
//!
//! Every build and clear holds the package's `PackageLock`; a second caller
//! fails fast with `PackageBusy`.

pub mod lock;

use crate::cache::{hash_file, CacheSynchronizer};
use crate::coordinator::collect::LogCapture;
use crate::coordinator::registry::{Ordinal, WorkerSet};
use crate::coordinator::Cluster;
use crate::distributed::protocol::*;
use crate::error::{ProofError, Result};
use lock::PackageLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Archive extension
pub const PACKAGE_EXT: &str = "par";

/// Marker written into a package directory after a successful build
pub const BUILT_MARKER: &str = ".proof-built";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageState {
    Unbuilt,
    Building,
    Built { fingerprint: String },
    Enabled { fingerprint: String, workers: BTreeSet<Ordinal> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    /// A build with a matching fingerprint already exists
    AlreadyBuilt,
}

/// External build step
pub trait PackageBuilder: Send + Sync {
    /// Turn `archive` into a usable package in `package_dir/<name>`
    fn build(&self, package_dir: &Path, archive: Option<&Path>, name: &str) -> anyhow::Result<()>;
}

/// Unpacks with `tar` and runs the package's build script
#[derive(Debug, Default)]
pub struct ScriptBuilder;

impl PackageBuilder for ScriptBuilder {
    fn build(&self, package_dir: &Path, archive: Option<&Path>, name: &str) -> anyhow::Result<()> {
        use anyhow::Context;
        use std::process::Command;

        let build_dir = package_dir.join(name);
        if let Some(archive) = archive {
            if build_dir.exists() {
                std::fs::remove_dir_all(&build_dir)
                    .with_context(|| format!("Failed to remove stale build of {}", name))?;
            }
            let status = Command::new("tar")
                .arg("-xzf")
                .arg(archive)
                .arg("-C")
                .arg(package_dir)
                .status()
                .context("Failed to run tar")?;
            if !status.success() {
                anyhow::bail!("tar exited with {}", status);
            }
        }

        let script = build_dir.join("PROOF-INF").join("BUILD.sh");
        if script.exists() {
            let output = Command::new("sh")
                .arg(&script)
                .current_dir(&build_dir)
                .output()
                .context("Failed to run BUILD.sh")?;
            if !output.status.success() {
                anyhow::bail!(
                    "BUILD.sh exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        Ok(())
    }
}

/// Remote and local package listings
#[derive(Debug, Default, Clone)]
pub struct PackageListing {
    pub local: Vec<String>,
    pub remote: Vec<(Ordinal, String)>,
}

pub struct PackageManager {
    package_dir: PathBuf,
    lock_dir: PathBuf,
    lock_template: String,
    user: String,
    builder: Arc<dyn PackageBuilder>,
    states: BTreeMap<String, PackageState>,
}

impl PackageManager {
    pub fn new(package_dir: PathBuf, lock_dir: PathBuf, lock_template: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            package_dir,
            lock_dir,
            lock_template: lock_template.into(),
            user: user.into(),
            builder: Arc::new(ScriptBuilder),
            states: BTreeMap::new(),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn PackageBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn package_dir(&self) -> &Path {
        &self.package_dir
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.package_dir.join(format!("{}.{}", name, PACKAGE_EXT))
    }

    pub fn build_dir(&self, name: &str) -> PathBuf {
        self.package_dir.join(name)
    }

    pub fn state(&self, name: &str) -> PackageState {
        self.states.get(name).cloned().unwrap_or(PackageState::Unbuilt)
    }

    fn lock(&self, name: &str) -> Result<PackageLock> {
        PackageLock::try_acquire(&self.lock_dir, &self.lock_template, &self.user, name)
    }

    /// Build `name` unless a matching build already exists
    pub async fn build_package(&mut self, name: &str) -> Result<BuildOutcome> {
        let archive = self.archive_path(name);
        let build_dir = self.build_dir(name);
        let has_archive = archive.exists();
        if !has_archive && !build_dir.exists() {
            return Err(ProofError::PackageNotFound {
                name: name.to_string(),
                dir: self.package_dir.clone(),
            });
        }

        let _lock = self.lock(name)?;

        let fingerprint = if has_archive {
            hash_file(&archive)?
        } else {
            "unpacked".to_string()
        };
        let marker = build_dir.join(BUILT_MARKER);
        if std::fs::read_to_string(&marker).is_ok_and(|m| m.trim() == fingerprint) {
            tracing::debug!(package = name, "already built");
            self.set_built(name, fingerprint);
            return Ok(BuildOutcome::AlreadyBuilt);
        }

        self.states.insert(name.to_string(), PackageState::Building);
        tracing::info!(package = name, "building package");

        let builder = self.builder.clone();
        let package_dir = self.package_dir.clone();
        let archive = has_archive.then_some(archive);
        let owned_name = name.to_string();
        let result = tokio::task::spawn_blocking(move || builder.build(&package_dir, archive.as_deref(), &owned_name)).await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(e) => Some(format!("build task failed: {}", e)),
        };
        if let Some(reason) = failure {
            self.states.insert(name.to_string(), PackageState::Unbuilt);
            return Err(ProofError::PackageBuild {
                name: name.to_string(),
                reason,
            });
        }

        let recorded = std::fs::create_dir_all(&build_dir)
            .map_err(|e| ProofError::io(&build_dir, e))
            .and_then(|()| std::fs::write(&marker, &fingerprint).map_err(|e| ProofError::io(&marker, e)));
        if let Err(e) = recorded {
            self.states.insert(name.to_string(), PackageState::Unbuilt);
            return Err(e);
        }
        self.set_built(name, fingerprint);
        Ok(BuildOutcome::Built)
    }

    fn set_built(&mut self, name: &str, fingerprint: String) {
        let keep_enabled = matches!(
            self.states.get(name),
            Some(PackageState::Enabled { fingerprint: f, .. }) if *f == fingerprint
        );
        if !keep_enabled {
            self.states.insert(name.to_string(), PackageState::Built { fingerprint });
        }
    }

    /// Build, distribute and enable `name` on `targets`
    ///
    /// The archive goes to one worker per host; workers that fail to load or
    /// enable are marked bad. Returns the number of workers enabled.
    pub async fn enable_package(
        &mut self,
        cluster: &mut Cluster,
        cache: &mut CacheSynchronizer,
        name: &str,
        targets: &[Ordinal],
    ) -> Result<usize> {
        self.build_package(name).await?;
        let archive = self.archive_path(name);
        if !archive.exists() {
            return Err(ProofError::PackageNotFound {
                name: name.to_string(),
                dir: self.package_dir.clone(),
            });
        }

        let usable: Vec<Ordinal> = targets
            .iter()
            .copied()
            .filter(|&o| cluster.registry.is_usable(o))
            .collect();
        let eligible: Vec<Ordinal> = usable
            .iter()
            .copied()
            .filter(|&o| match cluster.registry.node(o) {
                Some(node) if node.protocol >= PACKAGE_PROTOCOL_VERSION => true,
                Some(node) => {
                    tracing::warn!(worker = o, protocol = node.protocol, package = name, "worker too old for packages");
                    false
                }
                None => false,
            })
            .collect();
        if eligible.is_empty() && !usable.is_empty() {
            let worker = usable
                .iter()
                .filter_map(|&o| cluster.registry.node(o).map(|n| n.protocol))
                .max()
                .unwrap_or_default();
            return Err(ProofError::ProtocolUnsupported {
                client: PROTOCOL_VERSION,
                worker,
                negotiated: worker.min(PROTOCOL_VERSION),
                minimum: PACKAGE_PROTOCOL_VERSION,
            });
        }

        let hosts = cluster.registry.unique_of(&eligible);
        cache.sync_file_to(cluster, &archive, true, &hosts).await?;

        let timeout = cluster.timeouts.request;
        let load = package_message(PackageAction::Load, name);
        let hosts: Vec<Ordinal> = hosts.into_iter().filter(|&o| cluster.registry.is_usable(o)).collect();
        let report = cluster.request(&load, &hosts, timeout, &mut LogCapture::default()).await?;
        mark_nonzero_bad(cluster, &report.statuses, name, "load");

        let enable = package_message(PackageAction::Enable, name);
        let eligible: Vec<Ordinal> = eligible.into_iter().filter(|&o| cluster.registry.is_usable(o)).collect();
        let report = cluster.request(&enable, &eligible, timeout, &mut LogCapture::default()).await?;
        mark_nonzero_bad(cluster, &report.statuses, name, "enable");

        let workers: BTreeSet<Ordinal> = report.succeeded().collect();
        let fingerprint = hash_file(&archive)?;
        let enabled = workers.len();
        self.states.insert(name.to_string(), PackageState::Enabled { fingerprint, workers });
        tracing::info!(package = name, workers = enabled, "package enabled");
        Ok(enabled)
    }

    /// Remove one package from workers and the local build area
    pub async fn clear_package(&mut self, cluster: &mut Cluster, cache: &mut CacheSynchronizer, name: &str) -> Result<()> {
        let _lock = self.lock(name)?;

        let targets = cluster.registry.select_set(WorkerSet::Unique);
        let timeout = cluster.timeouts.request;
        cluster
            .request(&package_message(PackageAction::Clear, name), &targets, timeout, &mut LogCapture::default())
            .await?;

        self.remove_local(name)?;
        cache.forget_file(&format!("{}.{}", name, PACKAGE_EXT));
        Ok(())
    }

    /// Remove every package; fails with `PackageBusy` if any build is running
    pub async fn clear_packages(&mut self, cluster: &mut Cluster, cache: &mut CacheSynchronizer) -> Result<()> {
        let names = self.known_packages()?;
        let mut locks = Vec::with_capacity(names.len());
        for name in &names {
            locks.push(self.lock(name)?);
        }

        let targets = cluster.registry.select_set(WorkerSet::Unique);
        let timeout = cluster.timeouts.request;
        cluster
            .request(&package_message(PackageAction::ClearAll, ""), &targets, timeout, &mut LogCapture::default())
            .await?;

        for name in &names {
            self.remove_local(name)?;
            cache.forget_file(&format!("{}.{}", name, PACKAGE_EXT));
        }
        self.states.clear();
        Ok(())
    }

    /// Drop the built tree of `name` and reset it to Unbuilt
    pub fn remove_local(&mut self, name: &str) -> Result<()> {
        let build_dir = self.build_dir(name);
        if build_dir.exists() {
            std::fs::remove_dir_all(&build_dir).map_err(|e| ProofError::io(&build_dir, e))?;
        }
        self.states.insert(name.to_string(), PackageState::Unbuilt);
        Ok(())
    }

    /// Copy an archive into the package directory
    ///
    /// Returns the package name. A changed archive resets the package to Unbuilt.
    pub fn upload_package(&mut self, path: &Path) -> Result<String> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| ProofError::Config(format!("not a package archive: {}", path.display())))?;
        if path.extension().and_then(|e| e.to_str()) != Some(PACKAGE_EXT) {
            return Err(ProofError::Config(format!(
                "package archives must end in .{}: {}",
                PACKAGE_EXT,
                path.display()
            )));
        }

        std::fs::create_dir_all(&self.package_dir).map_err(|e| ProofError::io(&self.package_dir, e))?;
        let dest = self.archive_path(&name);
        let unchanged = dest.exists() && hash_file(&dest)? == hash_file(path)?;
        if !unchanged {
            std::fs::copy(path, &dest).map_err(|e| ProofError::io(&dest, e))?;
            self.states.insert(name.clone(), PackageState::Unbuilt);
            tracing::info!(package = %name, "package uploaded");
        }
        Ok(name)
    }

    /// Package names found in the package directory
    pub fn known_packages(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let entries = match std::fs::read_dir(&self.package_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProofError::io(&self.package_dir, e)),
        };
        for entry in entries {
            let path = entry.map_err(|e| ProofError::io(&self.package_dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PACKAGE_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.insert(stem.to_string());
                }
            } else if path.join(BUILT_MARKER).exists() {
                if let Some(dir) = path.file_name().and_then(|s| s.to_str()) {
                    names.insert(dir.to_string());
                }
            }
        }
        names.extend(self.states.keys().filter(|n| !n.is_empty()).cloned());
        Ok(names.into_iter().collect())
    }

    /// Names enabled through this manager
    pub fn enabled_packages(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, PackageState::Enabled { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn mark_enabled(&mut self, name: &str, fingerprint: String, worker: Ordinal) {
        let mut workers = match self.states.remove(name) {
            Some(PackageState::Enabled { workers, .. }) => workers,
            _ => BTreeSet::new(),
        };
        workers.insert(worker);
        self.states.insert(name.to_string(), PackageState::Enabled { fingerprint, workers });
    }

    /// Local packages plus worker listings (Unique, or Active with `all`)
    pub async fn show_packages(&self, cluster: &mut Cluster, all: bool) -> Result<PackageListing> {
        self.listing(cluster, PackageAction::Show, all, self.known_packages()?).await
    }

    pub async fn show_enabled_packages(&self, cluster: &mut Cluster, all: bool) -> Result<PackageListing> {
        self.listing(cluster, PackageAction::ShowEnabled, all, self.enabled_packages()).await
    }

    async fn listing(
        &self,
        cluster: &mut Cluster,
        action: PackageAction,
        all: bool,
        local: Vec<String>,
    ) -> Result<PackageListing> {
        let targets = cluster
            .registry
            .select_set(if all { WorkerSet::Active } else { WorkerSet::Unique });
        let mut capture = LogCapture::default();
        let timeout = cluster.timeouts.request;
        cluster
            .request(&package_message(action, ""), &targets, timeout, &mut capture)
            .await?;
        Ok(PackageListing {
            local,
            remote: capture.chunks,
        })
    }
}

fn package_message(action: PackageAction, name: &str) -> Message {
    Message::Package(PackageMessage {
        action,
        name: name.to_string(),
    })
}

fn mark_nonzero_bad(cluster: &mut Cluster, statuses: &BTreeMap<Ordinal, i32>, name: &str, step: &str) {
    for (&ordinal, &status) in statuses {
        if status != 0 {
            tracing::warn!(worker = ordinal, package = name, step, status, "package step failed");
            cluster.registry.mark_bad(ordinal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::testing::TestCluster;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const TEMPLATE: &str = "proof-package-lock-{user}-{package}";

    /// Counts builds; optionally slow or failing
    #[derive(Default)]
    struct CountingBuilder {
        builds: AtomicUsize,
        delay: Duration,
        fail: bool,
        /// Leave a plain file where the build directory belongs
        file_in_place: bool,
    }

    impl PackageBuilder for CountingBuilder {
        fn build(&self, package_dir: &Path, _archive: Option<&Path>, name: &str) -> anyhow::Result<()> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                anyhow::bail!("compiler exploded");
            }
            if self.file_in_place {
                std::fs::create_dir_all(package_dir)?;
                std::fs::write(package_dir.join(name), b"not a directory")?;
            } else {
                std::fs::create_dir_all(package_dir.join(name))?;
            }
            Ok(())
        }
    }

    fn manager(dir: &TempDir, builder: Arc<CountingBuilder>) -> PackageManager {
        PackageManager::new(dir.path().join("packages"), dir.path().join("locks"), TEMPLATE, "tester")
            .with_builder(builder)
    }

    fn archive(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(format!("{}.par", name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_second_build_is_skipped() {
        let dir = TempDir::new().unwrap();
        let builder = Arc::new(CountingBuilder::default());
        let mut pm = manager(&dir, builder.clone());
        pm.upload_package(&archive(&dir, "Foo", b"v1")).unwrap();

        assert_eq!(pm.build_package("Foo").await.unwrap(), BuildOutcome::Built);
        assert_eq!(pm.build_package("Foo").await.unwrap(), BuildOutcome::AlreadyBuilt);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert!(matches!(pm.state("Foo"), PackageState::Built { .. }));

        // New archive content forces a rebuild
        pm.upload_package(&archive(&dir, "Foo", b"v2")).unwrap();
        assert_eq!(pm.state("Foo"), PackageState::Unbuilt);
        assert_eq!(pm.build_package("Foo").await.unwrap(), BuildOutcome::Built);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_builds_run_once() {
        let dir = TempDir::new().unwrap();
        let builder = Arc::new(CountingBuilder {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let mut first = manager(&dir, builder.clone());
        let mut second = manager(&dir, builder.clone());
        first.upload_package(&archive(&dir, "Foo", b"v1")).unwrap();

        let (a, b) = tokio::join!(first.build_package("Foo"), second.build_package("Foo"));

        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        let busy = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(ProofError::PackageBusy { .. })))
            .count();
        assert_eq!(busy, 1);
        assert!(a.is_ok() || b.is_ok());
    }

    #[tokio::test]
    async fn test_failed_build_releases_lock_and_resets() {
        let dir = TempDir::new().unwrap();
        let builder = Arc::new(CountingBuilder {
            fail: true,
            ..Default::default()
        });
        let mut pm = manager(&dir, builder.clone());
        pm.upload_package(&archive(&dir, "Foo", b"v1")).unwrap();

        let err = pm.build_package("Foo").await.unwrap_err();
        assert!(matches!(err, ProofError::PackageBuild { .. }));
        assert_eq!(pm.state("Foo"), PackageState::Unbuilt);
        assert!(!PackageLock::is_held(&dir.path().join("locks"), TEMPLATE, "tester", "Foo").unwrap());

        // Retry is possible
        assert!(pm.build_package("Foo").await.is_err());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unwritable_build_dir_resets_state() {
        let dir = TempDir::new().unwrap();
        let builder = Arc::new(CountingBuilder {
            file_in_place: true,
            ..Default::default()
        });
        let mut pm = manager(&dir, builder.clone());
        pm.upload_package(&archive(&dir, "Foo", b"v1")).unwrap();

        let err = pm.build_package("Foo").await.unwrap_err();
        assert!(matches!(err, ProofError::Io { .. }));
        assert_eq!(pm.state("Foo"), PackageState::Unbuilt);
        assert!(!PackageLock::is_held(&dir.path().join("locks"), TEMPLATE, "tester", "Foo").unwrap());
    }

    #[tokio::test]
    async fn test_missing_package() {
        let dir = TempDir::new().unwrap();
        let mut pm = manager(&dir, Arc::new(CountingBuilder::default()));
        assert!(matches!(
            pm.build_package("Nope").await,
            Err(ProofError::PackageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_wrong_extension() {
        let dir = TempDir::new().unwrap();
        let mut pm = manager(&dir, Arc::new(CountingBuilder::default()));
        let path = dir.path().join("Foo.tgz");
        std::fs::write(&path, b"x").unwrap();
        assert!(pm.upload_package(&path).is_err());
    }

    #[tokio::test]
    async fn test_enable_package_on_cluster() {
        let dir = TempDir::new().unwrap();
        let mut tc = TestCluster::healthy(&["A", "A", "B"]).await;
        let mut cache = CacheSynchronizer::new(crate::cache::CompareMode::HashOnly);
        let mut pm = manager(&dir, Arc::new(CountingBuilder::default()));
        pm.upload_package(&archive(&dir, "Foo", b"v1")).unwrap();

        let targets = tc.cluster.registry.select_set(WorkerSet::Active);
        let enabled = pm.enable_package(&mut tc.cluster, &mut cache, "Foo", &targets).await.unwrap();

        assert_eq!(enabled, 3);
        assert_eq!(pm.enabled_packages(), vec!["Foo".to_string()]);
        // One transfer per host
        assert!(cache.recorded(0, "Foo.par").is_some());
        assert!(cache.recorded(1, "Foo.par").is_none());
        assert!(cache.recorded(2, "Foo.par").is_some());

        let listing = pm.show_enabled_packages(&mut tc.cluster, true).await.unwrap();
        assert_eq!(listing.remote.len(), 3);
        assert!(listing.remote.iter().all(|(_, chunk)| chunk.contains("Foo")));
    }

    #[tokio::test]
    async fn test_clear_while_building_is_busy() {
        let dir = TempDir::new().unwrap();
        let mut tc = TestCluster::healthy(&["A"]).await;
        let mut cache = CacheSynchronizer::new(crate::cache::CompareMode::HashOnly);
        let mut pm = manager(&dir, Arc::new(CountingBuilder::default()));
        pm.upload_package(&archive(&dir, "Foo", b"v1")).unwrap();
        pm.build_package("Foo").await.unwrap();

        let held = PackageLock::try_acquire(&dir.path().join("locks"), TEMPLATE, "tester", "Foo").unwrap();
        let err = pm.clear_package(&mut tc.cluster, &mut cache, "Foo").await.unwrap_err();
        assert!(matches!(err, ProofError::PackageBusy { .. }));
        drop(held);

        pm.clear_package(&mut tc.cluster, &mut cache, "Foo").await.unwrap();
        assert_eq!(pm.state("Foo"), PackageState::Unbuilt);
        assert!(!pm.build_dir("Foo").exists());
    }
}
