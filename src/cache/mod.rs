//! File cache synchronization
//!
//! Keeps worker file caches in step with the master's copy. Each distributed
//! file is identified by a `FileFingerprint` (SHA-256 content hash plus
//! modification time). Content hash is authoritative: a changed mtime only
//! makes the master re-hash its file, and only a hash difference triggers a
//! transfer (unless `CompareMode::HashAndModtime` makes mtime significant).
//!
//! # Transfer
//!
//! ```text
//! Master                              Worker
//!   |-- FILE(query name) ------------->|
//!   |<--------- FILE(fingerprint?) ----|
//!   |-- FILE(begin name size fp) ----->|
//!   |-- RAW chunk ... RAW chunk ------>|
//!   |<--------- LOGDONE(0) ------------|   fingerprint recorded only now
//! ```
//!
//! Remote fingerprints are trusted for the current session only.

use crate::coordinator::collect::{LogCapture, LogOnly, Reply, ReplyHandler};
use crate::coordinator::registry::{Ordinal, WorkerSet};
use crate::coordinator::Cluster;
use crate::distributed::protocol::*;
use crate::error::{ProofError, Result};
use crate::package::lock::PackageLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default RAW chunk size for file transfers
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Content hash and modification time of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Lowercase hex SHA-256 of the content
    pub hash: String,

    /// Modification time, seconds since the Unix epoch
    pub modified: i64,
}

impl FileFingerprint {
    /// Hash a file from disk
    pub fn compute(path: &Path) -> Result<Self> {
        let modified = modified_secs(path)?;
        let hash = hash_file(path)?;
        Ok(Self { hash, modified })
    }

    pub fn matches(&self, other: &FileFingerprint, mode: CompareMode) -> bool {
        match mode {
            CompareMode::HashOnly => self.hash == other.hash,
            CompareMode::HashAndModtime => self.hash == other.hash && self.modified == other.modified,
        }
    }
}

/// SHA-256 of a file, as lowercase hex
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| ProofError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| ProofError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub(crate) fn modified_secs(path: &Path) -> Result<i64> {
    Ok(FileStamp::read(path)?.modified_secs())
}

/// A file written within this window of being hashed is hashed again
const RACY_WINDOW: Duration = Duration::from_secs(2);

/// Local metadata deciding whether a cached hash is still current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    /// Inode change time where available; moves on every write even when
    /// the mtime is put back
    changed: SystemTime,
    len: u64,
}

impl FileStamp {
    fn read(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| ProofError::io(path, e))?;
        let modified = meta.modified().map_err(|e| ProofError::io(path, e))?;
        Ok(Self {
            modified,
            changed: change_time(&meta).unwrap_or(modified),
            len: meta.len(),
        })
    }

    fn modified_secs(&self) -> i64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    /// True when a hash taken at `hashed_at` may have missed a write
    fn is_racy(&self, hashed_at: SystemTime) -> bool {
        self.modified
            .max(self.changed)
            .checked_add(RACY_WINDOW)
            .map_or(true, |settled| settled >= hashed_at)
    }
}

#[cfg(unix)]
fn change_time(meta: &std::fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;

    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn change_time(_meta: &std::fs::Metadata) -> Option<SystemTime> {
    None
}

#[derive(Debug, Clone)]
struct LocalEntry {
    stamp: FileStamp,
    hashed_at: SystemTime,
    fingerprint: FileFingerprint,
}

/// Read at most `remaining` bytes into `buf`
async fn read_capped<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8], remaining: u64) -> std::io::Result<usize> {
    let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    if want == 0 {
        return Ok(0);
    }
    reader.read(&mut buf[..want]).await
}

/// How fingerprints are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareMode {
    #[default]
    HashOnly,
    HashAndModtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Unchanged,
    NeedsTransfer,
}

/// Session-scoped fingerprint bookkeeping
#[derive(Debug)]
pub struct CacheSynchronizer {
    mode: CompareMode,
    chunk_size: usize,
    lock_path: Option<PathBuf>,

    /// Master-side fingerprints by path
    local: HashMap<PathBuf, LocalEntry>,

    /// Last fingerprint confirmed on each worker
    remote: HashMap<(Ordinal, String), FileFingerprint>,
}

impl CacheSynchronizer {
    pub fn new(mode: CompareMode) -> Self {
        Self {
            mode,
            chunk_size: DEFAULT_CHUNK_SIZE,
            lock_path: None,
            local: HashMap::new(),
            remote: HashMap::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Guard cache clearing with a lock file
    pub fn with_lock_path(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    pub fn mode(&self) -> CompareMode {
        self.mode
    }

    /// Master-side fingerprint of `path`
    ///
    /// The cached hash is reused only while size, modification and change
    /// times are untouched and the file had settled before it was hashed.
    pub fn local_fingerprint(&mut self, path: &Path) -> Result<FileFingerprint> {
        let stamp = FileStamp::read(path)?;
        if let Some(known) = self.local.get(path) {
            if known.stamp == stamp && !stamp.is_racy(known.hashed_at) {
                return Ok(known.fingerprint.clone());
            }
        }

        let hashed_at = SystemTime::now();
        let fingerprint = FileFingerprint {
            hash: hash_file(path)?,
            modified: stamp.modified_secs(),
        };
        if let Some(previous) = self.local.get(path) {
            if previous.fingerprint.hash == fingerprint.hash {
                tracing::debug!(file = %path.display(), "file touched, content unchanged");
            }
        }
        self.local.insert(
            path.to_path_buf(),
            LocalEntry {
                stamp,
                hashed_at,
                fingerprint: fingerprint.clone(),
            },
        );
        Ok(fingerprint)
    }

    /// Fingerprint last confirmed on a worker
    pub fn recorded(&self, ordinal: Ordinal, name: &str) -> Option<&FileFingerprint> {
        self.remote.get(&(ordinal, name.to_string()))
    }

    /// Decide whether `path` must be sent to `ordinal`
    pub async fn check_file(&mut self, cluster: &mut Cluster, path: &Path, ordinal: Ordinal) -> Result<CheckOutcome> {
        let name = file_name(path)?;
        let local = self.local_fingerprint(path)?;

        if let Some(known) = self.recorded(ordinal, &name) {
            if known.matches(&local, self.mode) {
                return Ok(CheckOutcome::Unchanged);
            }
        }

        let query = Message::File(FileMessage::Query { name: name.clone() });
        let mut reply = FingerprintReply::default();
        let timeout = cluster.timeouts.request;
        let report = cluster.request(&query, &[ordinal], timeout, &mut reply).await?;
        if report.cancelled {
            return Err(ProofError::Cancelled);
        }
        if !report.failed.is_empty() || !report.is_complete() {
            return Err(ProofError::worker(ordinal, format!("no fingerprint reply for {}", name)));
        }

        match reply.fingerprint {
            Some(remote) if remote.matches(&local, self.mode) => {
                self.remote.insert((ordinal, name), remote);
                Ok(CheckOutcome::Unchanged)
            }
            remote => {
                tracing::debug!(
                    worker = ordinal,
                    file = %name,
                    present = remote.is_some(),
                    "cache mismatch"
                );
                Ok(CheckOutcome::NeedsTransfer)
            }
        }
    }

    /// Transfer `path` to one worker
    ///
    /// The worker's fingerprint is recorded only once it acknowledged the
    /// complete transfer; any failure leaves it unset. Cancellation is
    /// honoured before the first byte and while waiting for the
    /// acknowledgement, never mid-stream.
    pub async fn send_file(&mut self, cluster: &mut Cluster, path: &Path, ordinal: Ordinal, binary: bool) -> Result<()> {
        let name = file_name(path)?;
        self.remote.remove(&(ordinal, name.clone()));

        let fingerprint = self.local_fingerprint(path)?;
        let mut file = tokio::fs::File::open(path).await.map_err(|e| ProofError::io(path, e))?;
        let size = file.metadata().await.map_err(|e| ProofError::io(path, e))?.len();

        let begin = Message::File(FileMessage::Begin {
            name: name.clone(),
            size,
            binary,
            fingerprint: fingerprint.clone(),
        });
        if cluster.cancel_token().is_cancelled() {
            return Err(ProofError::Cancelled);
        }
        if cluster.uncancellable_broadcaster().broadcast(&begin, &[ordinal]).await? == 0 {
            return Err(ProofError::worker(ordinal, format!("could not start transfer of {}", name)));
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        while sent < size {
            let n = read_capped(&mut file, &mut buf, size - sent)
                .await
                .map_err(|e| ProofError::io(path, e))?;
            if n == 0 {
                break;
            }
            if cluster
                .uncancellable_broadcaster()
                .broadcast_raw(&buf[..n], &[ordinal])
                .await?
                == 0
            {
                return Err(ProofError::worker(ordinal, format!("transfer of {} interrupted", name)));
            }
            sent += n as u64;
        }
        let current = file.metadata().await.map_err(|e| ProofError::io(path, e))?.len();
        if sent != size || current != size {
            return Err(ProofError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("file changed size during transfer ({} announced, {} now)", size, current),
                ),
            ));
        }

        let timeout = cluster.timeouts.request;
        let report = cluster.gather(&[ordinal], timeout, &mut LogOnly).await;
        if report.cancelled {
            cluster.monitor.discard(ordinal);
            return Err(ProofError::Cancelled);
        }
        cluster.mark_pending_bad(&report);

        match report.statuses.get(&ordinal) {
            Some(0) => {
                tracing::debug!(worker = ordinal, file = %name, bytes = size, "file sent");
                self.remote.insert((ordinal, name), fingerprint);
                Ok(())
            }
            Some(status) => Err(ProofError::worker(
                ordinal,
                format!("worker rejected {} (status {})", name, status),
            )),
            None => Err(ProofError::worker(ordinal, format!("no acknowledgement for {}", name))),
        }
    }

    /// Bring every Unique worker up to date with `path`
    ///
    /// Returns the number of transfers performed.
    pub async fn sync_file(&mut self, cluster: &mut Cluster, path: &Path, binary: bool) -> Result<usize> {
        let targets = cluster.registry.select_set(WorkerSet::Unique);
        self.sync_file_to(cluster, path, binary, &targets).await
    }

    pub async fn sync_file_to(
        &mut self,
        cluster: &mut Cluster,
        path: &Path,
        binary: bool,
        targets: &[Ordinal],
    ) -> Result<usize> {
        let mut transfers = 0;

        for &ordinal in targets {
            if !cluster.registry.is_usable(ordinal) {
                continue;
            }

            let result = match self.check_file(cluster, path, ordinal).await {
                Ok(CheckOutcome::Unchanged) => Ok(false),
                Ok(CheckOutcome::NeedsTransfer) => self.send_file(cluster, path, ordinal, binary).await.map(|_| true),
                Err(e) => Err(e),
            };

            match result {
                Ok(true) => transfers += 1,
                Ok(false) => {}
                Err(e) if e.is_worker_local() => {
                    tracing::warn!(worker = ordinal, error = %e, "file sync failed");
                    cluster.registry.mark_bad(ordinal);
                    self.forget_worker(ordinal);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(transfers)
    }

    /// List worker caches (Unique workers, or every Active one with `all`)
    pub async fn show_cache(&mut self, cluster: &mut Cluster, all: bool) -> Result<Vec<(Ordinal, String)>> {
        let targets = cluster
            .registry
            .select_set(if all { WorkerSet::Active } else { WorkerSet::Unique });
        let mut capture = LogCapture::default();
        let timeout = cluster.timeouts.request;
        cluster
            .request(&Message::command(CommandKind::ShowCache, ""), &targets, timeout, &mut capture)
            .await?;
        Ok(capture.chunks)
    }

    /// Empty worker caches and forget every remote fingerprint
    ///
    /// Returns the number of workers that confirmed.
    pub async fn clear_cache(&mut self, cluster: &mut Cluster) -> Result<usize> {
        let _lock = match &self.lock_path {
            Some(path) => Some(PackageLock::acquire_at(path, "cache")?),
            None => None,
        };

        let targets = cluster.registry.select_set(WorkerSet::Unique);
        let timeout = cluster.timeouts.request;
        let report = cluster
            .request(&Message::command(CommandKind::ClearCache, ""), &targets, timeout, &mut LogOnly)
            .await?;

        self.remote.clear();
        Ok(report.succeeded().count())
    }

    pub fn forget_worker(&mut self, ordinal: Ordinal) {
        self.remote.retain(|(o, _), _| *o != ordinal);
    }

    pub fn forget_file(&mut self, name: &str) {
        self.remote.retain(|(_, n), _| n != name);
    }

    /// Drop every fingerprint (end of session)
    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}

/// Name a file is cached under on workers
pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ProofError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })
}

#[derive(Debug, Default)]
struct FingerprintReply {
    fingerprint: Option<FileFingerprint>,
}

impl ReplyHandler for FingerprintReply {
    fn on_reply(&mut self, _ordinal: Ordinal, msg: Message) -> Reply {
        match msg {
            Message::File(FileMessage::Fingerprint { fingerprint, .. }) => {
                self.fingerprint = fingerprint;
                Reply::Finished
            }
            _ => Reply::Unexpected,
        }
    }
}
