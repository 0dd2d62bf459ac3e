//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, the cluster file,
//! and validation.

pub mod cli;
pub mod cluster;
pub mod toml;
pub mod validator;

use crate::cache::CompareMode;
use crate::distributed::protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete coordinator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub packages: PackageConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub worker: WorkerModeConfig,
}

/// Session identity and locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Master address; a remote master makes this process a client
    #[serde(default = "default_master")]
    pub master: String,
    /// Port workers (or the remote master) listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cluster file name, relative to `conf_dir`
    #[serde(default = "default_conf_file")]
    pub conf_file: String,
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,
    /// Session working directory (`~` is expanded)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Log level forwarded to workers
    #[serde(default)]
    pub log_level: i32,
    #[serde(default = "default_log_mask")]
    pub log_mask: u32,
    /// Initial number of active workers (all when unset)
    pub parallel: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            master: default_master(),
            port: default_port(),
            conf_file: default_conf_file(),
            conf_dir: default_conf_dir(),
            work_dir: default_work_dir(),
            log_level: 0,
            log_mask: default_log_mask(),
            parallel: None,
        }
    }
}

fn default_master() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_conf_file() -> String {
    "proof.conf".to_string()
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("/usr/local/root")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("~/proof")
}

fn default_log_mask() -> u32 {
    u32::MAX
}

/// File cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory, relative to the work dir
    #[serde(default = "default_cache_subdir")]
    pub subdir: String,
    #[serde(default)]
    pub fingerprint_mode: CompareMode,
    /// RAW chunk size for transfers (bytes)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            subdir: default_cache_subdir(),
            fingerprint_mode: CompareMode::default(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_cache_subdir() -> String {
    "cache".to_string()
}

fn default_chunk_size() -> usize {
    crate::cache::DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package directory, relative to the work dir
    #[serde(default = "default_package_subdir")]
    pub subdir: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            subdir: default_package_subdir(),
        }
    }
}

fn default_package_subdir() -> String {
    "packages".to_string()
}

/// Lock file placement
///
/// Templates may use `{user}`, `{package}` and `{pid}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock directory (system temp dir when unset)
    pub dir: Option<PathBuf>,
    #[serde(default = "default_cache_lock")]
    pub cache_template: String,
    #[serde(default = "default_package_lock")]
    pub package_template: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: None,
            cache_template: default_cache_lock(),
            package_template: default_package_lock(),
        }
    }
}

fn default_cache_lock() -> String {
    "proof-cache-lock-{user}".to_string()
}

fn default_package_lock() -> String {
    "proof-package-lock-{user}-{package}".to_string()
}

/// Timeouts, written as duration strings ("30s", "500ms", "5m")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connecting and handshaking all workers
    #[serde(default = "default_setup", with = "duration_str")]
    pub setup: Duration,
    /// Flushing one frame to a worker
    #[serde(default = "default_send", with = "duration_str")]
    pub send: Duration,
    /// One collect tick
    #[serde(default = "default_collect", with = "duration_str")]
    pub collect: Duration,
    #[serde(default = "default_ping", with = "duration_str")]
    pub ping: Duration,
    /// Whole request/reply exchanges (exec, file checks, package steps)
    #[serde(default = "default_request", with = "duration_str")]
    pub request: Duration,
    /// How long a worker may take to react to an interrupt
    #[serde(default = "default_grace", with = "duration_str")]
    pub grace: Duration,
    /// Upper bound for a PROCESS job (unbounded when unset)
    #[serde(default, with = "duration_str::option", skip_serializing_if = "Option::is_none")]
    pub job: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            setup: default_setup(),
            send: default_send(),
            collect: default_collect(),
            ping: default_ping(),
            request: default_request(),
            grace: default_grace(),
            job: None,
        }
    }
}

fn default_setup() -> Duration {
    Duration::from_secs(10)
}

fn default_send() -> Duration {
    Duration::from_secs(30)
}

fn default_collect() -> Duration {
    Duration::from_secs(5)
}

fn default_ping() -> Duration {
    Duration::from_secs(5)
}

fn default_request() -> Duration {
    Duration::from_secs(60)
}

fn default_grace() -> Duration {
    Duration::from_secs(2)
}

/// Settings used when running as a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerModeConfig {
    /// Host identity reported to the master (local host name when unset)
    pub host: Option<String>,
    #[serde(default = "default_perf_index")]
    pub perf_index: i32,
}

impl Default for WorkerModeConfig {
    fn default() -> Self {
        Self {
            host: None,
            perf_index: default_perf_index(),
        }
    }
}

fn default_perf_index() -> i32 {
    100
}

impl CoordinatorConfig {
    pub fn work_dir(&self) -> PathBuf {
        expand_home(&self.session.work_dir)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir().join(&self.cache.subdir)
    }

    pub fn package_dir(&self) -> PathBuf {
        self.work_dir().join(&self.packages.subdir)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.locks.dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Path of the cluster file
    pub fn cluster_file(&self) -> PathBuf {
        let conf_file = Path::new(&self.session.conf_file);
        if conf_file.is_absolute() {
            conf_file.to_path_buf()
        } else {
            self.session.conf_dir.join(conf_file)
        }
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Parse a duration string ("500ms", "30s", "5m", "1h"; bare numbers are seconds)
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    use anyhow::Context;

    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid number in duration: {}", s))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(num),
        "" | "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        other => anyhow::bail!("Invalid duration unit: {}. Use ms, s, m, or h", other),
    };

    Ok(duration)
}

/// Render a duration the way `parse_duration` reads it
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Serde adapter for duration strings
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => serializer.serialize_str(&format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
