//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Ping every worker and report which answered
    Ping,
    /// Print the worker table
    Info,
    /// Run a command line on every active worker
    Exec,
    /// Submit a job and wait for it
    Process,
    /// Run the worker-side service
    Worker,
}

/// Fingerprint comparison mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FingerprintMode {
    HashOnly,
    HashAndModtime,
}

/// proof-coord - master-side coordinator for parallel processing workers
#[derive(Parser, Debug)]
#[command(name = "proof-coord")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode
    #[arg(long, value_enum, default_value = "ping")]
    pub mode: ExecutionMode,

    /// TOML configuration file (CLI values take precedence)
    #[arg(short = 'c', long, env = "PROOF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Master address (a remote master makes this process a client)
    #[arg(long)]
    pub master: Option<String>,

    /// Service port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Cluster file name, relative to the configuration directory
    #[arg(long)]
    pub conf_file: Option<String>,

    /// Configuration directory
    #[arg(long)]
    pub conf_dir: Option<PathBuf>,

    /// Session working directory
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Directory for lock files
    #[arg(long)]
    pub lock_dir: Option<PathBuf>,

    /// Session log level forwarded to workers
    #[arg(long)]
    pub log_level: Option<i32>,

    /// Local log filter (tracing directives, e.g. "debug" or "proof_coord=trace")
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log: String,

    /// Number of active workers
    #[arg(short = 'n', long)]
    pub parallel: Option<usize>,

    /// Fingerprint comparison mode
    #[arg(long, value_enum)]
    pub fingerprint_mode: Option<FingerprintMode>,

    /// Setup timeout (e.g. 10s)
    #[arg(long)]
    pub setup_timeout: Option<String>,

    /// Job timeout (e.g. 5m)
    #[arg(long)]
    pub job_timeout: Option<String>,

    /// Command line to run (exec mode)
    #[arg(long)]
    pub command: Option<String>,

    /// Dataset description (process mode)
    #[arg(long, default_value = "")]
    pub dataset: String,

    /// Selector name (process mode)
    #[arg(long, default_value = "count")]
    pub selector: String,

    /// Selector options (process mode)
    #[arg(long, default_value = "")]
    pub options: String,

    /// Number of entries to process, -1 for all (process mode)
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    pub entries: i64,

    /// First entry to process (process mode)
    #[arg(long, default_value = "0")]
    pub first_entry: i64,

    /// Files to push to workers before processing
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,

    /// Package archives to upload and enable before processing
    #[arg(long = "package")]
    pub packages: Vec<PathBuf>,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,

    /// Host identity to report (worker mode)
    #[arg(long)]
    pub worker_host: Option<String>,

    /// Performance index to report (worker mode)
    #[arg(long)]
    pub perf_index: Option<i32>,
}

impl Cli {
    /// Check mode-specific arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mode == ExecutionMode::Exec && self.command.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("--command is required in exec mode");
        }
        if self.parallel == Some(0) {
            anyhow::bail!("--parallel must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_mode() {
        let cli = Cli::parse_from([
            "proof-coord",
            "--mode",
            "process",
            "--entries",
            "-1",
            "--file",
            "a.so",
            "--file",
            "b.so",
            "--fingerprint-mode",
            "hash-and-modtime",
        ]);
        assert_eq!(cli.mode, ExecutionMode::Process);
        assert_eq!(cli.entries, -1);
        assert_eq!(cli.files.len(), 2);
        assert_eq!(cli.fingerprint_mode, Some(FingerprintMode::HashAndModtime));
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_exec_requires_command() {
        let cli = Cli::parse_from(["proof-coord", "--mode", "exec"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["proof-coord", "--mode", "exec", "--command", "uptime"]);
        assert!(cli.validate().is_ok());
    }
}
