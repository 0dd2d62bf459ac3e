//! TOML configuration file parsing

use super::*;
use crate::config::cli::{Cli, FingerprintMode};
use anyhow::{Context, Result};
use std::fs;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<CoordinatorConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<CoordinatorConfig> {
    let config: CoordinatorConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: CoordinatorConfig) -> Result<CoordinatorConfig> {
    if let Some(master) = &cli.master {
        config.session.master = master.clone();
    }
    if let Some(port) = cli.port {
        config.session.port = port;
    }
    if let Some(conf_file) = &cli.conf_file {
        config.session.conf_file = conf_file.clone();
    }
    if let Some(conf_dir) = &cli.conf_dir {
        config.session.conf_dir = conf_dir.clone();
    }
    if let Some(work_dir) = &cli.work_dir {
        config.session.work_dir = work_dir.clone();
    }
    if let Some(level) = cli.log_level {
        config.session.log_level = level;
    }
    if let Some(parallel) = cli.parallel {
        config.session.parallel = Some(parallel);
    }

    if let Some(lock_dir) = &cli.lock_dir {
        config.locks.dir = Some(lock_dir.clone());
    }

    if let Some(mode) = cli.fingerprint_mode {
        config.cache.fingerprint_mode = match mode {
            FingerprintMode::HashOnly => CompareMode::HashOnly,
            FingerprintMode::HashAndModtime => CompareMode::HashAndModtime,
        };
    }

    if let Some(setup) = &cli.setup_timeout {
        config.timeouts.setup = parse_duration(setup)?;
    }
    if let Some(job) = &cli.job_timeout {
        let job = parse_duration(job)?;
        // 0 means unbounded
        config.timeouts.job = if job.is_zero() { None } else { Some(job) };
    }

    if let Some(host) = &cli.worker_host {
        config.worker.host = Some(host.clone());
    }
    if let Some(perf) = cli.perf_index {
        config.worker.perf_index = perf;
    }

    Ok(config)
}

/// Load the configuration file named on the command line (if any) and apply CLI overrides
pub fn load_config(cli: &Cli) -> Result<CoordinatorConfig> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => CoordinatorConfig::default(),
    };
    merge_cli_with_config(cli, config)
}
