//! Cluster file parsing
//!
//! One entry per line, `#` starts a comment:
//!
//! ```text
//! master node-0
//! worker node-1
//! worker node-2:1094 perf=200
//! slave  node-3            # accepted as an alias of worker
//! ```
//!
//! Workers receive ordinals in file order.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// One configured worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub host: String,
    pub port: u16,
    /// Overrides the performance index the worker reports
    pub perf_index: Option<i32>,
}

impl WorkerEntry {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            perf_index: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterFile {
    pub master: Option<String>,
    pub workers: Vec<WorkerEntry>,
}

pub fn parse_cluster_file(path: &Path, default_port: u16) -> Result<ClusterFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read cluster file: {}", path.display()))?;

    parse_cluster_str(&contents, default_port)
        .with_context(|| format!("Failed to parse cluster file: {}", path.display()))
}

pub fn parse_cluster_str(contents: &str, default_port: u16) -> Result<ClusterFile> {
    let mut cluster = ClusterFile::default();

    for (index, raw) in contents.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let keyword = fields.next().unwrap_or_default();
        let host = fields
            .next()
            .with_context(|| format!("line {}: '{}' needs a host", line_no, keyword))?;

        match keyword {
            "master" => {
                if cluster.master.is_some() {
                    anyhow::bail!("line {}: more than one master", line_no);
                }
                cluster.master = Some(host.to_string());
            }
            "worker" | "slave" => {
                let mut entry = parse_address(host, default_port).with_context(|| format!("line {}", line_no))?;
                for option in fields {
                    match option.split_once('=') {
                        Some(("perf", value)) => {
                            let perf: i32 = value
                                .parse()
                                .with_context(|| format!("line {}: invalid perf index '{}'", line_no, value))?;
                            entry.perf_index = Some(perf);
                        }
                        _ => anyhow::bail!("line {}: unknown option '{}'", line_no, option),
                    }
                }
                cluster.workers.push(entry);
            }
            other => anyhow::bail!("line {}: unknown keyword '{}'", line_no, other),
        }
    }

    Ok(cluster)
}

fn parse_address(spec: &str, default_port: u16) -> Result<WorkerEntry> {
    match spec.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().with_context(|| format!("invalid port in '{}'", spec))?;
            if host.is_empty() {
                anyhow::bail!("empty host in '{}'", spec);
            }
            Ok(WorkerEntry::new(host, port))
        }
        None => Ok(WorkerEntry::new(spec, default_port)),
    }
}
