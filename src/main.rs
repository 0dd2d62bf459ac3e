//! proof-coord CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use proof_coord::config::cli::{Cli, ExecutionMode};
use proof_coord::config::toml::load_config;
use proof_coord::config::validator::validate_config;
use proof_coord::coordinator::session::current_user;
use proof_coord::coordinator::{CoordinatorObserver, JobOutcome, JobSpec, WorkerSet};
use proof_coord::distributed::worker_service::local_host;
use proof_coord::distributed::{WorkerOptions, WorkerService};
use proof_coord::job::CountingRunner;
use proof_coord::{Coordinator, CoordinatorConfig};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("Invalid --log filter")?)
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    validate_config(&config).context("Configuration validation failed")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    match cli.mode {
        ExecutionMode::Worker => runtime.block_on(run_worker(&config)),
        _ => runtime.block_on(run_coordinator(&cli, &config)),
    }
}

/// Serve masters on the configured port until killed
async fn run_worker(config: &CoordinatorConfig) -> Result<()> {
    let options = WorkerOptions {
        host: config.worker.host.clone().unwrap_or_else(local_host),
        perf_index: config.worker.perf_index,
        cache_dir: config.cache_dir(),
        package_dir: config.package_dir(),
        lock_dir: config.lock_dir(),
        package_lock_template: config.locks.package_template.clone(),
        user: current_user(),
    };
    WorkerService::new(options, Arc::new(CountingRunner::default()))
        .listen(config.session.port)
        .await
}

async fn run_coordinator(cli: &Cli, config: &CoordinatorConfig) -> Result<()> {
    let mut coordinator = Coordinator::init(config).await;
    if !coordinator.is_valid() {
        anyhow::bail!(
            "Session setup failed: {}",
            coordinator.setup_error().unwrap_or("no usable workers")
        );
    }

    // Ctrl-C cancels whatever the coordinator is waiting on
    let handle = coordinator.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            handle.cancel();
        }
    });

    let result = run_mode(cli, &mut coordinator).await;
    coordinator.close().await;
    result
}

async fn run_mode(cli: &Cli, coordinator: &mut Coordinator) -> Result<()> {
    match cli.mode {
        ExecutionMode::Ping => {
            let answered = coordinator.ping(WorkerSet::All).await?;
            println!(
                "{} of {} workers answered",
                answered,
                coordinator.registry().len()
            );
        }
        ExecutionMode::Info => {
            let infos = coordinator.worker_info().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                println!("{:>4}  {:<24} {:>5}  STATUS", "ORD", "HOST", "PERF");
                for info in infos {
                    println!(
                        "{:>4}  {:<24} {:>5}  {:?}",
                        info.ordinal, info.host, info.perf_index, info.status
                    );
                }
            }
        }
        ExecutionMode::Exec => {
            let command = cli.command.as_deref().unwrap_or_default();
            let output = coordinator.exec(command).await?;
            for (ordinal, chunk) in &output.logs {
                for line in chunk.lines() {
                    println!("[{}] {}", ordinal, line);
                }
            }
            let failed = output.statuses.values().filter(|&&s| s != 0).count();
            if failed > 0 {
                anyhow::bail!("command failed on {} worker(s)", failed);
            }
        }
        ExecutionMode::Process => {
            for path in &cli.files {
                let sent = coordinator.send_file(path, true).await?;
                tracing::info!(file = %path.display(), transfers = sent, "file synchronized");
            }
            for path in &cli.packages {
                let name = coordinator.upload_package(path)?;
                coordinator.enable_package(&name).await?;
            }

            let spec = JobSpec {
                options: cli.options.clone(),
                entries: cli.entries,
                first_entry: cli.first_entry,
                ..JobSpec::new(cli.dataset.clone(), cli.selector.clone())
            };
            let mut progress = ProgressLog::default();
            let outcome = coordinator.process(&spec, &mut progress).await?;
            report_outcome(coordinator, &outcome, cli.json)?;
        }
        ExecutionMode::Worker => anyhow::bail!("worker mode does not open a session"),
    }
    Ok(())
}

/// Logs progress at every 10% step
#[derive(Default)]
struct ProgressLog {
    last_step: i64,
}

impl CoordinatorObserver for ProgressLog {
    fn on_progress(&mut self, total: i64, processed: i64) {
        if total <= 0 {
            return;
        }
        let step = processed * 10 / total;
        if step > self.last_step {
            self.last_step = step;
            tracing::info!(processed, total, "progress {}%", step * 10);
        }
    }
}

#[derive(Serialize)]
struct JobSummary<'a> {
    status: String,
    succeeded: Vec<u32>,
    failed: Vec<u32>,
    cancelled: bool,
    elapsed_secs: f64,
    bytes_read: u64,
    real_time: f64,
    cpu_time: f64,
    outputs: Vec<&'a str>,
}

fn report_outcome(coordinator: &Coordinator, outcome: &JobOutcome, json: bool) -> Result<()> {
    let summary = JobSummary {
        status: format!("{:?}", outcome.status),
        succeeded: outcome.succeeded.iter().copied().collect(),
        failed: outcome.failed.iter().copied().collect(),
        cancelled: outcome.cancelled,
        elapsed_secs: outcome.elapsed.as_secs_f64(),
        bytes_read: coordinator.bytes_read(),
        real_time: coordinator.real_time(),
        cpu_time: coordinator.cpu_time(),
        outputs: outcome.outputs.iter().map(|o| o.name.as_str()).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Status:     {}", summary.status);
        println!("Workers:    {} ok, {} failed", summary.succeeded.len(), summary.failed.len());
        println!("Elapsed:    {:.2}s", summary.elapsed_secs);
        println!("Bytes read: {}", summary.bytes_read);
        println!("CPU time:   {:.2}s", summary.cpu_time);
        if !summary.outputs.is_empty() {
            println!("Outputs:    {}", summary.outputs.join(", "));
        }
    }
    Ok(())
}
