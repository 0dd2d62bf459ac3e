//! Worker-side service
//!
//! Serves one master connection at a time:
//! - Answers the HELLO handshake with its self-description
//! - Keeps the file cache and package area the master synchronizes
//! - Runs PROCESS jobs through a `JobRunner`, streaming progress and output
//! - Watches for urgent frames while a job runs
//!
//! Urgent frames are picked off the stream by the reader task and raise the
//! shared `InterruptFlag` directly, so a busy job sees them at its next
//! check. The reader clears the flag when it forwards a PROCESS frame, which
//! ties every interrupt to the job that precedes it on the wire.

use crate::cache::{hash_file, FileFingerprint};
use crate::distributed::protocol::*;
use crate::job::{InterruptFlag, JobControl, JobEvent, JobRunner};
use crate::package::{PackageBuilder, PackageManager, ScriptBuilder, BUILT_MARKER, PACKAGE_EXT};
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Host identity reported to the master
    pub host: String,

    pub perf_index: i32,

    /// Where transferred files land
    pub cache_dir: PathBuf,

    pub package_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub package_lock_template: String,
    pub user: String,
}

/// Worker service
pub struct WorkerService {
    options: WorkerOptions,
    runner: Arc<dyn JobRunner>,
    builder: Arc<dyn PackageBuilder>,
    protocol_version: u32,
}

impl WorkerService {
    pub fn new(options: WorkerOptions, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            options,
            runner,
            builder: Arc::new(ScriptBuilder),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn PackageBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Advertise a different protocol version in the handshake
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Accept master connections forever, one session at a time
    pub async fn listen(self, port: u16) -> Result<()> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind worker service on {}", addr))?;

        tracing::info!(port, host = %self.options.host, "worker service listening");

        loop {
            let (stream, peer) = listener.accept().await.context("Failed to accept connection")?;
            stream.set_nodelay(true).ok();
            tracing::info!(%peer, "master connected");

            if let Err(e) = self.serve(stream).await {
                tracing::warn!(%peer, error = %format!("{:#}", e), "session ended with error");
            }
            tracing::info!(%peer, "session closed");
        }
    }

    /// Serve one master session until STOP, shutdown or disconnect
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        let hello = match read_frame(&mut reader).await? {
            Frame::Message(Message::Hello(hello)) => hello,
            Frame::Message(other) => anyhow::bail!("Expected HELLO, got {}", other.kind_name()),
            _ => anyhow::bail!("Expected HELLO, got a non-message frame"),
        };

        let mut session = WorkerSession::new(self, hello.ordinal, writer)?;
        let reply = Message::Hello(HelloMessage {
            protocol_version: self.protocol_version,
            ordinal: hello.ordinal,
            info: Some(session.info()),
        });
        session.send(reply).await?;
        tracing::debug!(
            worker = hello.ordinal,
            master_protocol = hello.protocol_version,
            protocol = self.protocol_version,
            "handshake complete"
        );

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let interrupt = session.interrupt.clone();
        let pump = tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                match &frame {
                    Frame::Urgent(kind) => {
                        interrupt.raise(*kind);
                        if *kind != InterruptKind::Shutdown {
                            continue;
                        }
                    }
                    Frame::Message(Message::Process(_)) => interrupt.clear(),
                    _ => {}
                }
                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let result = session.run(frames_rx).await;
        pump.abort();
        result
    }
}

struct IncomingFile {
    name: String,
    size: u64,
    received: u64,
    fingerprint: FileFingerprint,
    part: PathBuf,
    file: tokio::fs::File,
}

/// State of one master session
struct WorkerSession<'a, W> {
    service: &'a WorkerService,
    ordinal: u32,
    writer: WriteHalf<W>,
    interrupt: Arc<InterruptFlag>,
    log_level: i32,
    group: Option<GroupViewMessage>,
    inputs: Vec<NamedObject>,
    objects: Vec<NamedObject>,
    fingerprints: HashMap<String, FileFingerprint>,
    incoming: Option<IncomingFile>,
    packages: PackageManager,
    enabled: BTreeSet<String>,
}

impl<'a, W> WorkerSession<'a, W>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    fn new(service: &'a WorkerService, ordinal: u32, writer: WriteHalf<W>) -> Result<Self> {
        let options = &service.options;
        std::fs::create_dir_all(&options.cache_dir)
            .with_context(|| format!("Failed to create cache dir {}", options.cache_dir.display()))?;

        let packages = PackageManager::new(
            options.package_dir.clone(),
            options.lock_dir.clone(),
            options.package_lock_template.clone(),
            options.user.clone(),
        )
        .with_builder(service.builder.clone());

        Ok(Self {
            service,
            ordinal,
            writer,
            interrupt: Arc::new(InterruptFlag::default()),
            log_level: 0,
            group: None,
            inputs: Vec::new(),
            objects: Vec::new(),
            fingerprints: HashMap::new(),
            incoming: None,
            packages,
            enabled: BTreeSet::new(),
        })
    }

    fn info(&self) -> WorkerInfoMessage {
        WorkerInfoMessage {
            ordinal: self.ordinal,
            host: self.service.options.host.clone(),
            perf_index: self.service.options.perf_index,
            status: WorkerState::Active,
        }
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        write_frame(&mut self.writer, &msg.into()).await
    }

    async fn log(&mut self, chunk: impl Into<String>) -> Result<()> {
        self.send(Message::LogFile(LogFileMessage { chunk: chunk.into() })).await
    }

    async fn done(&mut self, status: i32) -> Result<()> {
        self.send(Message::LogDone(LogDoneMessage { status })).await
    }

    async fn run(&mut self, mut frames: mpsc::UnboundedReceiver<Frame>) -> Result<()> {
        while let Some(frame) = frames.recv().await {
            match frame {
                Frame::Message(Message::Stop) => {
                    tracing::info!(worker = self.ordinal, "stop requested");
                    break;
                }
                Frame::Message(msg) => self.handle(msg).await?,
                Frame::Raw(chunk) => self.receive_chunk(chunk).await?,
                Frame::Urgent(InterruptKind::Shutdown) => {
                    tracing::info!(worker = self.ordinal, "shutdown requested");
                    break;
                }
                Frame::Urgent(_) => {}
            }
        }

        let _ = self.writer.shutdown().await;
        Ok(())
    }

    async fn handle(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Ping => self.done(0).await,
            Message::GetWorkerInfo => {
                let info = self.info();
                self.send(Message::WorkerInfo(info)).await
            }
            Message::LogLevel(level) => {
                self.log_level = level.level;
                tracing::debug!(worker = self.ordinal, level = level.level, mask = level.mask, "log level set");
                Ok(())
            }
            Message::GroupView(view) => {
                self.group = Some(view);
                Ok(())
            }
            Message::Command(cmd) => self.handle_command(cmd).await,
            Message::Object(obj) => {
                match obj.kind {
                    ObjectKind::Input => self.inputs.push(obj.object),
                    ObjectKind::Generic => self.objects.push(obj.object),
                }
                Ok(())
            }
            Message::Process(job) => self.run_job(job).await,
            Message::File(file) => self.handle_file(file).await,
            Message::Package(pkg) => self.handle_package(pkg).await,
            other => {
                tracing::warn!(worker = self.ordinal, kind = other.kind_name(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, cmd: CommandMessage) -> Result<()> {
        match cmd.kind {
            CommandKind::Exec => {
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&cmd.text)
                    .output()
                    .await;
                match output {
                    Ok(output) => {
                        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                        text.push_str(&String::from_utf8_lossy(&output.stderr));
                        if !text.is_empty() {
                            self.log(text).await?;
                        }
                        self.done(output.status.code().unwrap_or(-1)).await
                    }
                    Err(e) => {
                        self.log(format!("exec failed: {}", e)).await?;
                        self.done(-1).await
                    }
                }
            }
            CommandKind::Print => {
                let summary = format!(
                    "worker {} on {}: log level {}, group {}, {} inputs, {} cached files, {} enabled packages",
                    self.ordinal,
                    self.service.options.host,
                    self.log_level,
                    self.group
                        .map(|g| format!("{}/{}", g.rank, g.size))
                        .unwrap_or_else(|| "-".to_string()),
                    self.inputs.len(),
                    self.fingerprints.len(),
                    self.enabled.len(),
                );
                self.log(summary).await?;
                self.done(0).await
            }
            CommandKind::ShowCache => {
                let files = list_files(&self.service.options.cache_dir)?;
                self.log(format!("cache: {}", files.join(", "))).await?;
                self.done(0).await
            }
            CommandKind::ClearCache => {
                for name in list_files(&self.service.options.cache_dir)? {
                    let path = self.service.options.cache_dir.join(&name);
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(file = %path.display(), error = %e, "failed to remove cached file");
                    }
                }
                self.fingerprints.clear();
                self.done(0).await
            }
        }
    }

    async fn handle_file(&mut self, file: FileMessage) -> Result<()> {
        match file {
            FileMessage::Query { name } => {
                let fingerprint = self.cached_fingerprint(&name);
                self.send(Message::File(FileMessage::Fingerprint { name, fingerprint })).await
            }
            FileMessage::Begin {
                name,
                size,
                fingerprint,
                ..
            } => {
                if name.contains('/') || name.starts_with('.') {
                    self.log(format!("refusing file name {}", name)).await?;
                    return self.done(2).await;
                }
                let part = self.service.options.cache_dir.join(format!(".{}.part", name));
                let file = tokio::fs::File::create(&part)
                    .await
                    .with_context(|| format!("Failed to create {}", part.display()))?;
                self.incoming = Some(IncomingFile {
                    name,
                    size,
                    received: 0,
                    fingerprint,
                    part,
                    file,
                });
                if size == 0 {
                    self.finish_transfer().await?;
                }
                Ok(())
            }
            FileMessage::Fingerprint { .. } => {
                tracing::warn!(worker = self.ordinal, "ignoring fingerprint reply sent to a worker");
                Ok(())
            }
        }
    }

    /// Fingerprint of a cached file, if its content still matches
    fn cached_fingerprint(&self, name: &str) -> Option<FileFingerprint> {
        let recorded = self.fingerprints.get(name)?;
        let path = self.service.options.cache_dir.join(name);
        match hash_file(&path) {
            Ok(hash) if hash == recorded.hash => Some(recorded.clone()),
            _ => None,
        }
    }

    async fn receive_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        let Some(incoming) = self.incoming.as_mut() else {
            tracing::warn!(worker = self.ordinal, bytes = chunk.len(), "raw data outside a transfer");
            return Ok(());
        };

        incoming
            .file
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", incoming.part.display()))?;
        incoming.received += chunk.len() as u64;

        if incoming.received >= incoming.size {
            self.finish_transfer().await?;
        }
        Ok(())
    }

    async fn finish_transfer(&mut self) -> Result<()> {
        let Some(mut incoming) = self.incoming.take() else {
            return Ok(());
        };
        incoming.file.flush().await?;
        drop(incoming.file);

        let dest = self.service.options.cache_dir.join(&incoming.name);
        let verified = incoming.received == incoming.size
            && hash_file(&incoming.part).is_ok_and(|hash| hash == incoming.fingerprint.hash);

        if !verified {
            let _ = std::fs::remove_file(&incoming.part);
            self.fingerprints.remove(&incoming.name);
            self.log(format!("transfer of {} failed verification", incoming.name)).await?;
            return self.done(1).await;
        }

        std::fs::rename(&incoming.part, &dest)
            .with_context(|| format!("Failed to move {} into place", dest.display()))?;
        tracing::debug!(worker = self.ordinal, file = %incoming.name, bytes = incoming.size, "file received");
        self.fingerprints.insert(incoming.name, incoming.fingerprint);
        self.done(0).await
    }

    async fn handle_package(&mut self, pkg: PackageMessage) -> Result<()> {
        let name = pkg.name;
        match pkg.action {
            PackageAction::Build | PackageAction::Load => {
                let archive = self.service.options.cache_dir.join(format!("{}.{}", name, PACKAGE_EXT));
                if archive.exists() {
                    let dest = self.packages.archive_path(&name);
                    std::fs::create_dir_all(self.packages.package_dir())?;
                    std::fs::copy(&archive, &dest)
                        .with_context(|| format!("Failed to install {}", dest.display()))?;
                }
                match self.packages.build_package(&name).await {
                    Ok(outcome) => {
                        tracing::debug!(worker = self.ordinal, package = %name, ?outcome, "package loaded");
                        self.done(0).await
                    }
                    Err(e) => {
                        self.log(format!("{}", e)).await?;
                        self.done(1).await
                    }
                }
            }
            PackageAction::Enable => {
                if self.packages.build_dir(&name).join(BUILT_MARKER).exists() {
                    self.enabled.insert(name);
                    self.done(0).await
                } else {
                    self.log(format!("package {} is not built", name)).await?;
                    self.done(1).await
                }
            }
            PackageAction::Clear => {
                self.enabled.remove(&name);
                let status = self.clear_local(&name);
                self.done(status).await
            }
            PackageAction::ClearAll => {
                self.enabled.clear();
                let mut status = 0;
                for name in self.packages.known_packages()? {
                    status = status.max(self.clear_local(&name));
                }
                self.done(status).await
            }
            PackageAction::Show => {
                let names = self.packages.known_packages()?;
                self.log(format!("packages: {}", names.join(", "))).await?;
                self.done(0).await
            }
            PackageAction::ShowEnabled => {
                let names: Vec<&str> = self.enabled.iter().map(String::as_str).collect();
                self.log(format!("enabled packages: {}", names.join(", "))).await?;
                self.done(0).await
            }
        }
    }

    fn clear_local(&mut self, name: &str) -> i32 {
        let archive = self.packages.archive_path(name);
        let result = self.packages.remove_local(name).and_then(|_| {
            if archive.exists() {
                std::fs::remove_file(&archive).map_err(|e| crate::error::ProofError::io(&archive, e))?;
            }
            Ok(())
        });
        match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(worker = self.ordinal, package = name, error = %e, "clear failed");
                1
            }
        }
    }

    async fn run_job(&mut self, mut job: ProcessMessage) -> Result<()> {
        let mut inputs = self.inputs.clone();
        inputs.append(&mut job.inputs);
        job.inputs = inputs;

        tracing::info!(worker = self.ordinal, selector = %job.selector, entries = job.entries, "job started");

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let control = JobControl::new(events_tx, self.interrupt.clone());
        let runner = self.service.runner.clone();
        let mut task = tokio::task::spawn_blocking(move || runner.run(&job, &control));

        let result = loop {
            tokio::select! {
                Some(event) = events.recv() => self.forward(event).await?,
                result = &mut task => break result,
            }
        };
        while let Ok(event) = events.try_recv() {
            self.forward(event).await?;
        }

        match result {
            Ok(Ok(report)) => {
                self.send(Message::Stats(report.stats)).await?;
                tracing::info!(worker = self.ordinal, status = report.status, "job finished");
                self.done(report.status).await
            }
            Ok(Err(e)) => {
                self.log(format!("job failed: {:#}", e)).await?;
                self.done(1).await
            }
            Err(e) => {
                self.log(format!("job panicked: {}", e)).await?;
                self.done(1).await
            }
        }
    }

    async fn forward(&mut self, event: JobEvent) -> Result<()> {
        let msg = match event {
            JobEvent::Progress { total, processed } => Message::Progress(ProgressMessage { total, processed }),
            JobEvent::Output(object) => Message::Output(object),
            JobEvent::Feedback(objects) => Message::Feedback(objects),
            JobEvent::Log(line) => Message::LogFile(LogFileMessage { chunk: line }),
        };
        self.send(msg).await
    }
}

fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Host name of this machine
pub fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
