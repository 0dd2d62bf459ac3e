//! Master/worker protocol
//!
//! This module defines the messages exchanged between the master and its
//! workers. Messages are serialized with MessagePack (rmp-serde); bulk file
//! data and urgent interrupts travel in their own frame types so they never
//! pay for structured encoding.
//!
//! # Protocol Version
//!
//! Current version: 3
//!
//! - 1 -> 2: new arguments for the PROCESS command
//! - 2 -> 3: package enabling protocol changed
//!
//! # Message Flow
//!
//! ```text
//! Master                          Worker
//!     |                              |
//!     |-------- HELLO(v) ----------->|
//!     |<------- HELLO(v, info) ------|
//!     |                              |
//!     |-- LOGLEVEL / GROUPVIEW ----->|
//!     |                              |
//!     |-- FILE(query) -------------->|
//!     |<----- FILE(fingerprint) -----|
//!     |-- FILE(begin) + RAW... ----->|
//!     |<------- LOGDONE(0) ----------|
//!     |                              |
//!     |-------- PROCESS ------------>|
//!     |<----- PROGRESS / OUTPUT -----|
//!     |======= URGENT(hard) ========>|  (out of band)
//!     |<------- STATS ---------------|
//!     |<------- LOGDONE(status) -----|
//! ```
//!
//! # Frame Format
//!
//! ```text
//! [4 bytes: body length (little-endian u32)][1 byte: frame tag][N bytes: body]
//! ```
//!
//! Tag 0 carries a MessagePack `Message`, tag 1 raw bytes, tag 2 a one-byte
//! interrupt code.

use crate::cache::FileFingerprint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version a session may negotiate down to
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// First version with the current package enabling protocol
pub const PACKAGE_PROTOCOL_VERSION: u32 = 3;

/// IANA registered port for this service
pub const DEFAULT_PORT: u16 = 1093;

/// Frames larger than this are rejected
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

const TAG_MESSAGE: u8 = 0;
const TAG_RAW: u8 = 1;
const TAG_URGENT: u8 = 2;

/// Negotiate the session protocol version
///
/// Returns `None` when the common version falls below the supported range.
pub fn negotiate_version(client: u32, worker: u32) -> Option<u32> {
    let negotiated = client.min(worker);
    (negotiated >= MIN_PROTOCOL_VERSION).then_some(negotiated)
}

/// Urgent interrupt kinds
///
/// Delivered ahead of any queued normal traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterruptKind {
    /// Abandon in-flight work immediately
    Hard,
    /// Stop after the current unit of work
    Soft,
    /// Abandon work and tear down the connection
    Shutdown,
}

impl InterruptKind {
    pub fn code(self) -> u8 {
        match self {
            InterruptKind::Hard => 1,
            InterruptKind::Soft => 2,
            InterruptKind::Shutdown => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(InterruptKind::Hard),
            2 => Some(InterruptKind::Soft),
            3 => Some(InterruptKind::Shutdown),
            _ => None,
        }
    }
}

/// Tag carried by short textual commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Execute a command line on the worker
    Exec,
    /// Print worker status into the log stream
    Print,
    /// List the worker file cache
    ShowCache,
    /// Remove every file from the worker cache
    ClearCache,
}

/// Tag carried by structured objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Member of the job input list
    Input,
    /// Any other object
    Generic,
}

/// A named, opaquely encoded object
///
/// The payload encoding belongs to the job layer and is never inspected here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedObject {
    pub name: String,
    pub payload: Vec<u8>,
}

impl NamedObject {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Worker status as reported in self-descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Active,
    NotActive,
    Bad,
}

/// Package directives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageAction {
    Build,
    Load,
    Enable,
    Clear,
    ClearAll,
    Show,
    ShowEnabled,
}

/// Protocol message
///
/// All structured messages exchanged between master and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Version handshake (both directions)
    Hello(HelloMessage),

    /// Plain textual command (Master → Worker)
    Command(CommandMessage),

    /// Structured object (Master → Worker)
    Object(ObjectMessage),

    /// Job submission (Master → Worker)
    Process(ProcessMessage),

    /// Chunk of the worker log stream (Worker → Master)
    LogFile(LogFileMessage),

    /// Completion of the current request (Worker → Master)
    LogDone(LogDoneMessage),

    /// Request a self-description (Master → Worker)
    GetWorkerInfo,

    /// Self-description (Worker → Master)
    WorkerInfo(WorkerInfoMessage),

    /// Liveness check (Master → Worker), answered with LOGDONE
    Ping,

    /// Fingerprint query, fingerprint reply or transfer header
    File(FileMessage),

    /// Package directive (Master → Worker)
    Package(PackageMessage),

    /// Session log level (Master → Worker)
    LogLevel(LogLevelMessage),

    /// Position of the worker in the active group (Master → Worker)
    GroupView(GroupViewMessage),

    /// Intermediate or final result object (Worker → Master)
    Output(NamedObject),

    /// Progress of the running job (Worker → Master)
    Progress(ProgressMessage),

    /// Feedback objects of the running job (Worker → Master)
    Feedback(Vec<NamedObject>),

    /// Resource usage counters (Worker → Master)
    Stats(WorkerStats),

    /// End of session (Master → Worker)
    Stop,
}

impl Message {
    /// Short name of the message kind, used in logs and violations
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "HELLO",
            Message::Command(_) => "STRING",
            Message::Object(_) => "OBJECT",
            Message::Process(_) => "PROCESS",
            Message::LogFile(_) => "LOGFILE",
            Message::LogDone(_) => "LOGDONE",
            Message::GetWorkerInfo => "GETSLAVEINFO",
            Message::WorkerInfo(_) => "SLAVEINFO",
            Message::Ping => "PING",
            Message::File(_) => "FILE",
            Message::Package(_) => "PACKAGE",
            Message::LogLevel(_) => "LOGLEVEL",
            Message::GroupView(_) => "GROUPVIEW",
            Message::Output(_) => "OUTPUT",
            Message::Progress(_) => "PROGRESS",
            Message::Feedback(_) => "FEEDBACK",
            Message::Stats(_) => "STATS",
            Message::Stop => "STOP",
        }
    }

    pub fn command(kind: CommandKind, text: impl Into<String>) -> Self {
        Message::Command(CommandMessage {
            kind,
            text: text.into(),
        })
    }
}

/// Handshake message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Highest protocol version the sender speaks
    pub protocol_version: u32,

    /// Ordinal the master assigned to this worker
    pub ordinal: u32,

    /// Worker self-description (absent when sent by the master)
    pub info: Option<WorkerInfoMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub kind: CommandKind,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMessage {
    pub kind: ObjectKind,
    pub object: NamedObject,
}

/// Job submission parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMessage {
    /// Opaque dataset description
    pub dataset: String,

    /// Selector (job entry point) name
    pub selector: String,

    /// Free-form option string
    pub options: String,

    /// Number of entries to process (-1 for all)
    pub entries: i64,

    /// First entry to process
    pub first_entry: i64,

    /// Input list
    pub inputs: Vec<NamedObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileMessage {
    pub chunk: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogDoneMessage {
    /// Zero on success
    pub status: i32,
}

/// Worker self-description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfoMessage {
    pub ordinal: u32,
    pub host: String,
    pub perf_index: i32,
    pub status: WorkerState,
}

/// File cache sub-protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileMessage {
    /// Ask for the worker's fingerprint of `name`
    Query { name: String },

    /// Worker's current fingerprint (None if the file is absent)
    Fingerprint {
        name: String,
        fingerprint: Option<FileFingerprint>,
    },

    /// Announces `size` bytes of RAW frames carrying `name`
    Begin {
        name: String,
        size: u64,
        binary: bool,
        fingerprint: FileFingerprint,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMessage {
    pub action: PackageAction,
    /// Package name (empty for ClearAll/Show)
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogLevelMessage {
    pub level: i32,
    pub mask: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GroupViewMessage {
    /// Position among active workers (0-based)
    pub rank: u32,
    /// Number of active workers
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub total: i64,
    pub processed: i64,
}

/// Resource usage reported by a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub bytes_read: u64,
    /// Wall-clock seconds
    pub real_time: f32,
    /// CPU seconds
    pub cpu_time: f32,
}

/// Wire frame
#[derive(Debug, Clone)]
pub enum Frame {
    Message(Message),
    Raw(Vec<u8>),
    Urgent(InterruptKind),
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        Frame::Message(msg)
    }
}

/// Serialize a frame to bytes, including the length prefix and tag
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>> {
    match frame {
        Frame::Message(msg) => serialize_message(msg),
        Frame::Raw(bytes) => serialize_raw(bytes),
        Frame::Urgent(kind) => frame_body(TAG_URGENT, &[kind.code()]),
    }
}

/// Serialize a structured message as a complete frame
///
/// Broadcasts encode once and share the bytes between workers.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(msg).context("Failed to serialize message")?;
    frame_body(TAG_MESSAGE, &body)
}

/// Frame a raw byte buffer
pub fn serialize_raw(bytes: &[u8]) -> Result<Vec<u8>> {
    frame_body(TAG_RAW, bytes)
}

fn frame_body(tag: u8, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max {})", body.len(), MAX_FRAME_LEN);
    }

    let mut framed = Vec::with_capacity(5 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.push(tag);
    framed.extend_from_slice(body);

    Ok(framed)
}

/// Deserialize a frame from bytes
///
/// Returns (frame, bytes_consumed) where bytes_consumed includes the header.
pub fn deserialize_frame(buf: &[u8]) -> Result<(Frame, usize)> {
    if buf.len() < 5 {
        anyhow::bail!("Buffer too small for frame header (need 5 bytes, got {})", buf.len());
    }

    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 5 + body_len {
        anyhow::bail!("Incomplete frame (need {} bytes, got {})", 5 + body_len, buf.len());
    }

    let frame = decode_body(buf[4], &buf[5..5 + body_len])?;
    Ok((frame, 5 + body_len))
}

fn decode_body(tag: u8, body: &[u8]) -> Result<Frame> {
    match tag {
        TAG_MESSAGE => {
            let msg = rmp_serde::from_slice(body).context("Failed to deserialize message")?;
            Ok(Frame::Message(msg))
        }
        TAG_RAW => Ok(Frame::Raw(body.to_vec())),
        TAG_URGENT => {
            let code = body.first().copied().unwrap_or_default();
            InterruptKind::from_code(code)
                .map(Frame::Urgent)
                .with_context(|| format!("Unknown interrupt code {}", code))
        }
        other => anyhow::bail!("Unknown frame tag {}", other),
    }
}

/// Read a complete frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; 5];
    reader
        .read_exact(&mut header)
        .await
        .context("Failed to read frame header")?;

    let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if body_len > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max {})", body_len, MAX_FRAME_LEN);
    }

    let mut body = vec![0u8; body_len];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;

    decode_body(header[4], &body)
}

/// Write a frame to a stream and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let framed = serialize_frame(frame)?;

    writer
        .write_all(&framed)
        .await
        .context("Failed to write frame")?;
    writer.flush().await.context("Failed to flush stream")?;

    Ok(())
}
