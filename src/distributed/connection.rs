//! Worker connections
//!
//! A `Connection` owns one bidirectional stream to a worker. The stream is
//! split in two background tasks:
//!
//! - a **reader pump** decoding frames and forwarding them, tagged with the
//!   worker ordinal, into the session `Monitor` inbox
//! - a **writer** fed by two queues: the normal queue (acknowledged sends)
//!   and the urgent queue. The writer always drains the urgent queue first,
//!   so an interrupt overtakes every normal frame not yet on the wire.
//!   Frames are never interleaved: an urgent frame waits for the frame
//!   currently being written.

use crate::coordinator::registry::Ordinal;
use crate::distributed::protocol::*;
use crate::error::{ProofError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Depth of the normal outbound queue
const OUTBOUND_DEPTH: usize = 16;

/// Event delivered by a reader pump
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// The stream ended (None) or failed (Some(reason))
    Closed(Option<String>),
}

/// Inbound event tagged with its worker
#[derive(Debug)]
pub struct Envelope {
    pub ordinal: Ordinal,
    pub event: Inbound,
}

pub type InboxSender = mpsc::UnboundedSender<Envelope>;

struct Outbound {
    bytes: Arc<Vec<u8>>,
    done: oneshot::Sender<std::result::Result<(), String>>,
}

/// Sender half of a worker's urgent path
///
/// Cheap to clone and usable from any task.
#[derive(Debug, Clone)]
pub struct UrgentSender {
    ordinal: Ordinal,
    tx: mpsc::UnboundedSender<InterruptKind>,
}

impl UrgentSender {
    pub fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    pub fn send(&self, kind: InterruptKind) -> Result<()> {
        self.tx
            .send(kind)
            .map_err(|_| ProofError::worker(self.ordinal, "urgent channel closed"))
    }
}

/// Connection to one worker process
pub struct Connection {
    ordinal: Ordinal,
    normal: Option<mpsc::Sender<Outbound>>,
    urgent: Option<UrgentSender>,
    send_timeout: Duration,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Attach a handshaken stream to the session inbox
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(ordinal: Ordinal, stream: S, inbox: InboxSender, send_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (normal_tx, normal_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(reader_pump(ordinal, reader, inbox));
        let writer_task = tokio::spawn(writer_loop(ordinal, writer, normal_rx, urgent_rx));

        Self {
            ordinal,
            normal: Some(normal_tx),
            urgent: Some(UrgentSender {
                ordinal,
                tx: urgent_tx,
            }),
            send_timeout,
            reader: Some(reader_task),
            writer: Some(writer_task),
        }
    }

    /// A connection that refuses every send (for workers that never attached)
    pub(crate) fn closed(ordinal: Ordinal) -> Self {
        Self {
            ordinal,
            normal: None,
            urgent: None,
            send_timeout: Duration::from_secs(1),
            reader: None,
            writer: None,
        }
    }

    pub fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    pub fn is_open(&self) -> bool {
        self.normal.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Send a structured message and wait until it is flushed
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let bytes = serialize_message(msg).map_err(|e| ProofError::transport(format!("{:#}", e)))?;
        self.send_encoded(Arc::new(bytes)).await
    }

    /// Send a raw byte buffer as one RAW frame
    pub async fn send_raw(&self, buffer: &[u8]) -> Result<()> {
        let bytes = serialize_raw(buffer).map_err(|e| ProofError::transport(format!("{:#}", e)))?;
        self.send_encoded(Arc::new(bytes)).await
    }

    /// Send an already framed buffer
    pub async fn send_encoded(&self, bytes: Arc<Vec<u8>>) -> Result<()> {
        let tx = self
            .normal
            .as_ref()
            .ok_or_else(|| ProofError::worker(self.ordinal, "connection closed"))?;

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Outbound { bytes, done: done_tx })
            .await
            .map_err(|_| ProofError::worker(self.ordinal, "connection closed"))?;

        match tokio::time::timeout(self.send_timeout, done_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ProofError::worker(self.ordinal, reason)),
            Ok(Err(_)) => Err(ProofError::worker(self.ordinal, "writer stopped")),
            Err(_) => Err(ProofError::worker(
                self.ordinal,
                format!("send timed out after {:?}", self.send_timeout),
            )),
        }
    }

    /// Queue an urgent interrupt ahead of normal traffic
    pub fn send_urgent(&self, kind: InterruptKind) -> Result<()> {
        match &self.urgent {
            Some(urgent) => urgent.send(kind),
            None => Err(ProofError::worker(self.ordinal, "connection closed")),
        }
    }

    pub fn urgent_sender(&self) -> Option<UrgentSender> {
        self.urgent.clone()
    }

    /// Tear down both directions immediately
    pub fn close(&mut self) {
        self.normal = None;
        self.urgent = None;
        for task in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            task.abort();
        }
    }

    /// Let the writer flush queued urgent frames, then tear down
    pub async fn shutdown(&mut self, grace: Duration) {
        self.normal = None;
        self.urgent = None;
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(grace, writer).await.is_err() {
                abort.abort();
            }
        }
        self.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("ordinal", &self.ordinal)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn reader_pump<R>(ordinal: Ordinal, mut reader: R, inbox: InboxSender)
where
    R: AsyncRead + Unpin,
{
    loop {
        let event = match read_frame(&mut reader).await {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => {
                let eof = e
                    .chain()
                    .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
                    .any(|io| io.kind() == std::io::ErrorKind::UnexpectedEof);
                let reason = if eof { None } else { Some(format!("{:#}", e)) };
                let _ = inbox.send(Envelope {
                    ordinal,
                    event: Inbound::Closed(reason),
                });
                return;
            }
        };

        if inbox.send(Envelope { ordinal, event }).is_err() {
            return;
        }
    }
}

async fn writer_loop<W>(
    ordinal: Ordinal,
    mut writer: W,
    mut normal: mpsc::Receiver<Outbound>,
    mut urgent: mpsc::UnboundedReceiver<InterruptKind>,
) where
    W: AsyncWrite + Unpin,
{
    let mut urgent_open = true;

    loop {
        tokio::select! {
            biased;

            kind = urgent.recv(), if urgent_open => match kind {
                Some(kind) => {
                    tracing::debug!(worker = ordinal, ?kind, "sending urgent interrupt");
                    if let Err(e) = write_frame(&mut writer, &Frame::Urgent(kind)).await {
                        tracing::debug!(worker = ordinal, error = %format!("{:#}", e), "urgent write failed");
                        break;
                    }
                }
                None => urgent_open = false,
            },

            out = normal.recv() => match out {
                Some(out) => {
                    let result = write_encoded(&mut writer, &out.bytes).await;
                    let failed = result.is_err();
                    let _ = out.done.send(result);
                    if failed {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::result::Result<(), String> {
    writer.write_all(bytes).await.map_err(|e| format!("write failed: {}", e))?;
    writer.flush().await.map_err(|e| format!("flush failed: {}", e))
}

/// Master side of the version handshake
///
/// Sends HELLO with the assigned ordinal and waits for the worker's HELLO.
pub async fn handshake<S>(stream: &mut S, ordinal: Ordinal, timeout: Duration) -> Result<HelloMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let hello = Message::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            ordinal,
            info: None,
        });
        write_frame(stream, &hello.into()).await?;

        match read_frame(stream).await? {
            Frame::Message(Message::Hello(reply)) => Ok(reply),
            Frame::Message(other) => anyhow::bail!("Expected HELLO, got {}", other.kind_name()),
            _ => anyhow::bail!("Expected HELLO, got a non-message frame"),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(ProofError::worker(ordinal, format!("handshake failed: {:#}", e))),
        Err(_) => Err(ProofError::worker(ordinal, "handshake timed out")),
    }
}
