//! Unix socket transport for the control channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐  Unix Socket  ┌──────────────────────────┐
//! │     Companion app        │←─────────────→│     Filter process       │
//! │  ┌──────────────────┐    │     JSON      │  ┌──────────────────┐    │
//! │  │ SocketConnection │    │               │  │ ControlSocket    │    │
//! │  │                  │    │               │  │ Server           │    │
//! │  └──────────────────┘    │               │  └──────────────────┘    │
//! └──────────────────────────┘               └──────────────────────────┘
//! ```
//!
//! # Message Framing
//!
//! ```text
//! [4 bytes: message length (big-endian u32)]
//! [N bytes: JSON-serialized message]
//! ```
//!
//! Each call registers a one-shot completion slot under a fresh id. The
//! reader task removes the slot before completing it, so a reply resumes
//! its caller at most once; a caller that gives up (timeout, cancellation)
//! removes its own slot on drop.

use super::channel::{ConnectionFactory, ControlConnection};
use super::error::{ControlError, ControlResult};
use super::protocol::{AppToFilter, ControlReply, ControlRequest, FilterToApp};
use crate::filter::ReportedDecision;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,
    /// Message too large.
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
}

/// Maximum message size (16 MB should be plenty).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Result type for socket operations.
pub type SocketResult<T> = Result<T, SocketError>;

const CHANNEL_SIZE: usize = 64;

/// Server-side socket for the filter process.
///
/// Accepts any number of app connections, one at a time.
pub struct ControlSocketServer {
    /// Bound before a runtime exists; converted on first accept.
    std_listener: Option<StdUnixListener>,
    listener: Option<UnixListener>,
    socket_path: PathBuf,
}

impl ControlSocketServer {
    /// Bind a new socket server at the given path.
    ///
    /// This will remove any existing socket file at the path. Uses std's
    /// `UnixListener` so it can be called outside of a tokio runtime.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> SocketResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = StdUnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        info!("Control socket server listening on {:?}", socket_path);

        Ok(Self {
            std_listener: Some(listener),
            listener: None,
            socket_path,
        })
    }

    /// Accept the next app connection.
    pub async fn accept(&mut self) -> SocketResult<ServerConnection> {
        if self.listener.is_none() {
            let std_listener = self
                .std_listener
                .take()
                .ok_or_else(|| io::Error::other("listener already consumed"))?;
            self.listener = Some(UnixListener::from_std(std_listener)?);
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::other("listener unavailable"))?;

        let (stream, _addr) = listener.accept().await?;
        info!("App connected to control socket");
        Ok(ServerConnection::spawn(stream))
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlSocketServer {
    fn drop(&mut self) {
        if self.socket_path.exists()
            && let Err(e) = std::fs::remove_file(&self.socket_path)
        {
            warn!("Failed to remove socket file: {}", e);
        }
    }
}

/// One accepted app connection, as seen by the filter.
#[derive(Debug)]
pub struct ServerConnection {
    /// Messages to the app.
    pub tx: mpsc::Sender<FilterToApp>,
    /// Messages from the app.
    pub rx: mpsc::Receiver<AppToFilter>,
}

impl ServerConnection {
    fn spawn(stream: UnixStream) -> Self {
        let (to_app_tx, to_app_rx) = mpsc::channel::<FilterToApp>(CHANNEL_SIZE);
        let (from_app_tx, from_app_rx) = mpsc::channel::<AppToFilter>(CHANNEL_SIZE);
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(async move {
            if let Err(e) = socket_reader(read_half, from_app_tx).await
                && !matches!(e, SocketError::ConnectionClosed)
            {
                error!("Socket reader error: {}", e);
            }
            debug!("Server socket reader task finished");
        });

        tokio::spawn(async move {
            if let Err(e) = socket_writer(write_half, to_app_rx).await
                && !matches!(e, SocketError::ConnectionClosed)
            {
                error!("Socket writer error: {}", e);
            }
            debug!("Server socket writer task finished");
        });

        Self {
            tx: to_app_tx,
            rx: from_app_rx,
        }
    }
}

type ReplySlot = oneshot::Sender<Result<ControlReply, String>>;
type PendingCalls = Arc<Mutex<HashMap<u64, ReplySlot>>>;

/// Live app-side connection to the filter's control socket.
pub struct SocketConnection {
    outgoing: mpsc::Sender<AppToFilter>,
    pending: PendingCalls,
    next_id: AtomicU64,
    tasks: [JoinHandle<()>; 2],
}

impl SocketConnection {
    /// Connect to the filter's control socket.
    ///
    /// Unsolicited decision reports are forwarded to `decisions` when set.
    pub async fn connect(
        socket_path: &Path,
        decisions: Option<mpsc::Sender<Vec<ReportedDecision>>>,
    ) -> ControlResult<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| ControlError::from_connect(&e))?;
        debug!("Connected to control socket at {:?}", socket_path);

        let (outgoing, outgoing_rx) = mpsc::channel::<AppToFilter>(CHANNEL_SIZE);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (read_half, write_half) = stream.into_split();

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            if let Err(e) = reply_reader(read_half, &reader_pending, decisions).await
                && !matches!(e, SocketError::ConnectionClosed)
            {
                error!("Control reply reader error: {}", e);
            }
            // Dropping the slots wakes every waiting caller with ConnectionMissing.
            reader_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            debug!("Client socket reader task finished");
        });

        let writer = tokio::spawn(async move {
            if let Err(e) = socket_writer(write_half, outgoing_rx).await
                && !matches!(e, SocketError::ConnectionClosed)
            {
                error!("Control request writer error: {}", e);
            }
            debug!("Client socket writer task finished");
        });

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            tasks: [reader, writer],
        })
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Removes a call's slot if the caller stops waiting before the reply.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[async_trait]
impl ControlConnection for SocketConnection {
    async fn call(&self, request: ControlRequest) -> ControlResult<ControlReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, reply) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // A finished reader already cleared the table and will never answer.
        if self.tasks[0].is_finished() {
            return Err(ControlError::ConnectionMissing);
        }

        debug!("Control call {} ({})", id, request.name());
        self.outgoing
            .send(AppToFilter::Request { id, request })
            .await
            .map_err(|_| ControlError::ConnectionMissing)?;

        match reply.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(ControlError::ReplyError(message)),
            Err(_) => Err(ControlError::ConnectionMissing),
        }
    }
}

/// Opens [`SocketConnection`]s to a fixed socket path.
#[derive(Debug, Clone)]
pub struct SocketConnectionFactory {
    socket_path: PathBuf,
    decisions: Option<mpsc::Sender<Vec<ReportedDecision>>>,
}

impl SocketConnectionFactory {
    /// Factory for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            decisions: None,
        }
    }

    /// Forward streamed decisions from every connection to `sink`.
    pub fn with_decision_sink(mut self, sink: mpsc::Sender<Vec<ReportedDecision>>) -> Self {
        self.decisions = Some(sink);
        self
    }
}

#[async_trait]
impl ConnectionFactory for SocketConnectionFactory {
    async fn connect(&self) -> ControlResult<Arc<dyn ControlConnection>> {
        let connection = SocketConnection::connect(&self.socket_path, self.decisions.clone()).await?;
        Ok(Arc::new(connection))
    }
}

/// Read a length-prefixed message from the stream.
async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> SocketResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(SocketError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(SocketError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(SocketError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed message to the stream.
async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> SocketResult<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(SocketError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}

/// Read framed messages into a channel until EOF or the receiver goes away.
///
/// Frames that fail to decode are skipped; framing itself stays intact.
async fn socket_reader<T: DeserializeOwned>(
    mut reader: tokio::net::unix::OwnedReadHalf,
    tx: mpsc::Sender<T>,
) -> SocketResult<()> {
    loop {
        let data = read_message(&mut reader).await?;
        let msg: T = match serde_json::from_slice(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping undecodable control message: {}", e);
                continue;
            }
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Write messages from a channel as frames until the channel closes.
async fn socket_writer<T: Serialize>(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::Receiver<T>,
) -> SocketResult<()> {
    while let Some(msg) = rx.recv().await {
        let data = serde_json::to_vec(&msg)?;
        write_message(&mut writer, &data).await?;
    }
    Ok(())
}

/// App-side reader: completes pending calls and forwards decision reports.
async fn reply_reader(
    mut reader: tokio::net::unix::OwnedReadHalf,
    pending: &PendingCalls,
    decisions: Option<mpsc::Sender<Vec<ReportedDecision>>>,
) -> SocketResult<()> {
    loop {
        let data = read_message(&mut reader).await?;
        let msg: FilterToApp = match serde_json::from_slice(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping undecodable filter message: {}", e);
                continue;
            }
        };

        match msg {
            FilterToApp::Reply { id, result } => {
                let slot = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(result);
                    }
                    None => debug!("Reply {} arrived after its caller gave up", id),
                }
            }
            FilterToApp::Decisions(batch) => {
                if let Some(sink) = &decisions
                    && sink.try_send(batch).is_err()
                {
                    warn!("Decision sink full or closed, dropping batch");
                }
            }
        }
    }
}
