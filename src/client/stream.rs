use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::protocol::framing::MessageReader;
use crate::tracker::Watermarks;

use super::worker::StreamWorker;

/// A chunk of WAL (physical) or output plugin data (logical).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    /// WAL position where this data starts.
    pub start_lsn: Lsn,
    /// Server's WAL end at the time of sending (0 for some logical messages).
    pub wal_end: Lsn,
    /// Server send time in microseconds since 2000-01-01.
    pub server_time_micros: i64,
    /// Opaque payload.
    pub data: Bytes,
}

impl WalFrame {
    pub fn server_time(&self) -> std::time::SystemTime {
        crate::protocol::replication::pg_timestamp_to_system_time(self.server_time_micros)
    }
}

/// Why a stream reached [`StreamState::Closed`].
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// `close()` was called (or every handle was dropped).
    Requested,
    /// The server ended the copy stream.
    ServerEnded,
    /// The worker hit a protocol, server or I/O error.
    Failed(PgWireError),
}

/// Lifecycle of a [`ReplicationStream`]: `Active → Closing → Closed`.
#[derive(Debug, Clone)]
pub enum StreamState {
    Active,
    Closing,
    Closed(CloseReason),
}

impl StreamState {
    pub fn is_active(&self) -> bool {
        matches!(self, StreamState::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Physical,
    Logical,
}

pub(crate) enum Command {
    ForceStatusUpdate(oneshot::Sender<Result<()>>),
    Close(Option<oneshot::Sender<()>>),
}

/// State shared between the worker and every handle.
pub(crate) struct Shared {
    pub(crate) watermarks: watch::Sender<Watermarks>,
    pub(crate) state: watch::Sender<StreamState>,
    pub(crate) server_wal_end: watch::Sender<Lsn>,
}

pub(crate) struct StreamParams {
    pub(crate) kind: StreamKind,
    pub(crate) start: Lsn,
    pub(crate) status_interval: Duration,
    pub(crate) server_timeout: Duration,
    pub(crate) config: StreamConfig,
}

/// Cloneable control handle for a [`ReplicationStream`].
///
/// Lets other tasks report progress, force feedback or close the stream
/// while the owning task is blocked in [`ReplicationStream::read_next`].
#[derive(Clone)]
pub struct StreamHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl StreamHandle {
    fn ensure_active(&self) -> Result<()> {
        if self.shared.state.borrow().is_active() {
            Ok(())
        } else {
            Err(PgWireError::Closed)
        }
    }

    /// Raise the flushed watermark. Values at or below the current one are
    /// ignored. The next status update carries the new value.
    pub fn set_flushed(&self, lsn: Lsn) -> Result<()> {
        self.ensure_active()?;
        self.shared
            .watermarks
            .send_if_modified(|w| w.advance_flushed(lsn));
        Ok(())
    }

    /// Raise the applied watermark. Values at or below the current one are
    /// ignored. The next status update carries the new value.
    pub fn set_applied(&self, lsn: Lsn) -> Result<()> {
        self.ensure_active()?;
        self.shared
            .watermarks
            .send_if_modified(|w| w.advance_applied(lsn));
        Ok(())
    }

    /// Send a status update with the current watermarks now, without
    /// waiting for the interval. Resolves once it has been written.
    ///
    /// If the write fails the stream ends and this returns
    /// [`PgWireError::Closed`]; the cause is reported by
    /// [`ReplicationStream::read_next`].
    pub async fn force_status_update(&self) -> Result<()> {
        self.ensure_active()?;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceStatusUpdate(tx))
            .map_err(|_| PgWireError::Closed)?;
        rx.await.map_err(|_| PgWireError::Closed)?
    }

    /// Close the stream: final status update, CopyDone, then release the
    /// connection. Closing an already closed stream is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.shared.state.borrow().is_closed() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(Some(tx))).is_err() {
            // worker already gone
            return Ok(());
        }
        // the sender is dropped unanswered when the worker exits for another
        // reason (or after a concurrent close); either way it is closed now
        let _ = rx.await;
        Ok(())
    }

    pub fn watermarks(&self) -> Watermarks {
        *self.shared.watermarks.borrow()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.state.borrow().is_active()
    }

    /// Latest WAL end reported by the server (XLogData or keepalive).
    pub fn server_wal_end(&self) -> Lsn {
        *self.shared.server_wal_end.borrow()
    }
}

/// A live replication stream.
///
/// Created by [`ReplicationClient`](crate::ReplicationClient) once the server
/// has entered copy mode. A background worker task owns the connection; this
/// handle reads the frames it receives, in server order.
///
/// ```ignore
/// let mut stream = client.start_physical(options).await?;
/// while let Some(frame) = stream.read_next().await? {
///     persist(&frame.data)?;
///     stream.set_flushed(frame.start_lsn)?;
/// }
/// ```
pub struct ReplicationStream {
    frames: mpsc::Receiver<WalFrame>,
    handle: StreamHandle,
    worker: Option<JoinHandle<()>>,
    kind: StreamKind,
    start: Lsn,
    finished: bool,
}

impl ReplicationStream {
    pub(crate) fn spawn<S>(conn: S, messages: MessageReader, params: StreamParams) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (frames_tx, frames_rx) = mpsc::channel(params.config.buffer_frames.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            watermarks: watch::channel(Watermarks::new(params.start)).0,
            state: watch::channel(StreamState::Active).0,
            server_wal_end: watch::channel(Lsn::INVALID).0,
        });

        let kind = params.kind;
        let start = params.start;
        let worker = StreamWorker::new(
            conn,
            messages,
            params,
            shared.clone(),
            frames_tx,
            commands_rx,
        );
        let join = tokio::spawn(worker.run());

        Self {
            frames: frames_rx,
            handle: StreamHandle {
                commands: commands_tx,
                shared,
            },
            worker: Some(join),
            kind,
            start,
            finished: false,
        }
    }

    /// Next frame, in the order the server sent them.
    ///
    /// Returns `Ok(None)` once when the server ends the stream, and the
    /// stream's terminal error once if it failed. Every call after that, or
    /// after `close()`, returns [`PgWireError::Closed`].
    pub async fn read_next(&mut self) -> Result<Option<WalFrame>> {
        if self.finished {
            return Err(PgWireError::Closed);
        }
        if matches!(
            *self.handle.shared.state.borrow(),
            StreamState::Closing | StreamState::Closed(CloseReason::Requested)
        ) {
            self.finished = true;
            return Err(PgWireError::Closed);
        }

        match self.frames.recv().await {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.finished = true;
                match &*self.handle.shared.state.borrow() {
                    StreamState::Closed(CloseReason::Failed(e)) => Err(e.clone()),
                    StreamState::Closed(CloseReason::ServerEnded) => Ok(None),
                    StreamState::Closing | StreamState::Closed(CloseReason::Requested) => {
                        Err(PgWireError::Closed)
                    }
                    StreamState::Active => Err(PgWireError::Task(
                        "replication worker terminated unexpectedly".into(),
                    )),
                }
            }
        }
    }

    /// See [`StreamHandle::set_flushed`].
    pub fn set_flushed(&self, lsn: Lsn) -> Result<()> {
        self.handle.set_flushed(lsn)
    }

    /// See [`StreamHandle::set_applied`].
    pub fn set_applied(&self, lsn: Lsn) -> Result<()> {
        self.handle.set_applied(lsn)
    }

    /// See [`StreamHandle::force_status_update`].
    pub async fn force_status_update(&self) -> Result<()> {
        self.handle.force_status_update().await
    }

    /// Close the stream and wait for the worker to finish.
    pub async fn close(&mut self) -> Result<()> {
        self.handle.close().await?;
        if let Some(join) = self.worker.take() {
            join.await
                .map_err(|e| PgWireError::Task(format!("join error: {e}")))?;
        }
        Ok(())
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn watermarks(&self) -> Watermarks {
        self.handle.watermarks()
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn server_wal_end(&self) -> Lsn {
        self.handle.server_wal_end()
    }

    /// Position streaming started from.
    pub fn start_position(&self) -> Lsn {
        self.start
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }
}

impl Drop for ReplicationStream {
    fn drop(&mut self) {
        if self.worker.is_some() && self.handle.shared.state.borrow().is_active() {
            let _ = self.handle.commands.send(Command::Close(None));
        }
    }
}

impl std::fmt::Debug for ReplicationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationStream")
            .field("kind", &self.kind)
            .field("start", &self.start)
            .field("watermarks", &self.watermarks())
            .field("state", &self.state())
            .finish()
    }
}
