use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};

use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::protocol::framing::{BackendMessage, MessageReader, write_copy_data, write_copy_done};
use crate::protocol::messages::ErrorFields;
use crate::protocol::replication::{ReplicationCopyData, current_pg_timestamp, parse_copy_data};
use crate::tracker::PositionTracker;

use super::stream::{CloseReason, Command, Shared, StreamParams, StreamState, WalFrame};

/// Why the streaming loop stopped without an error.
enum Exit {
    CloseRequested(Option<oneshot::Sender<()>>),
    ConsumerGone,
    ServerEnded,
}

/// Owns the connection while a [`ReplicationStream`](super::ReplicationStream)
/// is alive.
pub(crate) struct StreamWorker<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    messages: MessageReader,
    tracker: PositionTracker,
    shared: Arc<Shared>,
    out: Option<mpsc::Sender<WalFrame>>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Frame read off the wire but not yet accepted by the queue. Reading
    /// pauses while it is set.
    pending: Option<WalFrame>,
    idle_timeout: Duration,
    close_timeout: Duration,
    last_activity: Instant,
    reply_asked: bool,
}

impl<S> StreamWorker<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        conn: S,
        messages: MessageReader,
        params: StreamParams,
        shared: Arc<Shared>,
        out: mpsc::Sender<WalFrame>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(conn);
        let now = Instant::now();
        Self {
            reader,
            writer,
            messages,
            tracker: PositionTracker::new(params.status_interval, params.server_timeout, now),
            shared,
            out: Some(out),
            commands,
            pending: None,
            idle_timeout: params.config.effective_idle_timeout(params.server_timeout),
            close_timeout: params.config.close_timeout,
            last_activity: now,
            reply_asked: false,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(
            status_interval = ?self.tracker.effective_interval(),
            idle_timeout = ?self.idle_timeout,
            "replication worker started"
        );

        match self.stream_loop().await {
            Ok(Exit::CloseRequested(ack)) => {
                self.close_gracefully().await;
                self.finish(CloseReason::Requested);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Ok(Exit::ConsumerGone) => {
                tracing::debug!("all stream handles dropped, closing");
                self.close_gracefully().await;
                self.finish(CloseReason::Requested);
            }
            Ok(Exit::ServerEnded) => {
                tracing::info!("server ended the replication stream");
                self.shutdown_writer().await;
                self.finish(CloseReason::ServerEnded);
            }
            Err(e) => {
                tracing::error!("replication worker terminated with error: {e}");
                self.shutdown_writer().await;
                self.finish(CloseReason::Failed(e));
            }
        }
    }

    fn finish(&mut self, reason: CloseReason) {
        // state first: the reader inspects it once the queue reports closed
        self.shared.state.send_replace(StreamState::Closed(reason));
        self.pending = None;
        self.out = None;
    }

    async fn stream_loop(&mut self) -> Result<Exit> {
        loop {
            let reading = self.pending.is_none();
            let ask_at = self.last_activity + self.idle_timeout / 2;
            let idle_at = self.last_activity + self.idle_timeout;

            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::ForceStatusUpdate(ack)) => {
                        let res = self.send_status_update(false, self.idle_timeout).await;
                        // a failed write ends the stream; the reader gets the cause
                        let _ = ack.send(if res.is_ok() { Ok(()) } else { Err(PgWireError::Closed) });
                        res?;
                    }
                    Some(Command::Close(ack)) => return Ok(Exit::CloseRequested(ack)),
                    None => return Ok(Exit::ConsumerGone),
                },

                _ = sleep_until(self.tracker.next_due()) => {
                    self.send_status_update(false, self.idle_timeout).await?;
                }

                msg = self.messages.read(&mut self.reader), if reading => {
                    let msg = msg?;
                    self.last_activity = Instant::now();
                    self.reply_asked = false;
                    if let Some(exit) = self.handle_message(msg).await? {
                        return Ok(exit);
                    }
                }

                permit = reserve_slot(self.out.clone()), if !reading => match permit {
                    Some(permit) => {
                        if let Some(frame) = self.pending.take() {
                            permit.send(frame);
                        }
                        // the server was not read while we waited on the consumer
                        self.last_activity = Instant::now();
                        self.reply_asked = false;
                    }
                    None => return Ok(Exit::ConsumerGone),
                },

                _ = sleep_until(ask_at), if reading && !self.reply_asked => {
                    tracing::debug!("no server message for {:?}, asking for a reply", self.idle_timeout / 2);
                    self.reply_asked = true;
                    self.send_status_update(true, self.idle_timeout).await?;
                }

                _ = sleep_until(idle_at), if reading => {
                    return Err(PgWireError::Io(format!(
                        "replication idle timeout: no server message for {:?}",
                        self.idle_timeout
                    )));
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: BackendMessage) -> Result<Option<Exit>> {
        match msg.tag {
            b'd' => match parse_copy_data(msg.payload)? {
                ReplicationCopyData::XLogData {
                    wal_start,
                    wal_end,
                    server_time_micros,
                    data,
                } => {
                    self.shared
                        .watermarks
                        .send_if_modified(|w| w.observe_received(wal_start));
                    self.note_server_wal_end(wal_end);
                    tracing::trace!(%wal_start, %wal_end, len = data.len(), "xlogdata");

                    let frame = WalFrame {
                        start_lsn: wal_start,
                        wal_end,
                        server_time_micros,
                        data,
                    };
                    return Ok(self.deliver(frame));
                }
                ReplicationCopyData::KeepAlive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    self.note_server_wal_end(wal_end);
                    tracing::trace!(%wal_end, reply_requested, "keepalive");
                    if reply_requested || self.tracker.liveness_overdue(Instant::now()) {
                        self.send_status_update(false, self.idle_timeout).await?;
                    }
                }
            },
            b'c' => {
                tracing::debug!("server sent CopyDone");
                if let Err(e) = self.send_status_update(false, self.close_timeout).await {
                    tracing::warn!("final status update failed: {e}");
                }
                bounded_write(
                    self.close_timeout,
                    "CopyDone",
                    write_copy_done(&mut self.writer),
                )
                .await?;
                match timeout(self.close_timeout, self.drain_copy()).await {
                    Ok(res) => res?,
                    Err(_) => tracing::warn!(
                        "server did not finish the copy within {:?}",
                        self.close_timeout
                    ),
                }
                return Ok(Some(Exit::ServerEnded));
            }
            b'E' => return Err(PgWireError::Server(ErrorFields::parse(&msg.payload))),
            b'N' => {
                let notice = ErrorFields::parse(&msg.payload);
                tracing::warn!("server notice: {notice}");
            }
            b'S' => {}
            tag => {
                return Err(PgWireError::Protocol(format!(
                    "unexpected message '{}' (0x{tag:02x}) in copy mode",
                    char::from(tag)
                )));
            }
        }
        Ok(None)
    }

    /// Hand a frame to the queue, parking it when the queue is full.
    fn deliver(&mut self, frame: WalFrame) -> Option<Exit> {
        let Some(out) = &self.out else {
            return Some(Exit::ConsumerGone);
        };
        match out.try_send(frame) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::trace!("frame queue full, pausing reads");
                self.pending = Some(frame);
                None
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Some(Exit::ConsumerGone),
        }
    }

    fn note_server_wal_end(&self, wal_end: Lsn) {
        self.shared.server_wal_end.send_if_modified(|cur| {
            if wal_end > *cur {
                *cur = wal_end;
                true
            } else {
                false
            }
        });
    }

    /// Send a status update, failing if the channel does not take it within
    /// `limit`.
    async fn send_status_update(&mut self, reply_requested: bool, limit: Duration) -> Result<()> {
        let marks = *self.shared.watermarks.borrow();
        let update = self
            .tracker
            .status_update(marks, current_pg_timestamp(), reply_requested);
        let payload = update.encode();
        bounded_write(
            limit,
            "status update",
            write_copy_data(&mut self.writer, &payload),
        )
        .await?;
        self.tracker.record_sent(Instant::now());
        tracing::debug!(
            received = %update.received,
            flushed = %update.flushed,
            applied = %update.applied,
            reply_requested,
            "sent standby status update"
        );
        Ok(())
    }

    /// Final status update, CopyDone, then wait for the server to finish the
    /// copy. Every step is bounded by `close_timeout`; failures are logged
    /// since the stream is closing anyway.
    async fn close_gracefully(&mut self) {
        self.shared.state.send_replace(StreamState::Closing);
        self.pending = None;
        self.out = None;

        if let Err(e) = self.send_status_update(false, self.close_timeout).await {
            // a half-written update leaves nothing sensible to follow it with
            tracing::warn!("final status update failed: {e}");
            self.shutdown_writer().await;
            return;
        }
        let copy_done = bounded_write(
            self.close_timeout,
            "CopyDone",
            write_copy_done(&mut self.writer),
        )
        .await;
        if let Err(e) = copy_done {
            tracing::warn!("failed to send CopyDone: {e}");
        } else {
            match timeout(self.close_timeout, self.drain_copy()).await {
                Ok(Ok(())) => tracing::debug!("server acknowledged CopyDone"),
                Ok(Err(e)) => tracing::warn!("error while finishing copy: {e}"),
                Err(_) => tracing::warn!(
                    "server did not acknowledge CopyDone within {:?}",
                    self.close_timeout
                ),
            }
        }
        self.shutdown_writer().await;
    }

    async fn shutdown_writer(&mut self) {
        match timeout(self.close_timeout, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("shutdown of the write half failed: {e}"),
            Err(_) => tracing::warn!("write half did not shut down within {:?}", self.close_timeout),
        }
    }

    /// Read until ReadyForQuery, skipping trailing CopyData and any result
    /// set the server sends after the copy ends.
    async fn drain_copy(&mut self) -> Result<()> {
        loop {
            let msg = self.messages.read(&mut self.reader).await?;
            match msg.tag {
                b'Z' => return Ok(()),
                b'E' => return Err(PgWireError::Server(ErrorFields::parse(&msg.payload))),
                _ => {}
            }
        }
    }
}

/// Run a write to the server, giving up once `limit` passes. A peer that
/// stops reading would otherwise park the worker forever.
async fn bounded_write<F>(limit: Duration, what: &str, write: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match timeout(limit, write).await {
        Ok(res) => res,
        Err(_) => Err(PgWireError::Io(format!(
            "replication idle timeout: {what} write blocked for {limit:?}"
        ))),
    }
}

async fn reserve_slot(out: Option<mpsc::Sender<WalFrame>>) -> Option<mpsc::OwnedPermit<WalFrame>> {
    out?.reserve_owned().await.ok()
}
