use std::time::Duration;

/// Idle timeout used when the server has `wal_sender_timeout` disabled.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings of the streaming worker.
///
/// These tune how the client behaves once copy mode is entered; what to
/// stream is described by [`ReplicationOptions`](crate::ReplicationOptions).
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bounded buffer size (#frames) between the worker and the reader.
    pub buffer_frames: usize,

    /// If no server message arrives within this interval the stream fails
    /// with an I/O error. A status update asking for a reply is sent at half
    /// the interval first. `None` derives it from the server timeout.
    pub idle_timeout: Option<Duration>,

    /// How long `close()` waits for the server to acknowledge CopyDone.
    pub close_timeout: Duration,

    /// The server's `wal_sender_timeout`. `None` asks the server with
    /// `SHOW wal_sender_timeout` before streaming starts; zero disables the
    /// server-timeout safety margin.
    pub server_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_frames: 8192,
            idle_timeout: None,
            close_timeout: Duration::from_secs(5),
            server_timeout: None,
        }
    }
}

impl StreamConfig {
    /// Idle timeout for a negotiated server timeout.
    pub fn effective_idle_timeout(&self, server_timeout: Duration) -> Duration {
        match self.idle_timeout {
            Some(t) => t,
            None if server_timeout.is_zero() => DEFAULT_IDLE_TIMEOUT,
            None => server_timeout,
        }
    }
}
