//! Watermark bookkeeping and status-update timing.
//!
//! Nothing in here performs I/O; the streaming worker feeds it the current
//! time and asks what (and when) to report.

use std::time::Duration;

use tokio::time::Instant;

use crate::lsn::Lsn;
use crate::protocol::replication::StandbyStatusUpdate;

/// The three positions reported back to the server.
///
/// `applied <= flushed <= received` holds after every mutation: raising a
/// later watermark lifts the earlier ones with it, and lowering is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    received: Lsn,
    flushed: Lsn,
    applied: Lsn,
}

impl Watermarks {
    /// All three watermarks start at the stream's start position.
    pub fn new(start: Lsn) -> Self {
        Self {
            received: start,
            flushed: start,
            applied: start,
        }
    }

    /// Highest LSN read off the wire.
    pub fn received(&self) -> Lsn {
        self.received
    }

    /// Highest LSN the consumer has durably processed.
    pub fn flushed(&self) -> Lsn {
        self.flushed
    }

    /// Highest LSN the consumer has applied.
    pub fn applied(&self) -> Lsn {
        self.applied
    }

    /// Returns `true` if the watermark moved.
    pub fn observe_received(&mut self, lsn: Lsn) -> bool {
        if lsn > self.received {
            self.received = lsn;
            true
        } else {
            false
        }
    }

    /// Returns `true` if the watermark moved.
    pub fn advance_flushed(&mut self, lsn: Lsn) -> bool {
        if lsn <= self.flushed {
            return false;
        }
        self.flushed = lsn;
        self.observe_received(lsn);
        true
    }

    /// Returns `true` if the watermark moved.
    pub fn advance_applied(&mut self, lsn: Lsn) -> bool {
        if lsn <= self.applied {
            return false;
        }
        self.applied = lsn;
        self.advance_flushed(lsn);
        true
    }
}

/// `true` once at least `interval` has passed since `last_sent`.
pub fn due_for_update(now: Instant, last_sent: Instant, interval: Duration) -> bool {
    now.saturating_duration_since(last_sent) >= interval
}

/// Decides when the next status update goes out.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    interval: Duration,
    liveness_deadline: Option<Duration>,
    last_sent: Instant,
}

impl PositionTracker {
    /// `server_timeout` is the server's `wal_sender_timeout`; zero disables
    /// the liveness deadline.
    pub fn new(interval: Duration, server_timeout: Duration, now: Instant) -> Self {
        let liveness_deadline = (!server_timeout.is_zero()).then(|| server_timeout / 2);
        Self {
            interval,
            liveness_deadline,
            last_sent: now,
        }
    }

    /// Longest gap allowed between updates before the server may give up on
    /// us: half its timeout, which is also when it starts asking for replies.
    pub fn liveness_deadline(&self) -> Option<Duration> {
        self.liveness_deadline
    }

    /// The configured interval capped by the liveness deadline.
    pub fn effective_interval(&self) -> Duration {
        match self.liveness_deadline {
            Some(deadline) => self.interval.min(deadline),
            None => self.interval,
        }
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn next_due(&self) -> Instant {
        self.last_sent + self.effective_interval()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        due_for_update(now, self.last_sent, self.effective_interval())
    }

    /// Whether the gap since the last update already exceeds the liveness
    /// deadline. Checked on keepalives that do not ask for a reply.
    pub fn liveness_overdue(&self, now: Instant) -> bool {
        self.liveness_deadline
            .is_some_and(|deadline| due_for_update(now, self.last_sent, deadline))
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Status update for the given watermarks.
    pub fn status_update(
        &self,
        marks: Watermarks,
        client_time_micros: i64,
        reply_requested: bool,
    ) -> StandbyStatusUpdate {
        StandbyStatusUpdate {
            received: marks.received,
            flushed: marks.flushed,
            applied: marks.applied,
            client_time_micros,
            reply_requested,
        }
    }
}
