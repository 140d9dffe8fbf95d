use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;

/// A message the walsender sends inside CopyData once the stream is in
/// copy-both mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCopyData {
    /// `w`: a run of WAL (physical) or output plugin bytes (logical).
    XLogData {
        wal_start: Lsn,
        /// Server's current end of WAL; may be 0 for logical messages inside
        /// a transaction.
        wal_end: Lsn,
        /// Server clock, microseconds since 2000-01-01.
        server_time_micros: i64,
        /// Opaque payload, sharing the message buffer.
        data: Bytes,
    },
    /// `k`: heartbeat.
    KeepAlive {
        wal_end: Lsn,
        server_time_micros: i64,
        /// The server wants a status update right away.
        reply_requested: bool,
    },
}

impl ReplicationCopyData {
    pub fn is_xlog_data(&self) -> bool {
        matches!(self, Self::XLogData { .. })
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::KeepAlive { .. })
    }

    /// A keepalive that must be answered immediately.
    pub fn requires_reply(&self) -> bool {
        matches!(
            self,
            Self::KeepAlive {
                reply_requested: true,
                ..
            }
        )
    }
}

/// wal_start + wal_end + server clock.
const XLOG_HEADER_LEN: usize = 24;
/// wal_end + server clock + reply flag.
const KEEPALIVE_LEN: usize = 17;

/// Decode the body of a CopyData message (tag and length already
/// stripped). Takes the buffer by value so an XLogData payload is a slice of
/// it rather than a copy.
pub fn parse_copy_data(mut payload: Bytes) -> Result<ReplicationCopyData> {
    if !payload.has_remaining() {
        return Err(PgWireError::Protocol("empty CopyData payload".into()));
    }
    match payload.get_u8() {
        b'w' => parse_xlog_data(payload),
        b'k' => parse_keepalive(payload),
        kind => Err(PgWireError::Protocol(format!(
            "unknown CopyData kind: 0x{kind:02x} ('{}')",
            char::from(kind)
        ))),
    }
}

fn ensure_len(body: &Bytes, need: usize, what: &str) -> Result<()> {
    if body.len() < need {
        return Err(PgWireError::Protocol(format!(
            "{what} payload too short: {} bytes (need {need})",
            body.len()
        )));
    }
    Ok(())
}

fn parse_xlog_data(mut body: Bytes) -> Result<ReplicationCopyData> {
    ensure_len(&body, XLOG_HEADER_LEN, "XLogData")?;
    let wal_start = Lsn(body.get_u64());
    let wal_end = Lsn(body.get_u64());
    let server_time_micros = body.get_i64();
    Ok(ReplicationCopyData::XLogData {
        wal_start,
        wal_end,
        server_time_micros,
        data: body,
    })
}

fn parse_keepalive(mut body: Bytes) -> Result<ReplicationCopyData> {
    ensure_len(&body, KEEPALIVE_LEN, "KeepAlive")?;
    Ok(ReplicationCopyData::KeepAlive {
        wal_end: Lsn(body.get_u64()),
        server_time_micros: body.get_i64(),
        reply_requested: body.get_u8() != 0,
    })
}

/// Client feedback reporting the three watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    /// Last WAL position received (the protocol's "write" position)
    pub received: Lsn,
    /// Last WAL position durably processed by the client
    pub flushed: Lsn,
    /// Last WAL position applied by the client
    pub applied: Lsn,
    /// Client clock in microseconds since 2000-01-01
    pub client_time_micros: i64,
    /// Ask the server to answer immediately with a keepalive
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Wire size of the CopyData payload: 'r' + 4 * 8 + 1.
    pub const LEN: usize = 34;

    /// Raw bytes suitable for sending via CopyData.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::LEN);
        out.put_u8(b'r');
        out.put_u64(self.received.0);
        out.put_u64(self.flushed.0);
        out.put_u64(self.applied.0);
        out.put_i64(self.client_time_micros);
        out.put_u8(u8::from(self.reply_requested));
        out.freeze()
    }

    /// Parse a CopyData payload sent by a client.
    pub fn parse(payload: &[u8]) -> Result<StandbyStatusUpdate> {
        if payload.len() != Self::LEN || payload[0] != b'r' {
            return Err(PgWireError::Protocol(format!(
                "not a StandbyStatusUpdate: {} bytes, kind 0x{:02x}",
                payload.len(),
                payload.first().copied().unwrap_or(0)
            )));
        }
        let mut b = &payload[1..];
        Ok(StandbyStatusUpdate {
            received: Lsn(b.get_u64()),
            flushed: Lsn(b.get_u64()),
            applied: Lsn(b.get_u64()),
            client_time_micros: b.get_i64(),
            reply_requested: b.get_u8() != 0,
        })
    }
}

/// PostgreSQL epoch (2000-01-01) in microseconds since Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Convert Unix timestamp (micros) to PostgreSQL timestamp (micros since 2000-01-01).
#[inline]
pub fn unix_to_pg_timestamp(unix_micros: i64) -> i64 {
    unix_micros - PG_EPOCH_MICROS
}

/// Convert PostgreSQL timestamp to Unix timestamp (micros).
#[inline]
pub fn pg_to_unix_timestamp(pg_micros: i64) -> i64 {
    pg_micros + PG_EPOCH_MICROS
}

/// Convert a PostgreSQL timestamp to wall-clock time.
pub fn pg_timestamp_to_system_time(pg_micros: i64) -> SystemTime {
    let unix = pg_to_unix_timestamp(pg_micros);
    if unix >= 0 {
        UNIX_EPOCH + Duration::from_micros(unix as u64)
    } else {
        UNIX_EPOCH - Duration::from_micros(unix.unsigned_abs())
    }
}

/// Current wall-clock time as a PostgreSQL timestamp.
pub fn current_pg_timestamp() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    unix_to_pg_timestamp(i64::try_from(now.as_micros()).unwrap_or(i64::MAX))
}
