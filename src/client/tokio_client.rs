use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::StreamConfig;
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;
use crate::options::{LogicalOptions, PhysicalOptions, ReplicationOptions};
use crate::protocol::framing::{MessageReader, write_query};
use crate::protocol::messages::{
    ErrorFields, parse_command_complete, parse_data_row, parse_ready_for_query,
    parse_row_description,
};

use super::stream::{ReplicationStream, StreamKind, StreamParams};

/// Result of IDENTIFY_SYSTEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifySystem {
    pub system_id: String,
    pub timeline: u32,
    /// Current WAL flush position.
    pub xlogpos: Lsn,
    /// `None` on a physical replication connection.
    pub dbname: Option<String>,
}

/// Rows returned by a replication command, all values in text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleQueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub command_tag: Option<String>,
}

impl SimpleQueryResult {
    /// Value of `column` in row `row`; `None` if absent or NULL.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    fn required(&self, row: usize, column: &str) -> Result<&str> {
        self.get(row, column).ok_or_else(|| {
            PgWireError::Protocol(format!("missing column {column:?} in row {row}"))
        })
    }
}

/// Drives the replication handshake on an already authenticated
/// replication connection.
///
/// The caller establishes the connection (TCP, TLS, startup with
/// `replication=true` or `replication=database`, authentication) and hands
/// over the channel once the server is ready for queries. Starting a
/// stream moves the channel into the stream's worker; the client is inert
/// afterwards.
///
/// ```ignore
/// let mut client = ReplicationClient::new(socket);
/// let options = ReplicationOptions::builder()
///     .physical()
///     .slot("standby_1")
///     .build()?;
/// let mut stream = client.start_physical(options).await?;
/// ```
pub struct ReplicationClient<S> {
    conn: Option<S>,
    messages: MessageReader,
    config: StreamConfig,
    streaming: bool,
}

impl<S> ReplicationClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(conn: S) -> Self {
        Self::with_config(conn, StreamConfig::default())
    }

    pub fn with_config(conn: S, config: StreamConfig) -> Self {
        Self {
            conn: Some(conn),
            messages: MessageReader::new(),
            config,
            streaming: false,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// `true` once a stream has taken over the connection.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The channel, unless a stream took it or a failure dropped it.
    pub fn into_inner(self) -> Option<S> {
        self.conn
    }

    /// Run a replication command that answers with rows (or nothing) and
    /// ReadyForQuery. Not for `START_REPLICATION`; use the `start_*` methods.
    ///
    /// A command the server rejects fails with [`PgWireError::Handshake`]
    /// and leaves the connection usable. Any other failure drops it.
    pub async fn simple_query(&mut self, sql: &str) -> Result<SimpleQueryResult> {
        let res = self.simple_query_inner(sql).await;
        self.settle(res)
    }

    async fn simple_query_inner(&mut self, sql: &str) -> Result<SimpleQueryResult> {
        let conn = self.conn.as_mut().ok_or(PgWireError::Closed)?;
        tracing::debug!("sending replication command: {sql}");
        write_query(conn, sql).await?;

        let mut result = SimpleQueryResult::default();
        let mut error = None;
        loop {
            let msg = self.messages.read(conn).await?;
            match msg.tag {
                b'T' => result.columns = parse_row_description(&msg.payload)?,
                b'D' => result.rows.push(parse_data_row(&msg.payload)?),
                b'C' => result.command_tag = Some(parse_command_complete(&msg.payload)?),
                b'I' | b'S' => {}
                b'E' => error = Some(ErrorFields::parse(&msg.payload)),
                b'N' => {
                    let notice = ErrorFields::parse(&msg.payload);
                    tracing::warn!("server notice: {notice}");
                }
                b'Z' => {
                    parse_ready_for_query(&msg.payload)?;
                    return match error {
                        Some(fields) => Err(PgWireError::Handshake(fields)),
                        None => Ok(result),
                    };
                }
                tag => {
                    return Err(PgWireError::Protocol(format!(
                        "unexpected message '{}' (0x{tag:02x}) in response to {sql:?}",
                        char::from(tag)
                    )));
                }
            }
        }
    }

    pub async fn identify_system(&mut self) -> Result<IdentifySystem> {
        let res = self.simple_query("IDENTIFY_SYSTEM").await?;
        let timeline = res.required(0, "timeline")?;
        let timeline = timeline
            .parse::<u32>()
            .map_err(|e| PgWireError::Protocol(format!("invalid timeline {timeline:?}: {e}")))?;
        let xlogpos = Lsn::parse(res.required(0, "xlogpos")?)
            .map_err(|e| PgWireError::Protocol(e.to_string()))?;
        Ok(IdentifySystem {
            system_id: res.required(0, "systemid")?.to_owned(),
            timeline,
            xlogpos,
            dbname: res.get(0, "dbname").map(str::to_owned),
        })
    }

    /// Current value of a server setting.
    pub async fn show(&mut self, name: &str) -> Result<String> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
        {
            return Err(PgWireError::config(
                "name",
                format!("not a setting name: {name:?}"),
            ));
        }
        let res = self.simple_query(&format!("SHOW {name}")).await?;
        res.rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.clone())
            .ok_or_else(|| PgWireError::Protocol(format!("SHOW {name} returned no value")))
    }

    /// The server's `wal_sender_timeout`; zero when disabled.
    pub async fn wal_sender_timeout(&mut self) -> Result<Duration> {
        let value = self.show("wal_sender_timeout").await?;
        parse_pg_duration(&value).ok_or_else(|| {
            PgWireError::Protocol(format!("cannot parse wal_sender_timeout {value:?}"))
        })
    }

    pub async fn start_physical(&mut self, options: PhysicalOptions) -> Result<ReplicationStream> {
        self.start(options.into()).await
    }

    pub async fn start_logical(&mut self, options: LogicalOptions) -> Result<ReplicationStream> {
        self.start(options.into()).await
    }

    /// Create the temporary slot if asked to, resolve the start position and
    /// server timeout, then enter copy mode and hand the connection to a
    /// stream worker.
    ///
    /// Without an explicit start position a physical stream starts at the
    /// server's current flush position (`IDENTIFY_SYSTEM`), and a logical one
    /// at the consistent point of a slot created here or else at `0/0`, which
    /// resumes from the slot's confirmed position.
    pub async fn start(&mut self, options: ReplicationOptions) -> Result<ReplicationStream> {
        if self.conn.is_none() {
            return Err(PgWireError::Closed);
        }

        let mut consistent_point = None;
        if options.temporary_slot() {
            let res = self.simple_query(&options.create_slot_command()).await?;
            consistent_point = res
                .get(0, "consistent_point")
                .map(Lsn::parse)
                .transpose()
                .map_err(|e| PgWireError::Protocol(e.to_string()))?;
            tracing::debug!(
                slot = options.slot_name(),
                consistent_point = ?consistent_point,
                "created temporary replication slot"
            );
        }

        let start = match options.start_position() {
            Some(lsn) => lsn,
            None if options.is_logical() => consistent_point.unwrap_or(Lsn::INVALID),
            None => self.identify_system().await?.xlogpos,
        };

        let server_timeout = match self.config.server_timeout {
            Some(t) => t,
            None => self.wal_sender_timeout().await?,
        };

        let sql = options.start_command(start);
        let res = self.enter_copy_both(&sql).await;
        self.settle(res)?;

        let conn = self.conn.take().ok_or(PgWireError::Closed)?;
        let messages = std::mem::take(&mut self.messages);
        self.streaming = true;

        let kind = if options.is_logical() {
            StreamKind::Logical
        } else {
            StreamKind::Physical
        };
        tracing::debug!(
            slot = options.slot_name(),
            %start,
            ?kind,
            ?server_timeout,
            "entered copy-both mode"
        );

        Ok(ReplicationStream::spawn(
            conn,
            messages,
            StreamParams {
                kind,
                start,
                status_interval: options.status_interval(),
                server_timeout,
                config: self.config.clone(),
            },
        ))
    }

    async fn enter_copy_both(&mut self, sql: &str) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(PgWireError::Closed)?;
        tracing::debug!("sending replication command: {sql}");
        write_query(conn, sql).await?;

        let mut error = None;
        loop {
            let msg = self.messages.read(conn).await?;
            match msg.tag {
                b'W' => return Ok(()),
                b'E' => error = Some(ErrorFields::parse(&msg.payload)),
                b'Z' => {
                    return Err(PgWireError::Handshake(error.unwrap_or_else(|| {
                        ErrorFields {
                            message: Some("server did not enter copy mode".into()),
                            ..ErrorFields::default()
                        }
                    })));
                }
                b'N' => {
                    let notice = ErrorFields::parse(&msg.payload);
                    tracing::warn!("server notice: {notice}");
                }
                b'S' | b'T' | b'D' | b'C' => {}
                tag => {
                    return Err(PgWireError::Protocol(format!(
                        "unexpected message '{}' (0x{tag:02x}) while starting replication",
                        char::from(tag)
                    )));
                }
            }
        }
    }

    /// Drop the connection after any failure that can leave it mid-response.
    fn settle<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res
            && !matches!(e, PgWireError::Handshake(_) | PgWireError::Closed)
        {
            tracing::debug!("dropping replication connection after error: {e}");
            self.conn = None;
        }
        res
    }
}

impl<S> std::fmt::Debug for ReplicationClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("connected", &self.conn.is_some())
            .field("streaming", &self.streaming)
            .field("config", &self.config)
            .finish()
    }
}

/// Parse a duration setting as printed by `SHOW`: an integer with an
/// optional unit (`us`, `ms`, `s`, `min`, `h`, `d`); no unit means
/// milliseconds.
fn parse_pg_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (num, unit) = value.split_at(split);
    let n: u64 = num.parse().ok()?;
    let d = match unit.trim() {
        "" | "ms" => Duration::from_millis(n),
        "us" => Duration::from_micros(n),
        "s" => Duration::from_secs(n),
        "min" => Duration::from_secs(n.checked_mul(60)?),
        "h" => Duration::from_secs(n.checked_mul(3_600)?),
        "d" => Duration::from_secs(n.checked_mul(86_400)?),
        _ => return None,
    };
    Some(d)
}
