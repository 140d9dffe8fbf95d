//! In-memory walsender used by the stream tests.
//!
//! The mock speaks just enough of the server side of the protocol to drive
//! a [`ReplicationClient`] through the handshake and copy mode. Every
//! helper panics on unexpected input, which fails the calling test.

#![allow(dead_code)]

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use pgwire_walstream::protocol::framing::{BackendMessage, MessageReader};
use pgwire_walstream::protocol::replication::StandbyStatusUpdate;
use pgwire_walstream::{
    Lsn, PhysicalOptions, ReplicationClient, ReplicationOptions, ReplicationStream, StreamConfig,
};
use tokio::io::{AsyncWriteExt, DuplexStream};

pub const SLOT: &str = "standby_1";

pub fn init_tracing() {
    // RUST_LOG=debug cargo test --test stream
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn lsn(s: &str) -> Lsn {
    Lsn::parse(s).unwrap()
}

/// Config that never talks to the server about timeouts and keeps the
/// idle reply request out of the way.
pub fn quiet_config() -> StreamConfig {
    StreamConfig {
        server_timeout: Some(Duration::ZERO),
        idle_timeout: Some(Duration::from_secs(3600)),
        ..StreamConfig::default()
    }
}

pub fn physical_options(start: Lsn, status_interval: Duration) -> PhysicalOptions {
    ReplicationOptions::builder()
        .physical()
        .slot(SLOT)
        .start_position(start)
        .status_interval(status_interval)
        .build()
        .unwrap()
}

pub struct MockServer {
    io: DuplexStream,
    reader: MessageReader,
}

impl MockServer {
    /// Client end of the channel plus the server.
    pub fn pair() -> (DuplexStream, MockServer) {
        Self::pair_with_capacity(256 * 1024)
    }

    /// Like [`MockServer::pair`], but each direction buffers at most
    /// `capacity` bytes, so client writes block once the server stops
    /// reading.
    pub fn pair_with_capacity(capacity: usize) -> (DuplexStream, MockServer) {
        let (client, server) = tokio::io::duplex(capacity);
        (
            client,
            MockServer {
                io: server,
                reader: MessageReader::new(),
            },
        )
    }

    pub async fn send(&mut self, tag: u8, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        buf.put_u8(tag);
        buf.put_i32((payload.len() + 4) as i32);
        buf.extend_from_slice(payload);
        self.io.write_all(&buf).await.unwrap();
    }

    /// Next message from the client.
    pub async fn recv(&mut self) -> BackendMessage {
        self.reader.read(&mut self.io).await.unwrap()
    }

    /// Next message must be a Query; returns its text.
    pub async fn expect_query(&mut self) -> String {
        let msg = self.recv().await;
        assert_eq!(msg.tag, b'Q', "expected Query, got {:?}", char::from(msg.tag));
        let sql = msg.payload.strip_suffix(b"\0").expect("unterminated query");
        String::from_utf8(sql.to_vec()).unwrap()
    }

    pub async fn expect_status_update(&mut self) -> StandbyStatusUpdate {
        let msg = self.recv().await;
        assert_eq!(msg.tag, b'd', "expected CopyData, got {:?}", char::from(msg.tag));
        StandbyStatusUpdate::parse(&msg.payload).unwrap()
    }

    pub async fn expect_copy_done(&mut self) {
        let msg = self.recv().await;
        assert_eq!(msg.tag, b'c', "expected CopyDone, got {:?}", char::from(msg.tag));
    }

    pub async fn send_copy_both(&mut self) {
        // text format, no columns
        self.send(b'W', &[0, 0, 0]).await;
    }

    pub async fn send_xlog(&mut self, start: Lsn, end: Lsn, data: &[u8]) {
        let mut p = BytesMut::with_capacity(25 + data.len());
        p.put_u8(b'w');
        p.put_u64(start.0);
        p.put_u64(end.0);
        p.put_i64(0);
        p.extend_from_slice(data);
        self.send(b'd', &p).await;
    }

    pub async fn send_keepalive(&mut self, wal_end: Lsn, reply_requested: bool) {
        let mut p = BytesMut::with_capacity(18);
        p.put_u8(b'k');
        p.put_u64(wal_end.0);
        p.put_i64(0);
        p.put_u8(u8::from(reply_requested));
        self.send(b'd', &p).await;
    }

    pub async fn send_copy_done(&mut self) {
        self.send(b'c', &[]).await;
    }

    pub async fn send_error(&mut self, code: &str, message: &str) {
        let mut p = Vec::new();
        for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
            p.push(field);
            p.extend_from_slice(value.as_bytes());
            p.push(0);
        }
        p.push(0);
        self.send(b'E', &p).await;
    }

    pub async fn send_command_complete(&mut self, tag: &str) {
        let mut p = tag.as_bytes().to_vec();
        p.push(0);
        self.send(b'C', &p).await;
    }

    pub async fn send_ready(&mut self) {
        self.send(b'Z', b"I").await;
    }

    /// RowDescription, DataRows, CommandComplete and ReadyForQuery.
    pub async fn send_rows(&mut self, columns: &[&str], rows: &[Vec<Option<&str>>], tag: &str) {
        let mut desc = BytesMut::new();
        desc.put_i16(columns.len() as i16);
        for name in columns {
            desc.extend_from_slice(name.as_bytes());
            desc.put_u8(0);
            desc.put_bytes(0, 18);
        }
        self.send(b'T', &desc).await;

        for row in rows {
            let mut data = BytesMut::new();
            data.put_i16(row.len() as i16);
            for value in row {
                match value {
                    Some(v) => {
                        data.put_i32(v.len() as i32);
                        data.extend_from_slice(v.as_bytes());
                    }
                    None => data.put_i32(-1),
                }
            }
            self.send(b'D', &data).await;
        }

        self.send_command_complete(tag).await;
        self.send_ready().await;
    }

    /// Server side of a client-initiated close: final status update,
    /// CopyDone, then end the copy and go back to idle.
    pub async fn accept_close(&mut self) -> StandbyStatusUpdate {
        let update = self.expect_status_update().await;
        self.expect_copy_done().await;
        self.send_copy_done().await;
        self.send_command_complete("START_REPLICATION").await;
        self.send_ready().await;
        update
    }
}

/// Physical stream at `start` with an explicit position, so the only
/// command on the wire is START_REPLICATION.
pub async fn start_physical(
    start: Lsn,
    status_interval: Duration,
    config: StreamConfig,
) -> (ReplicationStream, MockServer) {
    start_physical_with_capacity(256 * 1024, start, status_interval, config).await
}

pub async fn start_physical_with_capacity(
    capacity: usize,
    start: Lsn,
    status_interval: Duration,
    config: StreamConfig,
) -> (ReplicationStream, MockServer) {
    let (io, mut server) = MockServer::pair_with_capacity(capacity);
    let mut client = ReplicationClient::with_config(io, config);
    let options = physical_options(start, status_interval);

    let (stream, ()) = tokio::join!(client.start_physical(options), async {
        let sql = server.expect_query().await;
        assert_eq!(sql, format!("START_REPLICATION SLOT {SLOT} PHYSICAL {start}"));
        server.send_copy_both().await;
    });
    let stream = stream.unwrap();
    assert!(client.is_streaming());
    (stream, server)
}
