#![cfg(feature = "integration-tests")]

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use pgwire_walstream::protocol::framing::MessageReader;
use pgwire_walstream::{
    Lsn, ReplicationClient, ReplicationOptions, ReplicationStream, StreamKind, WalFrame,
};
use std::time::{Duration, Instant};
use testcontainers::ContainerRequest;
use testcontainers::runners::AsyncRunner;
use testcontainers::{GenericImage, ImageExt, core::IntoContainerPort, core::WaitFor};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

fn init_tracing() {
    // RUST_LOG=info,pgwire_walstream=debug cargo test --features integration-tests ...
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn postgres_image(host_port: u16) -> ContainerRequest<GenericImage> {
    GenericImage::new("postgres", "16-alpine")
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_DB", "postgres")
        // authentication is the caller's job; trust keeps the startup trivial
        .with_env_var("POSTGRES_HOST_AUTH_METHOD", "trust")
        .with_cmd([
            "postgres",
            "-c",
            "wal_level=logical",
            "-c",
            "max_replication_slots=10",
            "-c",
            "max_wal_senders=10",
            "-c",
            "wal_sender_timeout=20s",
        ])
        .with_mapped_port(host_port, 5432.tcp())
}

async fn follow_container_logs(container: &testcontainers::ContainerAsync<GenericImage>) {
    let mut err = container.stderr(true);
    task::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match err.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let l = line.trim_end();
                    if !l.is_empty() {
                        info!(target: "container:stderr", "{l}");
                    }
                }
                Err(e) => {
                    warn!(target: "container:stderr", "stderr follower error: {e}");
                    break;
                }
            }
        }
    });
}

async fn connect_pg(port: u16) -> Result<tokio_postgres::Client> {
    let dsn = format!("host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres");
    let (client, conn) = tokio_postgres::connect(&dsn, NoTls)
        .await
        .context("connect control-plane postgres")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("control-plane connection error: {e}");
        }
    });

    Ok(client)
}

async fn wait_for_pg_ready(port: u16, timeout: Duration) -> Result<tokio_postgres::Client> {
    let start = Instant::now();
    loop {
        match connect_pg(port).await {
            Ok(c) => return Ok(c),
            Err(e) => {
                if start.elapsed() > timeout {
                    return Err(e).context("postgres did not become ready in time");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn current_wal_lsn(client: &tokio_postgres::Client) -> Result<Lsn> {
    let row = client
        .query_one("SELECT pg_current_wal_lsn()::text", &[])
        .await
        .context("read pg_current_wal_lsn")?;
    let lsn_str: String = row.get(0);
    Lsn::parse(&lsn_str).context(format!("parse lsn: {lsn_str}"))
}

/// Open a replication connection (`replication=database`) and wait until
/// the server is ready for commands. Relies on trust authentication.
async fn connect_replication(port: u16) -> Result<ReplicationClient<TcpStream>> {
    let mut tcp = TcpStream::connect(("127.0.0.1", port))
        .await
        .context("connect replication socket")?;
    tcp.set_nodelay(true)?;

    let mut body = BytesMut::new();
    body.put_i32(196608); // protocol 3.0
    for (k, v) in [
        ("user", "postgres"),
        ("database", "postgres"),
        ("replication", "database"),
        ("application_name", "pgwire-walstream-itest"),
    ] {
        body.extend_from_slice(k.as_bytes());
        body.put_u8(0);
        body.extend_from_slice(v.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    let mut msg = BytesMut::with_capacity(body.len() + 4);
    msg.put_i32((body.len() + 4) as i32);
    msg.extend_from_slice(&body);
    tcp.write_all(&msg).await?;

    let mut reader = MessageReader::new();
    loop {
        let m = reader.read(&mut tcp).await?;
        match m.tag {
            b'R' => anyhow::ensure!(
                m.payload[..] == [0, 0, 0, 0],
                "server asked for authentication; trust auth expected"
            ),
            b'E' => anyhow::bail!("startup rejected: {:?}", m.payload),
            b'Z' => break,
            _ => {}
        }
    }
    anyhow::ensure!(reader.buffered() == 0, "bytes left after startup");
    Ok(ReplicationClient::new(tcp))
}

async fn read_until(
    stream: &mut ReplicationStream,
    timeout: Duration,
    mut pred: impl FnMut(&WalFrame) -> bool,
) -> Result<WalFrame> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, stream.read_next())
            .await
            .context("timeout waiting for frame")??
            .context("server ended the stream")?;
        debug!(
            "frame start={} end={} bytes={}",
            frame.start_lsn,
            frame.wal_end,
            frame.data.len()
        );
        stream.set_flushed(frame.start_lsn)?;
        if pred(&frame) {
            return Ok(frame);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postgres_physical_and_logical_streams() -> Result<()> {
    init_tracing();

    let host_port: u16 = std::env::var("PG_ITEST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(55433);

    info!("starting postgres container on host port {host_port}");
    let container = postgres_image(host_port)
        .start()
        .await
        .context("start postgres")?;
    follow_container_logs(&container).await;

    let control = wait_for_pg_ready(host_port, Duration::from_secs(30)).await?;
    control
        .batch_execute("CREATE TABLE IF NOT EXISTS t(id INT PRIMARY KEY, v TEXT);")
        .await
        .context("create table")?;

    // 1) Control commands on a replication connection
    let mut repl = connect_replication(host_port).await?;
    let ident = repl.identify_system().await?;
    info!("identify_system: {ident:?}");
    anyhow::ensure!(ident.dbname.as_deref() == Some("postgres"));
    anyhow::ensure!(repl.wal_sender_timeout().await? == Duration::from_secs(20));

    // 2) Logical stream from a temporary test_decoding slot
    let options = ReplicationOptions::builder()
        .logical()
        .slot("itest_logical")
        .output_plugin("test_decoding")
        .slot_option("include-xids", "0")
        .temporary_slot(true)
        .status_interval(Duration::from_secs(1))
        .build()?;
    let mut logical = repl.start_logical(options).await?;
    anyhow::ensure!(logical.kind() == StreamKind::Logical);
    anyhow::ensure!(repl.is_streaming());
    info!("logical stream from {}", logical.start_position());

    control
        .execute("INSERT INTO t(id, v) VALUES (1, 'hello')", &[])
        .await
        .context("insert")?;

    let frame = read_until(&mut logical, Duration::from_secs(15), |f| {
        String::from_utf8_lossy(&f.data).contains("INSERT")
    })
    .await?;
    let text = String::from_utf8_lossy(&frame.data).into_owned();
    info!("decoded: {text}");
    anyhow::ensure!(text.contains("table public.t: INSERT: id[integer]:1"));
    anyhow::ensure!(frame.start_lsn >= logical.start_position());

    logical.set_applied(frame.start_lsn)?;
    logical.force_status_update().await?;
    let w = logical.watermarks();
    anyhow::ensure!(w.applied() <= w.flushed() && w.flushed() <= w.received());
    logical.close().await?;
    anyhow::ensure!(logical.is_closed());

    // 3) Physical stream from a temporary slot, starting at the current flush position
    let mut repl = connect_replication(host_port).await?;
    let before = current_wal_lsn(&control).await?;
    let options = ReplicationOptions::builder()
        .physical()
        .slot("itest_physical")
        .temporary_slot(true)
        .build()?;
    let mut physical = repl.start_physical(options).await?;
    anyhow::ensure!(physical.start_position() >= before);

    control
        .execute("INSERT INTO t(id, v) VALUES (2, 'world')", &[])
        .await
        .context("insert")?;

    let frame = read_until(&mut physical, Duration::from_secs(15), |f| !f.data.is_empty()).await?;
    anyhow::ensure!(frame.start_lsn >= physical.start_position());
    anyhow::ensure!(physical.watermarks().received() >= frame.start_lsn);
    physical.close().await?;

    // 4) A rejected command leaves the connection usable
    let mut repl = connect_replication(host_port).await?;
    let options = ReplicationOptions::builder()
        .physical()
        .slot("does_not_exist")
        .start_position(before)
        .build()?;
    let err = repl
        .start_physical(options)
        .await
        .expect_err("start on a missing slot");
    info!("expected rejection: {err}");
    anyhow::ensure!(err.sqlstate() == Some("42704"), "unexpected error {err:?}");
    repl.identify_system().await?;

    info!("integration test completed");
    Ok(())
}
