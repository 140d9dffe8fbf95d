//! PostgreSQL streaming replication client.
//!
//! # Overview
//!
//! [`ReplicationClient`] takes an authenticated replication connection,
//! negotiates the stream (temporary slot, start position, server timeout)
//! and issues `START_REPLICATION`. Once the server switches to copy-both
//! mode the connection moves into a background worker and the caller reads
//! frames from the returned [`ReplicationStream`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   WalFrame (bounded)  ┌─────────────────┐
//! │                 │◄──────────────────────│                 │
//! │  Your App       │                       │  Worker Task    │
//! │                 │──────────────────────►│                 │
//! │                 │  flushed / applied,   │                 │
//! └─────────────────┘  force, close         └────────┬────────┘
//!                                                    │
//!                                                    │ CopyBoth
//!                                                    ▼
//!                                           ┌─────────────────┐
//!                                           │   PostgreSQL    │
//!                                           │  (walsender)    │
//!                                           └─────────────────┘
//! ```
//!
//! The worker answers keepalives, sends standby status updates on the
//! configured cadence and asks an idle server for a reply. Progress
//! reported through [`StreamHandle::set_flushed`] and
//! [`StreamHandle::set_applied`] goes out with the next update.
//!
//! # Example
//!
//! ```ignore
//! use pgwire_walstream::{ReplicationClient, ReplicationOptions};
//!
//! async fn run(socket: tokio::net::TcpStream) -> pgwire_walstream::Result<()> {
//!     let mut client = ReplicationClient::new(socket);
//!     let options = ReplicationOptions::builder()
//!         .logical()
//!         .slot("orders_cdc")
//!         .output_plugin("test_decoding")
//!         .temporary_slot(true)
//!         .build()?;
//!
//!     let mut stream = client.start_logical(options).await?;
//!     while let Some(frame) = stream.read_next().await? {
//!         println!("{} bytes at {}", frame.data.len(), frame.start_lsn);
//!         stream.set_flushed(frame.start_lsn)?;
//!     }
//!     Ok(())
//! }
//! ```

mod stream;
mod tokio_client;
mod worker;

pub use stream::{CloseReason, ReplicationStream, StreamHandle, StreamKind, StreamState, WalFrame};
pub use tokio_client::{IdentifySystem, ReplicationClient, SimpleQueryResult};
