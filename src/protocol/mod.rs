//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Reading and writing PostgreSQL frontend/backend messages ([`framing`])
//! - Parsing error, notice and simple-query responses ([`messages`])
//! - Handling streaming replication protocol messages ([`replication`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! # Replication Protocol
//!
//! After `START_REPLICATION` the server answers with CopyBothResponse and
//! from then on sends CopyData messages containing either `XLogData` (WAL or
//! output plugin data) or `KeepAlive` (heartbeats). The client responds with
//! `StandbyStatusUpdate` messages to report its progress and ends the
//! session with CopyDone.

pub mod framing;
pub mod messages;
pub mod replication;

pub use framing::{BackendMessage, MessageReader};
pub use messages::ErrorFields;
pub use replication::{
    PG_EPOCH_MICROS, ReplicationCopyData, StandbyStatusUpdate, parse_copy_data,
    pg_to_unix_timestamp, unix_to_pg_timestamp,
};
