#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod client;
pub mod config;
pub mod error;
pub mod lsn;
pub mod options;
pub mod protocol;
pub mod tracker;

pub use client::{
    CloseReason, IdentifySystem, ReplicationClient, ReplicationStream, SimpleQueryResult,
    StreamHandle, StreamKind, StreamState, WalFrame,
};
pub use config::StreamConfig;
pub use error::{PgWireError, Result};
pub use lsn::Lsn;
pub use options::{LogicalOptions, PhysicalOptions, ReplicationOptions};
pub use tracker::{PositionTracker, Watermarks};
