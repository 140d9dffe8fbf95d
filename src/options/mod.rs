//! Replication start options.
//!
//! Options are built through the staged builder in [`builder`] and are
//! immutable afterwards. Physical and logical streams share the slot, start
//! position and feedback settings; only the command text differs.
//!
//! ```
//! use std::time::Duration;
//! use pgwire_walstream::{Lsn, ReplicationOptions};
//!
//! let options = ReplicationOptions::builder()
//!     .logical()
//!     .slot("orders_cdc")
//!     .output_plugin("pgoutput")
//!     .slot_option("proto_version", "1")
//!     .slot_option("publication_names", "orders")
//!     .start_position(Lsn::parse("16/B374D848").unwrap())
//!     .status_interval(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     options.start_command(options.start_position().unwrap()),
//!     "START_REPLICATION SLOT orders_cdc LOGICAL 16/B374D848 \
//!      (\"proto_version\" '1', \"publication_names\" 'orders')"
//! );
//! ```

pub mod builder;

use std::time::Duration;

use crate::lsn::Lsn;

pub use builder::{
    LogicalPluginStage, LogicalSlotStage, LogicalStage, PhysicalSlotStage, PhysicalStage,
    ReplicationOptionsBuilder,
};

/// Default interval between standby status updates.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Settings shared by physical and logical streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonOptions {
    pub(crate) slot_name: String,
    pub(crate) start_position: Option<Lsn>,
    pub(crate) status_interval: Duration,
    pub(crate) temporary_slot: bool,
}

impl CommonOptions {
    pub(crate) fn new(slot_name: String) -> Self {
        Self {
            slot_name,
            start_position: None,
            status_interval: DEFAULT_STATUS_INTERVAL,
            temporary_slot: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalOptions {
    pub(crate) common: CommonOptions,
    pub(crate) timeline: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalOptions {
    pub(crate) common: CommonOptions,
    pub(crate) output_plugin: String,
    pub(crate) slot_options: Vec<(String, String)>,
}

/// Validated options for starting a replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOptions {
    Physical(PhysicalOptions),
    Logical(LogicalOptions),
}

impl ReplicationOptions {
    pub fn builder() -> ReplicationOptionsBuilder {
        ReplicationOptionsBuilder
    }

    fn common(&self) -> &CommonOptions {
        match self {
            ReplicationOptions::Physical(p) => &p.common,
            ReplicationOptions::Logical(l) => &l.common,
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.common().slot_name
    }

    /// Requested start position; `None` means "latest" (see
    /// [`ReplicationClient::start`](crate::ReplicationClient::start)).
    pub fn start_position(&self) -> Option<Lsn> {
        self.common().start_position
    }

    pub fn status_interval(&self) -> Duration {
        self.common().status_interval
    }

    /// Whether a temporary slot is created before streaming starts.
    pub fn temporary_slot(&self) -> bool {
        self.common().temporary_slot
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, ReplicationOptions::Logical(_))
    }

    /// `START_REPLICATION` command text for the resolved start position.
    pub fn start_command(&self, start: Lsn) -> String {
        match self {
            ReplicationOptions::Physical(p) => p.start_command(start),
            ReplicationOptions::Logical(l) => l.start_command(start),
        }
    }

    /// `CREATE_REPLICATION_SLOT ... TEMPORARY` command text.
    pub fn create_slot_command(&self) -> String {
        match self {
            ReplicationOptions::Physical(p) => p.create_slot_command(),
            ReplicationOptions::Logical(l) => l.create_slot_command(),
        }
    }
}

impl PhysicalOptions {
    pub fn slot_name(&self) -> &str {
        &self.common.slot_name
    }

    pub fn start_position(&self) -> Option<Lsn> {
        self.common.start_position
    }

    pub fn status_interval(&self) -> Duration {
        self.common.status_interval
    }

    pub fn temporary_slot(&self) -> bool {
        self.common.temporary_slot
    }

    pub fn timeline(&self) -> Option<u32> {
        self.timeline
    }

    pub fn start_command(&self, start: Lsn) -> String {
        let mut sql = format!(
            "START_REPLICATION SLOT {} PHYSICAL {start}",
            self.common.slot_name
        );
        if let Some(tli) = self.timeline {
            sql.push_str(&format!(" TIMELINE {tli}"));
        }
        sql
    }

    pub fn create_slot_command(&self) -> String {
        format!(
            "CREATE_REPLICATION_SLOT {} TEMPORARY PHYSICAL RESERVE_WAL",
            self.common.slot_name
        )
    }
}

impl LogicalOptions {
    pub fn slot_name(&self) -> &str {
        &self.common.slot_name
    }

    pub fn start_position(&self) -> Option<Lsn> {
        self.common.start_position
    }

    pub fn status_interval(&self) -> Duration {
        self.common.status_interval
    }

    pub fn output_plugin(&self) -> &str {
        &self.output_plugin
    }

    pub fn temporary_slot(&self) -> bool {
        self.common.temporary_slot
    }

    /// Output plugin options in the order they were added.
    pub fn slot_options(&self) -> &[(String, String)] {
        &self.slot_options
    }

    pub fn start_command(&self, start: Lsn) -> String {
        let mut sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {start}",
            self.common.slot_name
        );
        if !self.slot_options.is_empty() {
            let opts: Vec<String> = self
                .slot_options
                .iter()
                .map(|(k, v)| format!("{} {}", quote_identifier(k), quote_literal(v)))
                .collect();
            sql.push_str(" (");
            sql.push_str(&opts.join(", "));
            sql.push(')');
        }
        sql
    }

    pub fn create_slot_command(&self) -> String {
        format!(
            "CREATE_REPLICATION_SLOT {} TEMPORARY LOGICAL {} NOEXPORT_SNAPSHOT",
            self.common.slot_name,
            quote_identifier(&self.output_plugin)
        )
    }
}

impl From<PhysicalOptions> for ReplicationOptions {
    fn from(p: PhysicalOptions) -> Self {
        ReplicationOptions::Physical(p)
    }
}

impl From<LogicalOptions> for ReplicationOptions {
    fn from(l: LogicalOptions) -> Self {
        ReplicationOptions::Logical(l)
    }
}

pub(crate) fn quote_identifier(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub(crate) fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn(s: &str) -> Lsn {
        Lsn::parse(s).unwrap()
    }

    #[test]
    fn physical_start_command() {
        let opts = ReplicationOptions::builder()
            .physical()
            .slot("standby_1")
            .build()
            .unwrap();
        assert_eq!(
            opts.start_command(lsn("0/1000000")),
            "START_REPLICATION SLOT standby_1 PHYSICAL 0/1000000"
        );
    }

    #[test]
    fn physical_start_command_with_timeline() {
        let opts = ReplicationOptions::builder()
            .physical()
            .slot("standby_1")
            .timeline(3)
            .build()
            .unwrap();
        assert_eq!(
            opts.start_command(lsn("2/A0")),
            "START_REPLICATION SLOT standby_1 PHYSICAL 2/A0 TIMELINE 3"
        );
    }

    #[test]
    fn logical_start_command_without_options() {
        let opts = ReplicationOptions::builder()
            .logical()
            .slot("s")
            .output_plugin("test_decoding")
            .build()
            .unwrap();
        assert_eq!(
            opts.start_command(Lsn::INVALID),
            "START_REPLICATION SLOT s LOGICAL 0/0"
        );
    }

    #[test]
    fn logical_options_are_quoted_in_order() {
        let opts = ReplicationOptions::builder()
            .logical()
            .slot("s")
            .output_plugin("wal2json")
            .slot_option("add-tables", "public.o'brien")
            .slot_option("we\"ird", "1")
            .build()
            .unwrap();
        assert_eq!(
            opts.start_command(lsn("0/10")),
            "START_REPLICATION SLOT s LOGICAL 0/10 (\"add-tables\" 'public.o''brien', \"we\"\"ird\" '1')"
        );
    }

    #[test]
    fn temporary_slot_commands() {
        let physical = ReplicationOptions::builder()
            .physical()
            .slot("tmp_phys")
            .temporary_slot(true)
            .build()
            .unwrap();
        assert!(physical.temporary_slot());
        assert_eq!(
            physical.create_slot_command(),
            "CREATE_REPLICATION_SLOT tmp_phys TEMPORARY PHYSICAL RESERVE_WAL"
        );

        let logical = ReplicationOptions::builder()
            .logical()
            .slot("tmp_logical")
            .output_plugin("pgoutput")
            .temporary_slot(true)
            .build()
            .unwrap();
        assert_eq!(
            logical.create_slot_command(),
            "CREATE_REPLICATION_SLOT tmp_logical TEMPORARY LOGICAL \"pgoutput\" NOEXPORT_SNAPSHOT"
        );
    }

    #[test]
    fn accessors_expose_built_values() {
        let opts = ReplicationOptions::builder()
            .logical()
            .slot("s")
            .output_plugin("pgoutput")
            .slot_options([("proto_version", "1"), ("publication_names", "p")])
            .start_position(lsn("0/5"))
            .build()
            .unwrap();
        let opts = ReplicationOptions::from(opts);
        assert!(opts.is_logical());
        assert_eq!(opts.slot_name(), "s");
        assert_eq!(opts.start_position(), Some(lsn("0/5")));
        assert_eq!(opts.status_interval(), DEFAULT_STATUS_INTERVAL);
        let ReplicationOptions::Logical(l) = opts else {
            panic!("expected logical options");
        };
        assert_eq!(l.output_plugin(), "pgoutput");
        assert_eq!(l.slot_options().len(), 2);
        assert_eq!(l.slot_options()[1].0, "publication_names");
    }
}
