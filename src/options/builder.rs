//! Staged builder for [`ReplicationOptions`](super::ReplicationOptions).
//!
//! Each stage only offers the calls that are valid at that point, so the
//! slot (and for logical streams the output plugin) must be named before
//! `build()` is reachable. `build()` then checks the values themselves.

use std::time::Duration;

use super::{CommonOptions, LogicalOptions, PhysicalOptions};
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;

/// Longest identifier PostgreSQL keeps (`NAMEDATALEN - 1`).
const MAX_NAME_LEN: usize = 63;

/// Entry point, see [`ReplicationOptions::builder`](super::ReplicationOptions::builder).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicationOptionsBuilder;

impl ReplicationOptionsBuilder {
    pub fn physical(self) -> PhysicalStage {
        PhysicalStage
    }

    pub fn logical(self) -> LogicalStage {
        LogicalStage
    }
}

#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct PhysicalStage;

impl PhysicalStage {
    pub fn slot(self, name: impl Into<String>) -> PhysicalSlotStage {
        PhysicalSlotStage {
            common: CommonOptions::new(name.into()),
            timeline: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct LogicalStage;

impl LogicalStage {
    pub fn slot(self, name: impl Into<String>) -> LogicalSlotStage {
        LogicalSlotStage {
            common: CommonOptions::new(name.into()),
        }
    }
}

#[derive(Debug, Clone)]
#[must_use]
pub struct PhysicalSlotStage {
    common: CommonOptions,
    timeline: Option<u32>,
}

impl PhysicalSlotStage {
    /// Position to start streaming from. Without it the stream starts at the
    /// server's current WAL flush position.
    pub fn start_position(mut self, lsn: Lsn) -> Self {
        self.common.start_position = Some(lsn);
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.common.status_interval = interval;
        self
    }

    /// Create the slot as a temporary slot before streaming.
    pub fn temporary_slot(mut self, temporary: bool) -> Self {
        self.common.temporary_slot = temporary;
        self
    }

    /// Stream from a specific timeline instead of the server's current one.
    pub fn timeline(mut self, timeline: u32) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn build(self) -> Result<PhysicalOptions> {
        validate_common(&self.common)?;
        if self.timeline == Some(0) {
            return Err(PgWireError::config("timeline", "must be greater than zero"));
        }
        Ok(PhysicalOptions {
            common: self.common,
            timeline: self.timeline,
        })
    }
}

#[derive(Debug, Clone)]
#[must_use]
pub struct LogicalSlotStage {
    common: CommonOptions,
}

impl LogicalSlotStage {
    pub fn output_plugin(self, plugin: impl Into<String>) -> LogicalPluginStage {
        LogicalPluginStage {
            common: self.common,
            output_plugin: plugin.into(),
            slot_options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
#[must_use]
pub struct LogicalPluginStage {
    common: CommonOptions,
    output_plugin: String,
    slot_options: Vec<(String, String)>,
}

impl LogicalPluginStage {
    /// Position to start streaming from. Without it the server resumes from
    /// the slot's confirmed flush position.
    pub fn start_position(mut self, lsn: Lsn) -> Self {
        self.common.start_position = Some(lsn);
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.common.status_interval = interval;
        self
    }

    /// Create the slot as a temporary slot (bound to the output plugin)
    /// before streaming.
    pub fn temporary_slot(mut self, temporary: bool) -> Self {
        self.common.temporary_slot = temporary;
        self
    }

    /// Add an output plugin option. Options are passed through verbatim and
    /// in order.
    pub fn slot_option(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.slot_options.push((key.into(), value.to_string()));
        self
    }

    pub fn slot_options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.slot_options
            .extend(options.into_iter().map(|(k, v)| (k.into(), v.to_string())));
        self
    }

    pub fn build(self) -> Result<LogicalOptions> {
        validate_common(&self.common)?;
        validate_plugin(&self.output_plugin)?;
        for (key, value) in &self.slot_options {
            if key.is_empty() {
                return Err(PgWireError::config("slot_options", "option name is empty"));
            }
            if key.contains('\0') || value.contains('\0') {
                return Err(PgWireError::config(
                    "slot_options",
                    format!("option {key:?} contains a NUL byte"),
                ));
            }
        }
        Ok(LogicalOptions {
            common: self.common,
            output_plugin: self.output_plugin,
            slot_options: self.slot_options,
        })
    }
}

fn validate_common(common: &CommonOptions) -> Result<()> {
    validate_slot_name(&common.slot_name)?;
    if common.status_interval.is_zero() {
        return Err(PgWireError::config(
            "status_interval",
            "must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PgWireError::config("slot_name", "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PgWireError::config(
            "slot_name",
            format!("longer than {MAX_NAME_LEN} bytes"),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(PgWireError::config(
            "slot_name",
            format!("invalid character {c:?}; only lower case letters, digits and '_' are allowed"),
        ));
    }
    Ok(())
}

fn validate_plugin(plugin: &str) -> Result<()> {
    if plugin.is_empty() {
        return Err(PgWireError::config("output_plugin", "must not be empty"));
    }
    if plugin.len() > MAX_NAME_LEN {
        return Err(PgWireError::config(
            "output_plugin",
            format!("longer than {MAX_NAME_LEN} bytes"),
        ));
    }
    if plugin.contains(['\0', '"']) {
        return Err(PgWireError::config(
            "output_plugin",
            "contains a NUL byte or double quote",
        ));
    }
    Ok(())
}
