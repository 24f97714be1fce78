//! Donor-side access blocking for live partition migrations.
//!
//! While a tenant or shard key range is being migrated to another replica
//! set, every read and write routed to it on this node passes through an
//! [`access_blocker::AccessBlocker`]. The blocker admits, suspends or rejects
//! operations based on the migration's durable state, which is owned by the
//! [`record_store::MigrationStore`] and driven by [`donor::MigrationDonor`].
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use utils::logging::LogFormat;

pub mod access_blocker;
pub mod clock;
pub mod dispatch;
pub mod donor;
pub mod gc;
pub mod metrics;
pub mod record_store;
pub mod recovery;
pub mod registry;
pub mod state;

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_GC_INTERVAL: &str = "60s";
    pub const DEFAULT_GC_INTERVAL_DURATION: Duration = Duration::from_secs(60);

    /// Subdirectory of the workdir holding one file per migration record.
    pub const MIGRATIONS_DIR_NAME: &str = "migrations";
}

/// What a linearizable read does while its partition is blocking.
///
/// A linearizable read has no fixed timestamp: it must observe every write
/// ordered before it in real time, so while the migration is undecided it
/// can neither be served from a snapshot nor safely admitted.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::EnumString,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LinearizableReadPolicy {
    /// Wait for the migration decision like any other gated operation.
    #[default]
    Block,
    /// Fail immediately with a retryable error.
    Reject,
}

#[derive(Debug, Clone)]
pub struct BlockerConf {
    /// Directory under which the migration record store lives.
    pub workdir: Utf8PathBuf,
    pub no_sync: bool,
    pub gc_interval: Duration,
    pub linearizable_read_policy: LinearizableReadPolicy,
    pub log_format: LogFormat,
}

impl BlockerConf {
    pub fn migrations_dir(&self) -> Utf8PathBuf {
        self.workdir.join(defaults::MIGRATIONS_DIR_NAME)
    }

    /// Config for unit tests: nothing is fsynced and the workdir is relative.
    pub fn dummy() -> Self {
        BlockerConf {
            workdir: Utf8PathBuf::from("./"),
            no_sync: true,
            gc_interval: Duration::from_millis(100),
            linearizable_read_policy: LinearizableReadPolicy::Block,
            log_format: LogFormat::Test,
        }
    }
}

impl Default for BlockerConf {
    fn default() -> Self {
        BlockerConf {
            workdir: Utf8PathBuf::from("./"),
            no_sync: false,
            gc_interval: defaults::DEFAULT_GC_INTERVAL_DURATION,
            linearizable_read_policy: LinearizableReadPolicy::default(),
            log_format: LogFormat::Plain,
        }
    }
}
