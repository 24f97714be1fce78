//! Migration records and the state machine they move through.

use std::fmt;

use serde::{Deserialize, Serialize};
use utils::id::MigrationId;
use utils::serde_system_time::SystemTime;
use utils::timestamp::Timestamp;

/// Position of a migration in `uninitialized -> blocking -> {committed, aborted}`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationState {
    Uninitialized,
    Blocking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid migration state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MigrationState,
    pub to: MigrationState,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Committed | MigrationState::Aborted)
    }

    /// Checks that moving from `self` to `to` follows the state machine.
    ///
    /// Staying in the same state is allowed so that transitions can be
    /// re-delivered; nothing else may skip a state or leave a terminal one.
    pub fn check_transition(self, to: MigrationState) -> Result<(), InvalidTransition> {
        use MigrationState::*;
        match (self, to) {
            (from, to) if from == to => Ok(()),
            (Uninitialized, Blocking) | (Blocking, Committed) | (Blocking, Aborted) => Ok(()),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

/// How the partition key of a migration is to be read.
///
/// This never changes how operations are gated.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum Protocol {
    /// The partition key is a single tenant id.
    #[serde(rename = "multitenant")]
    #[strum(serialize = "multitenant")]
    MultiTenant,
    /// The partition key is a shard key range `<start>..<end>`.
    #[serde(rename = "shardMerge")]
    #[strum(serialize = "shardMerge")]
    ShardMerge,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("partition key {key:?} is not valid for protocol {protocol}: {reason}")]
pub struct InvalidPartitionKey {
    pub key: String,
    pub protocol: Protocol,
    pub reason: &'static str,
}

impl Protocol {
    pub fn validate_partition_key(self, key: &PartitionKey) -> Result<(), InvalidPartitionKey> {
        let invalid = |reason| InvalidPartitionKey {
            key: key.0.clone(),
            protocol: self,
            reason,
        };
        match self {
            Protocol::MultiTenant => {
                if key.0.is_empty() {
                    return Err(invalid("tenant id is empty"));
                }
                if !key
                    .0
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
                {
                    return Err(invalid("tenant id may only contain [A-Za-z0-9_-]"));
                }
                Ok(())
            }
            Protocol::ShardMerge => {
                let range = key
                    .key_range()
                    .ok_or_else(|| invalid("expected a key range <start>..<end>"))?;
                if let Some(end) = range.end {
                    if range.start >= end {
                        return Err(invalid("key range start must be below its end"));
                    }
                }
                Ok(())
            }
        }
    }
}

/// The unit of migration: a tenant id or a shard key range.
///
/// Migrations on different partition keys are independent of each other.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

/// A half-open `[start, end)` key range; `end == None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange<'a> {
    pub start: &'a str,
    pub end: Option<&'a str>,
}

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        PartitionKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads the key as a shard key range, if it is written as one.
    pub fn key_range(&self) -> Option<KeyRange<'_>> {
        let (start, end) = self.0.split_once("..")?;
        Some(KeyRange {
            start,
            end: (!end.is_empty()).then_some(end),
        })
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        PartitionKey::new(s)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({})", self.0)
    }
}

/// A change to a migration record, delivered to an access blocker only once
/// it is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    StartBlocking { block_timestamp: Timestamp },
    Commit { op_time: Timestamp },
    Abort { op_time: Timestamp, reason: String },
    Forget { expire_at: SystemTime },
}

impl Transition {
    /// The state the record is in once this transition is applied.
    pub fn target_state(&self, current: MigrationState) -> MigrationState {
        match self {
            Transition::StartBlocking { .. } => MigrationState::Blocking,
            Transition::Commit { .. } => MigrationState::Committed,
            Transition::Abort { .. } => MigrationState::Aborted,
            Transition::Forget { .. } => current,
        }
    }
}

/// Durable description of one migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: MigrationId,
    pub partition_key: PartitionKey,
    pub protocol: Protocol,
    /// Routing hint for clients rejected after the commit.
    pub recipient_connection_string: String,
    pub read_preference: String,
    pub state: MigrationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_or_abort_op_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<SystemTime>,
}

impl MigrationRecord {
    pub fn new(
        migration_id: MigrationId,
        partition_key: PartitionKey,
        protocol: Protocol,
        recipient_connection_string: String,
        read_preference: String,
    ) -> Self {
        MigrationRecord {
            migration_id,
            partition_key,
            protocol,
            recipient_connection_string,
            read_preference,
            state: MigrationState::Uninitialized,
            block_timestamp: None,
            commit_or_abort_op_time: None,
            abort_reason: None,
            expire_at: None,
        }
    }

    pub fn is_forgotten(&self) -> bool {
        self.expire_at.is_some()
    }

    /// Applies `transition`, returning whether anything changed.
    ///
    /// Re-applying a transition the record already went through is a no-op:
    /// the block timestamp, decision op time and expiry are all set once.
    pub fn apply(&mut self, transition: &Transition) -> Result<bool, InvalidTransition> {
        let target = transition.target_state(self.state);
        self.state.check_transition(target)?;

        let changed = match transition {
            Transition::StartBlocking { block_timestamp } => {
                if self.block_timestamp.is_some() {
                    false
                } else {
                    self.block_timestamp = Some(*block_timestamp);
                    true
                }
            }
            Transition::Commit { op_time } => {
                if self.state == MigrationState::Committed {
                    false
                } else {
                    self.commit_or_abort_op_time = Some(*op_time);
                    true
                }
            }
            Transition::Abort { op_time, reason } => {
                if self.state == MigrationState::Aborted {
                    false
                } else {
                    self.commit_or_abort_op_time = Some(*op_time);
                    self.abort_reason = Some(reason.clone());
                    true
                }
            }
            Transition::Forget { expire_at } => {
                if !self.state.is_terminal() {
                    return Err(InvalidTransition {
                        from: self.state,
                        to: self.state,
                    });
                }
                if self.expire_at.is_some() {
                    false
                } else {
                    self.expire_at = Some(*expire_at);
                    true
                }
            }
        };
        self.state = target;
        Ok(changed)
    }

    /// The transitions that bring `self` to `target`, in the order they were
    /// originally applied. Used to fast-forward in-memory state from a newer
    /// durable copy of the same record.
    pub fn transitions_to(
        &self,
        target: &MigrationRecord,
    ) -> Result<Vec<Transition>, InvalidTransition> {
        let mut transitions = Vec::new();

        if self.block_timestamp.is_none() {
            if let Some(block_timestamp) = target.block_timestamp {
                transitions.push(Transition::StartBlocking { block_timestamp });
            }
        }

        if !self.state.is_terminal() && target.state.is_terminal() {
            let op_time = target
                .commit_or_abort_op_time
                .or(target.block_timestamp)
                .unwrap_or_default();
            transitions.push(match target.state {
                MigrationState::Committed => Transition::Commit { op_time },
                _ => Transition::Abort {
                    op_time,
                    reason: target.abort_reason.clone().unwrap_or_default(),
                },
            });
        }

        if self.expire_at.is_none() {
            if let Some(expire_at) = target.expire_at {
                transitions.push(Transition::Forget { expire_at });
            }
        }

        // Replay on a scratch copy to make sure the target is reachable.
        let mut scratch = self.clone();
        for t in &transitions {
            scratch.apply(t)?;
        }
        if scratch.state != target.state {
            return Err(InvalidTransition {
                from: self.state,
                to: target.state,
            });
        }

        Ok(transitions)
    }
}
