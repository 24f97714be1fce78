//! Per-migration access blocker: the live state machine of one migration and
//! the gate every operation on its partition key passes before executing.
//!
//! The live state is published through a [`watch`] channel. Waiting
//! operations subscribe to it and re-evaluate the decision rule from scratch
//! whenever the state changes, so a state transition is the single broadcast
//! that releases or rejects all of them. A transition is only ever applied
//! after the record store made it durable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::id::MigrationId;
use utils::serde_system_time::SystemTime;
use utils::timestamp::Timestamp;

use crate::metrics::{BLOCKED_OPERATIONS, REJECTED_OPERATIONS, STATE_TRANSITIONS, WAIT_SECONDS};
use crate::state::{MigrationRecord, MigrationState, PartitionKey, Protocol, Transition};
use crate::LinearizableReadPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
}

/// The logical time an operation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveTimestamp {
    /// The timestamp a write commits at, or the one a read is pinned to.
    At(Timestamp),
    /// A read that must reflect every write ordered before it in real time.
    Linearizable,
}

/// What the gate needs to know about an operation.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub kind: OperationKind,
    pub timestamp: EffectiveTimestamp,
    /// Give up waiting for a migration decision at this instant.
    pub deadline: Option<Instant>,
}

impl Operation {
    pub fn write(ts: Timestamp) -> Self {
        Operation {
            kind: OperationKind::Write,
            timestamp: EffectiveTimestamp::At(ts),
            deadline: None,
        }
    }

    pub fn read_at(ts: Timestamp) -> Self {
        Operation {
            kind: OperationKind::Read,
            timestamp: EffectiveTimestamp::At(ts),
            deadline: None,
        }
    }

    pub fn linearizable_read() -> Self {
        Operation {
            kind: OperationKind::Read,
            timestamp: EffectiveTimestamp::Linearizable,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Equivalent of a client-supplied max time, counted from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Whether the operation only depends on data strictly before `block_ts`.
    ///
    /// Only reads can. A write lands after the boundary whatever timestamp
    /// it carries. Linearizable reads get through only while the migration
    /// is `uninitialized`, which `decide` admits before asking.
    fn precedes(&self, block_ts: Timestamp) -> bool {
        match (self.kind, self.timestamp) {
            (OperationKind::Write, _) => false,
            (OperationKind::Read, EffectiveTimestamp::At(ts)) => ts < block_ts,
            (OperationKind::Read, EffectiveTimestamp::Linearizable) => false,
        }
    }
}

/// Why the gate refused to admit an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    /// The partition now belongs to the recipient; retry there.
    #[error(
        "partition {partition_key} was migrated by {migration_id}, retry against {recipient_connection_string}"
    )]
    MigrationCommitted {
        migration_id: MigrationId,
        partition_key: PartitionKey,
        recipient_connection_string: String,
        read_preference: String,
    },
    /// An abort is decided but not yet durable.
    #[error("migration {migration_id} is being aborted, retry the operation")]
    MigrationAborted { migration_id: MigrationId },
    #[error("deadline exceeded waiting for the decision of migration {migration_id}")]
    DeadlineExceeded { migration_id: MigrationId },
    #[error("operation cancelled while waiting for a migration decision")]
    Cancelled,
    #[error("linearizable reads are rejected while migration {migration_id} is blocking")]
    LinearizableReadRejected { migration_id: MigrationId },
}

impl AdmitError {
    fn reason(&self) -> &'static str {
        match self {
            AdmitError::MigrationCommitted { .. } => "migration_committed",
            AdmitError::MigrationAborted { .. } => "migration_aborted",
            AdmitError::DeadlineExceeded { .. } => "deadline_exceeded",
            AdmitError::Cancelled => "cancelled",
            AdmitError::LinearizableReadRejected { .. } => "linearizable_read_rejected",
        }
    }
}

/// State shared with waiters through the watch channel.
#[derive(Debug, Clone)]
struct LiveState {
    record: MigrationRecord,
    /// Set while an abort decision is being made durable.
    abort_pending: bool,
}

enum Decision {
    Allow,
    Wait,
    Reject(AdmitError),
}

/// The decision rule, evaluated against one consistent view of the state.
fn decide(
    live: &LiveState,
    op: &Operation,
    policy: LinearizableReadPolicy,
    already_waiting: bool,
) -> Decision {
    let record = &live.record;
    match record.state {
        MigrationState::Uninitialized | MigrationState::Aborted => Decision::Allow,
        MigrationState::Blocking => {
            // A blocking record always carries its block timestamp; without
            // one everything counts as at or after the boundary.
            let block_ts = record.block_timestamp.unwrap_or(Timestamp::INVALID);
            if op.precedes(block_ts) {
                return Decision::Allow;
            }
            if op.timestamp == EffectiveTimestamp::Linearizable
                && policy == LinearizableReadPolicy::Reject
            {
                return Decision::Reject(AdmitError::LinearizableReadRejected {
                    migration_id: record.migration_id,
                });
            }
            if live.abort_pending && !already_waiting {
                return Decision::Reject(AdmitError::MigrationAborted {
                    migration_id: record.migration_id,
                });
            }
            Decision::Wait
        }
        MigrationState::Committed => {
            let block_ts = record.block_timestamp.unwrap_or(Timestamp::INVALID);
            if op.precedes(block_ts) {
                Decision::Allow
            } else {
                Decision::Reject(AdmitError::MigrationCommitted {
                    migration_id: record.migration_id,
                    partition_key: record.partition_key.clone(),
                    recipient_connection_string: record.recipient_connection_string.clone(),
                    read_preference: record.read_preference.clone(),
                })
            }
        }
    }
}

/// Keeps an operation in the waiter set for as long as it is alive.
///
/// Dropping the `admit` future, for example because the caller gave up on
/// the whole operation, removes the waiter right away.
struct WaiterGuard<'a> {
    blocker: &'a AccessBlocker,
    id: u64,
    since: Instant,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.blocker.waiters.lock().unwrap().remove(&self.id);
        WAIT_SECONDS.observe(self.since.elapsed().as_secs_f64());
    }
}

#[derive(Debug, Default)]
struct Counters {
    num_blocked_writes: AtomicU64,
    num_blocked_reads: AtomicU64,
    num_tenant_migration_committed_errors: AtomicU64,
    num_tenant_migration_aborted_errors: AtomicU64,
}

/// Read-only view of one blocker, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerStatus {
    pub migration_id: MigrationId,
    pub partition_key: PartitionKey,
    pub protocol: Protocol,
    pub state: MigrationState,
    pub block_timestamp: Option<Timestamp>,
    pub commit_or_abort_op_time: Option<Timestamp>,
    pub abort_reason: Option<String>,
    pub expire_at: Option<SystemTime>,
    pub abort_pending: bool,
    pub num_waiters: usize,
    pub num_blocked_writes: u64,
    pub num_blocked_reads: u64,
    pub num_tenant_migration_committed_errors: u64,
    pub num_tenant_migration_aborted_errors: u64,
}

pub struct AccessBlocker {
    migration_id: MigrationId,
    partition_key: PartitionKey,
    policy: LinearizableReadPolicy,

    state: watch::Sender<LiveState>,

    waiters: Mutex<HashSet<u64>>,
    next_waiter_id: AtomicU64,

    counters: Counters,
}

impl std::fmt::Debug for AccessBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessBlocker")
            .field("migration_id", &self.migration_id)
            .field("partition_key", &self.partition_key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AccessBlocker {
    /// Creates a blocker in the state of a record that is already durable.
    pub fn new(record: MigrationRecord, policy: LinearizableReadPolicy) -> Self {
        let (state, _) = watch::channel(LiveState {
            record: record.clone(),
            abort_pending: false,
        });
        AccessBlocker {
            migration_id: record.migration_id,
            partition_key: record.partition_key,
            policy,
            state,
            waiters: Mutex::new(HashSet::new()),
            next_waiter_id: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn migration_id(&self) -> MigrationId {
        self.migration_id
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn state(&self) -> MigrationState {
        self.state.borrow().record.state
    }

    pub fn block_timestamp(&self) -> Option<Timestamp> {
        self.state.borrow().record.block_timestamp
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_forgotten(&self) -> bool {
        self.state.borrow().record.is_forgotten()
    }

    /// The in-memory copy of the record.
    pub fn record(&self) -> MigrationRecord {
        self.state.borrow().record.clone()
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Decide whether `op` may execute, suspending it while the migration is
    /// undecided.
    ///
    /// Returns `Ok(())` if the operation may proceed. Cancelling `cancel` or
    /// reaching the operation's deadline ends the wait of this operation only.
    pub async fn admit(&self, op: &Operation, cancel: &CancellationToken) -> Result<(), AdmitError> {
        // Subscribe before the first look at the state so that no
        // transition can slip in between the check and the wait.
        let mut rx = self.state.subscribe();
        let mut waiter: Option<WaiterGuard> = None;

        loop {
            let decision = decide(&rx.borrow_and_update(), op, self.policy, waiter.is_some());
            match decision {
                Decision::Allow => return Ok(()),
                Decision::Reject(err) => {
                    self.count_rejection(&err);
                    debug!(
                        migration_id = %self.migration_id,
                        partition_key = %self.partition_key,
                        kind = ?op.kind,
                        "rejected operation: {err}"
                    );
                    return Err(err);
                }
                Decision::Wait => {
                    if waiter.is_none() {
                        waiter = Some(self.enqueue(op));
                    }
                }
            }

            let deadline = async {
                match op.deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };

            let gave_up = tokio::select! {
                biased;
                res = rx.changed() => match res {
                    Ok(()) => None,
                    // The sender lives as long as `self`.
                    Err(_) => Some(AdmitError::Cancelled),
                },
                _ = cancel.cancelled() => Some(AdmitError::Cancelled),
                _ = deadline => Some(AdmitError::DeadlineExceeded {
                    migration_id: self.migration_id,
                }),
            };
            let Some(err) = gave_up else {
                // State changed, evaluate again.
                continue;
            };
            self.count_rejection(&err);
            debug!(
                migration_id = %self.migration_id,
                partition_key = %self.partition_key,
                "gave up waiting for migration decision: {err}"
            );
            return Err(err);
        }
    }

    fn enqueue(&self, op: &Operation) -> WaiterGuard<'_> {
        let counter = match op.kind {
            OperationKind::Write => &self.counters.num_blocked_writes,
            OperationKind::Read => &self.counters.num_blocked_reads,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        BLOCKED_OPERATIONS
            .with_label_values(&[op.kind.into()])
            .inc();

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().unwrap().insert(id);
        trace!(
            migration_id = %self.migration_id,
            "suspended {:?} operation at {:?}",
            op.kind,
            op.timestamp
        );
        WaiterGuard {
            blocker: self,
            id,
            since: Instant::now(),
        }
    }

    fn count_rejection(&self, err: &AdmitError) {
        match err {
            AdmitError::MigrationCommitted { .. } => {
                self.counters
                    .num_tenant_migration_committed_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            AdmitError::MigrationAborted { .. } => {
                self.counters
                    .num_tenant_migration_aborted_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        REJECTED_OPERATIONS.with_label_values(&[err.reason()]).inc();
    }

    /// Applies a durable transition and wakes every waiter if the state
    /// changed.
    ///
    /// # Panics
    ///
    /// On a transition the state machine does not allow. Such a transition
    /// means the durable state went backwards and no decision made from it
    /// can be trusted.
    pub fn apply_transition(&self, transition: &Transition) -> bool {
        let mut from = MigrationState::Uninitialized;
        let changed = self.state.send_if_modified(|live| {
            from = live.record.state;
            let changed = match live.record.apply(transition) {
                Ok(changed) => changed,
                Err(e) => panic!(
                    "{e} for migration {} on partition {}",
                    self.migration_id, self.partition_key
                ),
            };
            if live.record.state.is_terminal() {
                live.abort_pending = false;
            }
            changed
        });
        if changed {
            let to = self.state();
            if from != to {
                STATE_TRANSITIONS
                    .with_label_values(&[to.into()])
                    .inc();
                info!(
                    migration_id = %self.migration_id,
                    partition_key = %self.partition_key,
                    block_ts = ?self.block_timestamp(),
                    waiters = self.num_waiters(),
                    "migration state {from} -> {to}"
                );
            } else {
                debug!(
                    migration_id = %self.migration_id,
                    "applied {transition:?} in state {to}"
                );
            }
        }
        changed
    }

    /// Brings the in-memory state up to a newer durable copy of the record,
    /// applying the missing transitions in order. Live waiters stay.
    pub fn catch_up(&self, durable: &MigrationRecord) -> bool {
        assert_eq!(
            durable.migration_id, self.migration_id,
            "catch_up with a record of another migration"
        );
        let transitions = match self.record().transitions_to(durable) {
            Ok(transitions) => transitions,
            Err(e) => panic!(
                "durable record of migration {} is behind its blocker: {e}",
                self.migration_id
            ),
        };
        let mut changed = false;
        for t in &transitions {
            changed |= self.apply_transition(t);
        }
        changed
    }

    /// Marks an abort as decided but not yet durable. New operations that
    /// would have to wait are rejected with [`AdmitError::MigrationAborted`]
    /// until the abort is applied or the mark is cleared.
    pub fn set_abort_pending(&self, pending: bool) {
        self.state.send_if_modified(|live| {
            let pending = pending && !live.record.state.is_terminal();
            let changed = live.abort_pending != pending;
            live.abort_pending = pending;
            changed
        });
    }

    pub fn status(&self) -> BlockerStatus {
        let live = self.state.borrow().clone();
        let record = live.record;
        BlockerStatus {
            migration_id: record.migration_id,
            partition_key: record.partition_key,
            protocol: record.protocol,
            state: record.state,
            block_timestamp: record.block_timestamp,
            commit_or_abort_op_time: record.commit_or_abort_op_time,
            abort_reason: record.abort_reason,
            expire_at: record.expire_at,
            abort_pending: live.abort_pending,
            num_waiters: self.num_waiters(),
            num_blocked_writes: self.counters.num_blocked_writes.load(Ordering::Relaxed),
            num_blocked_reads: self.counters.num_blocked_reads.load(Ordering::Relaxed),
            num_tenant_migration_committed_errors: self
                .counters
                .num_tenant_migration_committed_errors
                .load(Ordering::Relaxed),
            num_tenant_migration_aborted_errors: self
                .counters
                .num_tenant_migration_aborted_errors
                .load(Ordering::Relaxed),
        }
    }
}
