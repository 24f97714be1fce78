//! The donor side of a migration: orchestrator entry points, node role and
//! the glue between the record store and the blocker registry.
//!
//! Every transition goes through the same steps under the store lock: check
//! it against the durable record, persist the new record, and only then apply
//! it to the in-memory blocker. A failed write leaves the blocker untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::id::MigrationId;
use utils::serde_system_time::SystemTime;
use utils::timestamp::Timestamp;

use crate::access_blocker::{AccessBlocker, AdmitError, BlockerStatus, Operation};
use crate::clock::LogicalClock;
use crate::record_store::MigrationStore;
use crate::recovery::{self, RecoveryStats};
use crate::registry::{BlockerRegistry, RegistryError};
use crate::state::{
    InvalidPartitionKey, MigrationRecord, MigrationState, PartitionKey, Protocol, Transition,
};
use crate::BlockerConf;

#[derive(Debug, thiserror::Error)]
pub enum DonorError {
    #[error("migration {0} not found")]
    NotFound(MigrationId),
    #[error("partition {partition_key} already has unforgotten migration {existing}")]
    ConflictingMigration {
        partition_key: PartitionKey,
        existing: MigrationId,
    },
    #[error(transparent)]
    InvalidPartitionKey(#[from] InvalidPartitionKey),
    #[error("cannot {operation} migration {migration_id} in state {state}")]
    InvalidState {
        migration_id: MigrationId,
        state: MigrationState,
        operation: &'static str,
    },
    #[error("node is not primary")]
    NotPrimary,
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RegistryError> for DonorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Conflict {
                partition_key,
                existing,
            } => DonorError::ConflictingMigration {
                partition_key,
                existing,
            },
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Secondary,
    Primary,
}

/// Arguments of the orchestrator's "start migration" call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStart {
    pub migration_id: MigrationId,
    pub partition_key: PartitionKey,
    pub protocol: Protocol,
    pub recipient_connection_string: String,
    pub read_preference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonorStatus {
    pub role: Role,
    pub recovered: bool,
    pub clock: Timestamp,
    pub blockers: BTreeMap<PartitionKey, BlockerStatus>,
}

pub struct MigrationDonor<S> {
    pub(crate) conf: BlockerConf,
    pub(crate) store: tokio::sync::Mutex<S>,
    pub(crate) registry: Arc<BlockerRegistry>,
    clock: LogicalClock,
    role: Mutex<Role>,
    /// Flipped to true once the registry has been rebuilt from the store.
    recovered: watch::Sender<bool>,
}

impl<S: MigrationStore> MigrationDonor<S> {
    /// A donor starts as a secondary that has not recovered yet: operations
    /// wait in [`MigrationDonor::admit`] until [`MigrationDonor::recover`] or
    /// [`MigrationDonor::step_up`] ran.
    pub fn new(conf: BlockerConf, store: S) -> Self {
        let (recovered, _) = watch::channel(false);
        MigrationDonor {
            conf,
            store: tokio::sync::Mutex::new(store),
            registry: Arc::new(BlockerRegistry::new()),
            clock: LogicalClock::default(),
            role: Mutex::new(Role::Secondary),
            recovered,
        }
    }

    pub fn registry(&self) -> &Arc<BlockerRegistry> {
        &self.registry
    }

    pub fn conf(&self) -> &BlockerConf {
        &self.conf
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn role(&self) -> Role {
        *self.role.lock().unwrap()
    }

    pub fn is_recovered(&self) -> bool {
        *self.recovered.borrow()
    }

    /// Rebuilds the registry from the store and opens the gate for
    /// operations.
    pub async fn recover(&self) -> anyhow::Result<RecoveryStats> {
        let store = self.store.lock().await;
        self.recover_locked(&*store)
    }

    fn recover_locked(&self, store: &S) -> anyhow::Result<RecoveryStats> {
        let stats = recovery::reconcile(
            store.records().values(),
            &self.registry,
            &self.clock,
            self.conf.linearizable_read_policy,
        )?;
        self.recovered.send_replace(true);
        Ok(stats)
    }

    /// Becomes primary. Recovery runs first, so orchestrator calls accepted
    /// from here on see every durable migration.
    pub async fn step_up(&self) -> anyhow::Result<RecoveryStats> {
        let store = self.store.lock().await;
        let stats = self.recover_locked(&*store)?;
        *self.role.lock().unwrap() = Role::Primary;
        info!("stepped up to primary, {stats}");
        Ok(stats)
    }

    /// Stops accepting orchestrator calls. Blockers stay and keep gating.
    pub async fn step_down(&self) {
        let _store = self.store.lock().await;
        *self.role.lock().unwrap() = Role::Secondary;
        info!("stepped down to secondary");
    }

    /// Waits until the registry has been populated at least once.
    pub async fn wait_recovered(&self, cancel: &CancellationToken) -> Result<(), DonorError> {
        let mut rx = self.recovered.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                res = rx.changed() => res.map_err(|_| DonorError::Cancelled)?,
                _ = cancel.cancelled() => return Err(DonorError::Cancelled),
            }
        }
    }

    /// Gate `op` on `partition_key`. Partitions without a blocker are never
    /// delayed once recovery has completed.
    pub async fn admit(
        &self,
        partition_key: &PartitionKey,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<(), AdmitError> {
        if !self.is_recovered() {
            self.wait_recovered(cancel)
                .await
                .map_err(|_| AdmitError::Cancelled)?;
        }
        match self.registry.lookup(partition_key) {
            None => Ok(()),
            Some(blocker) => blocker.admit(op, cancel).await,
        }
    }

    pub fn status(&self) -> DonorStatus {
        DonorStatus {
            role: self.role(),
            recovered: self.is_recovered(),
            clock: self.clock.now(),
            blockers: self.registry.snapshot(),
        }
    }

    /// Copy of every durable record.
    pub async fn records(&self) -> Vec<MigrationRecord> {
        self.store.lock().await.records().values().cloned().collect()
    }

    fn check_primary(&self) -> Result<(), DonorError> {
        match self.role() {
            Role::Primary => Ok(()),
            Role::Secondary => Err(DonorError::NotPrimary),
        }
    }

    /// The blocker of a durable record, created if recovery has not seen the
    /// record yet.
    fn blocker_for(&self, record: &MigrationRecord) -> Result<Arc<AccessBlocker>, DonorError> {
        if let Some(blocker) = self.registry.get_by_migration_id(record.migration_id) {
            return Ok(blocker);
        }
        let blocker = Arc::new(AccessBlocker::new(
            record.clone(),
            self.conf.linearizable_read_policy,
        ));
        Ok(self.registry.register(blocker)?)
    }

    /// Persist `transition` for `record`, then apply it in memory.
    async fn transition(
        &self,
        store: &mut S,
        record: &mut MigrationRecord,
        transition: Transition,
    ) -> Result<(), DonorError> {
        let mut updated = record.clone();
        if let Err(e) = updated.apply(&transition) {
            return Err(DonorError::InvalidState {
                migration_id: record.migration_id,
                state: e.from,
                operation: transition_name(&transition),
            });
        }
        store.persist(&updated).await?;
        *record = updated;
        self.blocker_for(record)?.apply_transition(&transition);
        Ok(())
    }

    fn durable_record(store: &S, migration_id: MigrationId) -> Result<MigrationRecord, DonorError> {
        store
            .get(&migration_id)
            .cloned()
            .ok_or(DonorError::NotFound(migration_id))
    }

    /// Inserts the record of a new migration in `uninitialized` and installs
    /// its blocker. Calling it again for the same migration is a no-op.
    pub async fn start_migration(&self, start: MigrationStart) -> Result<(), DonorError> {
        let span = info_span!("migration", migration_id = %start.migration_id, partition_key = %start.partition_key);
        self.start_migration0(start).instrument(span).await
    }

    async fn start_migration0(&self, start: MigrationStart) -> Result<(), DonorError> {
        let mut store = self.store.lock().await;
        self.check_primary()?;
        start.protocol.validate_partition_key(&start.partition_key)?;

        if let Some(existing) = store.get(&start.migration_id) {
            if existing.partition_key != start.partition_key || existing.protocol != start.protocol
            {
                return Err(DonorError::InvalidState {
                    migration_id: start.migration_id,
                    state: existing.state,
                    operation: "restart with different arguments",
                });
            }
            self.blocker_for(existing)?;
            return Ok(());
        }
        if let Some(existing) = store.find_unforgotten(&start.partition_key) {
            return Err(DonorError::ConflictingMigration {
                partition_key: start.partition_key,
                existing: existing.migration_id,
            });
        }

        let record = MigrationRecord::new(
            start.migration_id,
            start.partition_key,
            start.protocol,
            start.recipient_connection_string,
            start.read_preference,
        );
        store.persist(&record).await?;
        self.blocker_for(&record)?;
        info!("started migration using protocol {}", record.protocol);
        Ok(())
    }

    /// Moves the migration to `blocking` and returns its block timestamp,
    /// which is the timestamp of the durable write. Repeated calls return the
    /// timestamp assigned the first time.
    pub async fn start_blocking(&self, migration_id: MigrationId) -> Result<Timestamp, DonorError> {
        let span = info_span!("migration", migration_id = %migration_id);
        self.start_blocking0(migration_id).instrument(span).await
    }

    async fn start_blocking0(&self, migration_id: MigrationId) -> Result<Timestamp, DonorError> {
        let mut store = self.store.lock().await;
        self.check_primary()?;
        let mut record = Self::durable_record(&store, migration_id)?;
        self.start_blocking_locked(&mut store, &mut record).await
    }

    async fn start_blocking_locked(
        &self,
        store: &mut S,
        record: &mut MigrationRecord,
    ) -> Result<Timestamp, DonorError> {
        if let Some(block_timestamp) = record.block_timestamp {
            return Ok(block_timestamp);
        }
        let block_timestamp = self.clock.tick();
        self.transition(store, record, Transition::StartBlocking { block_timestamp })
            .await?;
        Ok(block_timestamp)
    }

    /// Decides the migration in favour of the recipient.
    pub async fn commit(&self, migration_id: MigrationId, op_time: Timestamp) -> Result<(), DonorError> {
        let span = info_span!("migration", migration_id = %migration_id);
        self.commit0(migration_id, op_time).instrument(span).await
    }

    async fn commit0(&self, migration_id: MigrationId, op_time: Timestamp) -> Result<(), DonorError> {
        let mut store = self.store.lock().await;
        self.check_primary()?;
        let mut record = Self::durable_record(&store, migration_id)?;
        if record.state == MigrationState::Committed {
            return Ok(());
        }
        if record.state != MigrationState::Blocking {
            return Err(DonorError::InvalidState {
                migration_id,
                state: record.state,
                operation: "commit",
            });
        }
        self.clock.observe(op_time);
        self.transition(&mut store, &mut record, Transition::Commit { op_time })
            .await
    }

    /// Decides the migration against the recipient. A migration that never
    /// started blocking goes through `blocking` first so that no state is
    /// skipped.
    ///
    /// While the abort is being persisted, operations that would have to
    /// wait are turned away with [`AdmitError::MigrationAborted`].
    pub async fn abort(
        &self,
        migration_id: MigrationId,
        op_time: Timestamp,
        reason: String,
    ) -> Result<(), DonorError> {
        let span = info_span!("migration", migration_id = %migration_id);
        self.abort0(migration_id, op_time, reason)
            .instrument(span)
            .await
    }

    async fn abort0(
        &self,
        migration_id: MigrationId,
        op_time: Timestamp,
        reason: String,
    ) -> Result<(), DonorError> {
        let mut store = self.store.lock().await;
        self.check_primary()?;
        let mut record = Self::durable_record(&store, migration_id)?;
        match record.state {
            MigrationState::Aborted => return Ok(()),
            MigrationState::Committed => {
                return Err(DonorError::InvalidState {
                    migration_id,
                    state: record.state,
                    operation: "abort",
                })
            }
            MigrationState::Uninitialized => {
                self.start_blocking_locked(&mut store, &mut record).await?;
            }
            MigrationState::Blocking => {}
        }

        self.clock.observe(op_time);
        let blocker = self.blocker_for(&record)?;
        blocker.set_abort_pending(true);
        let res = self
            .transition(
                &mut store,
                &mut record,
                Transition::Abort {
                    op_time,
                    reason: reason.clone(),
                },
            )
            .await;
        if let Err(e) = &res {
            warn!("failed to persist abort: {e}");
            blocker.set_abort_pending(false);
        } else {
            info!("aborted migration: {reason}");
        }
        res
    }

    /// Marks a decided migration for garbage collection after `expire_at`.
    pub async fn forget(
        &self,
        migration_id: MigrationId,
        expire_at: std::time::SystemTime,
    ) -> Result<(), DonorError> {
        let span = info_span!("migration", migration_id = %migration_id);
        self.forget0(migration_id, expire_at).instrument(span).await
    }

    async fn forget0(
        &self,
        migration_id: MigrationId,
        expire_at: std::time::SystemTime,
    ) -> Result<(), DonorError> {
        let mut store = self.store.lock().await;
        self.check_primary()?;
        let mut record = Self::durable_record(&store, migration_id)?;
        if record.is_forgotten() {
            return Ok(());
        }
        // Millisecond precision is what survives the record file.
        let expire_at = SystemTime(expire_at).truncated_to_millis();
        self.transition(&mut store, &mut record, Transition::Forget { expire_at })
            .await?;
        info!("forgot migration, expires at {}", humantime::format_rfc3339_millis(expire_at.0));
        Ok(())
    }

    /// Applies a record that became durable through replication. Called by
    /// the replication layer on secondaries, in the order the records were
    /// written on the primary.
    ///
    /// A record that could not be gated here is refused before it reaches
    /// the store.
    pub async fn apply_replicated_record(&self, record: MigrationRecord) -> anyhow::Result<()> {
        let mut store = self.store.lock().await;
        if let Some(current) = store.get(&record.migration_id) {
            // Validates that the record only moves forward.
            current.transitions_to(&record)?;
        }

        let existing = self.registry.get_by_migration_id(record.migration_id);
        let install = existing.is_none() && {
            let gated_by_other = self
                .registry
                .lookup(&record.partition_key)
                .is_some_and(|b| !b.is_forgotten());
            !(record.is_forgotten() && gated_by_other)
        };
        if install {
            self.registry
                .check_register(&record.partition_key, record.migration_id)?;
        }

        store.persist(&record).await?;

        for ts in [record.block_timestamp, record.commit_or_abort_op_time]
            .into_iter()
            .flatten()
        {
            self.clock.observe(ts);
        }

        if let Some(blocker) = existing {
            blocker.catch_up(&record);
        } else if install {
            let blocker = Arc::new(AccessBlocker::new(
                record.clone(),
                self.conf.linearizable_read_policy,
            ));
            self.registry.register(blocker)?;
        }
        Ok(())
    }

    /// Applies the replicated deletion of a garbage collected record.
    pub async fn apply_replicated_delete(&self, migration_id: MigrationId) -> anyhow::Result<()> {
        let mut store = self.store.lock().await;
        let partition_key = store.get(&migration_id).map(|r| r.partition_key.clone());
        store.remove(&migration_id).await?;
        if let Some(partition_key) = partition_key {
            self.registry.unregister(&partition_key, migration_id);
        }
        Ok(())
    }
}

fn transition_name(transition: &Transition) -> &'static str {
    match transition {
        Transition::StartBlocking { .. } => "start blocking",
        Transition::Commit { .. } => "commit",
        Transition::Abort { .. } => "abort",
        Transition::Forget { .. } => "forget",
    }
}
