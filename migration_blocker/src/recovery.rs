//! Rebuilding the blocker registry from the durable migration records.
//!
//! Recovery reconciles rather than replaces: blockers that already exist for
//! a record are brought up to its durable state in place, so operations that
//! are waiting on them keep waiting and observe the outcome. Running it again
//! over the same records changes nothing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::bail;
use tracing::*;

use crate::access_blocker::AccessBlocker;
use crate::clock::LogicalClock;
use crate::metrics::RECOVERY_SECONDS;
use crate::registry::BlockerRegistry;
use crate::state::{MigrationRecord, PartitionKey};
use crate::LinearizableReadPolicy;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records found in the store.
    pub records: usize,
    /// Blockers created for records that had none.
    pub created: usize,
    /// Existing blockers moved forward to their durable state.
    pub caught_up: usize,
    /// Blockers dropped because their record no longer exists.
    pub removed_stale: usize,
}

impl fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} blockers created, {} caught up, {} stale removed",
            self.records, self.created, self.caught_up, self.removed_stale
        )
    }
}

/// Makes `registry` gate exactly what `records` say.
///
/// Per partition key the registry keeps one blocker: the one of the
/// migration that is not forgotten yet, or, when all of them are forgotten,
/// the one expiring last. Every persisted timestamp is fed to `clock`.
pub fn reconcile<'a>(
    records: impl IntoIterator<Item = &'a MigrationRecord>,
    registry: &BlockerRegistry,
    clock: &LogicalClock,
    policy: LinearizableReadPolicy,
) -> anyhow::Result<RecoveryStats> {
    let _timer = RECOVERY_SECONDS.start_timer();
    let mut stats = RecoveryStats::default();

    let mut by_id = HashMap::new();
    let mut chosen: BTreeMap<&PartitionKey, &MigrationRecord> = BTreeMap::new();
    for record in records {
        stats.records += 1;
        for ts in [record.block_timestamp, record.commit_or_abort_op_time]
            .into_iter()
            .flatten()
        {
            clock.observe(ts);
        }
        by_id.insert(record.migration_id, record);

        match chosen.get(&record.partition_key) {
            None => {
                chosen.insert(&record.partition_key, record);
            }
            Some(current) => {
                if !current.is_forgotten() && !record.is_forgotten() {
                    bail!(
                        "partition {} has two unforgotten migrations {} and {}",
                        record.partition_key,
                        current.migration_id,
                        record.migration_id
                    );
                }
                let replace = if record.is_forgotten() && current.is_forgotten() {
                    record.expire_at > current.expire_at
                } else {
                    !record.is_forgotten()
                };
                if replace {
                    chosen.insert(&record.partition_key, record);
                }
            }
        }
    }

    // Existing blockers first, so that a blocker that is about to be
    // replaced is already terminal when its successor is registered.
    for blocker in registry.blockers() {
        match by_id.get(&blocker.migration_id()) {
            Some(durable) => {
                if blocker.catch_up(durable) {
                    stats.caught_up += 1;
                }
            }
            None => {
                if registry.remove_stale(blocker.partition_key(), blocker.migration_id()) {
                    info!(
                        migration_id = %blocker.migration_id(),
                        partition_key = %blocker.partition_key(),
                        "removed blocker without a durable record"
                    );
                    stats.removed_stale += 1;
                }
            }
        }
    }

    for (partition_key, record) in chosen {
        if registry
            .lookup(partition_key)
            .is_some_and(|b| b.migration_id() == record.migration_id)
        {
            continue;
        }
        let blocker = Arc::new(AccessBlocker::new(record.clone(), policy));
        registry.register(blocker)?;
        debug!(
            migration_id = %record.migration_id,
            partition_key = %partition_key,
            state = %record.state,
            block_ts = ?record.block_timestamp,
            "restored access blocker"
        );
        stats.created += 1;
    }

    info!("recovered migration blockers: {stats}");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_blocker::Operation;
    use crate::state::{MigrationState, Protocol, Transition};
    use tokio_util::sync::CancellationToken;
    use utils::id::MigrationId;
    use utils::timestamp::Timestamp;

    fn record(key: &str, transitions: &[Transition]) -> MigrationRecord {
        let mut record = MigrationRecord::new(
            MigrationId::generate(),
            PartitionKey::new(key),
            Protocol::MultiTenant,
            String::new(),
            String::new(),
        );
        for t in transitions {
            record.apply(t).unwrap();
        }
        record
    }

    fn blocking(ts: u64) -> Transition {
        Transition::StartBlocking {
            block_timestamp: Timestamp(ts),
        }
    }

    fn forget() -> Transition {
        Transition::Forget {
            expire_at: std::time::SystemTime::now().into(),
        }
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let records = vec![
            record("T1", &[blocking(100)]),
            record(
                "T2",
                &[
                    blocking(50),
                    Transition::Commit {
                        op_time: Timestamp(70),
                    },
                ],
            ),
            record("T3", &[]),
        ];

        let ops = [
            Operation::read_at(Timestamp(60)),
            Operation::read_at(Timestamp(40)),
            Operation::write(Timestamp(200)),
        ];
        let cancel = CancellationToken::new();

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let registry = BlockerRegistry::new();
            let clock = LogicalClock::default();
            for _ in 0..2 {
                reconcile(&records, &registry, &clock, LinearizableReadPolicy::Block).unwrap();
            }
            assert_eq!(registry.len(), 3);
            assert_eq!(clock.now(), Timestamp(100));

            let mut decisions = Vec::new();
            for key in ["T2", "T3"] {
                let blocker = registry.lookup(&PartitionKey::new(key)).unwrap();
                for op in &ops {
                    decisions.push(blocker.admit(op, &cancel).await.is_ok());
                }
            }
            let t1 = registry.lookup(&PartitionKey::new("T1")).unwrap();
            assert_eq!(t1.state(), MigrationState::Blocking);
            assert_eq!(t1.block_timestamp(), Some(Timestamp(100)));
            outcomes.push(decisions);
        }
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[0], vec![false, true, false, true, true, true]);
    }

    #[test]
    fn existing_blockers_catch_up_in_place() {
        let registry = BlockerRegistry::new();
        let clock = LogicalClock::default();
        let mut rec = record("T1", &[blocking(100)]);
        reconcile([&rec], &registry, &clock, LinearizableReadPolicy::Block).unwrap();
        let before = registry.lookup(&PartitionKey::new("T1")).unwrap();

        rec.apply(&Transition::Abort {
            op_time: Timestamp(120),
            reason: "test".to_string(),
        })
        .unwrap();
        let stats = reconcile([&rec], &registry, &clock, LinearizableReadPolicy::Block).unwrap();
        assert_eq!(stats.caught_up, 1);
        assert_eq!(stats.created, 0);

        let after = registry.lookup(&PartitionKey::new("T1")).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.state(), MigrationState::Aborted);
        assert_eq!(clock.now(), Timestamp(120));

        // The record is gone from the store: so is the blocker.
        let stats = reconcile(std::iter::empty(), &registry, &clock, LinearizableReadPolicy::Block).unwrap();
        assert_eq!(stats.removed_stale, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn unforgotten_migration_wins_over_forgotten_ones() {
        let old = record(
            "T1",
            &[
                blocking(10),
                Transition::Abort {
                    op_time: Timestamp(20),
                    reason: "test".to_string(),
                },
                forget(),
            ],
        );
        let new = record("T1", &[blocking(30)]);

        let registry = BlockerRegistry::new();
        let clock = LogicalClock::default();
        reconcile([&new, &old], &registry, &clock, LinearizableReadPolicy::Block).unwrap();
        let blocker = registry.lookup(&PartitionKey::new("T1")).unwrap();
        assert_eq!(blocker.migration_id(), new.migration_id);

        let conflicting = record("T1", &[]);
        assert!(reconcile(
            [&new, &conflicting],
            &registry,
            &clock,
            LinearizableReadPolicy::Block
        )
        .is_err());
    }
}
