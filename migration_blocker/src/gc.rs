//! Garbage collection of forgotten migrations.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::donor::{MigrationDonor, Role};
use crate::metrics::GC_REMOVED_MIGRATIONS;
use crate::record_store::MigrationStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcSummary {
    pub removed: usize,
    /// Expired, but some operation is still waiting on the blocker.
    pub skipped_with_waiters: usize,
    pub not_yet_expired: usize,
}

/// Deletes every forgotten record whose `expire_at` is before `now` and
/// whose blocker has no waiters, together with the blocker.
///
/// Only the primary deletes records; secondaries learn about deletions
/// through replication.
pub async fn collect_garbage<S: MigrationStore>(
    donor: &MigrationDonor<S>,
    now: SystemTime,
) -> anyhow::Result<GcSummary> {
    let mut summary = GcSummary::default();
    let mut store = donor.store.lock().await;
    if donor.role() != Role::Primary {
        return Ok(summary);
    }

    let expired: Vec<_> = store
        .records()
        .values()
        .filter_map(|r| r.expire_at.map(|expire_at| (r, expire_at)))
        .filter_map(|(r, expire_at)| {
            if !r.state.is_terminal() {
                error!(
                    migration_id = %r.migration_id,
                    "forgotten migration in non-terminal state {}, not collecting", r.state
                );
                return None;
            }
            if expire_at.0 > now {
                summary.not_yet_expired += 1;
                return None;
            }
            Some((r.migration_id, r.partition_key.clone()))
        })
        .collect();

    for (migration_id, partition_key) in expired {
        if let Some(blocker) = donor.registry.get_by_migration_id(migration_id) {
            let waiters = blocker.num_waiters();
            if waiters > 0 {
                debug!(
                    migration_id = %migration_id,
                    "not collecting migration with {waiters} waiters"
                );
                summary.skipped_with_waiters += 1;
                continue;
            }
        }
        store.remove(&migration_id).await?;
        donor.registry.unregister(&partition_key, migration_id);
        GC_REMOVED_MIGRATIONS.inc();
        info!(
            migration_id = %migration_id,
            partition_key = %partition_key,
            "removed forgotten migration"
        );
        summary.removed += 1;
    }

    Ok(summary)
}

/// Runs [`collect_garbage`] every `gc_interval` until cancelled.
pub async fn task_main<S: MigrationStore>(
    donor: Arc<MigrationDonor<S>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let gc_interval = donor.conf().gc_interval;
    info!("starting migration gc task, interval {gc_interval:?}");
    loop {
        tokio::select! {
            _ = sleep(gc_interval) => {}
            _ = cancel.cancelled() => {
                info!("migration gc task cancelled");
                return Ok(());
            }
        }

        match collect_garbage(&donor, SystemTime::now())
            .instrument(info_span!("migration_gc"))
            .await
        {
            Ok(summary) if summary.removed > 0 || summary.skipped_with_waiters > 0 => {
                info!(
                    "gc removed {} migrations, skipped {} with waiters, {} not yet expired",
                    summary.removed, summary.skipped_with_waiters, summary.not_yet_expired
                );
            }
            Ok(_) => {}
            Err(e) => error!("failed to collect forgotten migrations: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::access_blocker::Operation;
    use crate::donor::MigrationStart;
    use crate::record_store::MemoryMigrationStore;
    use crate::state::{PartitionKey, Protocol};
    use crate::BlockerConf;
    use utils::id::MigrationId;
    use utils::timestamp::Timestamp;

    async fn donor_with_migration(
        key: &str,
    ) -> (Arc<MigrationDonor<MemoryMigrationStore>>, MigrationId) {
        let donor = Arc::new(MigrationDonor::new(
            BlockerConf::dummy(),
            MemoryMigrationStore::new(),
        ));
        donor.step_up().await.unwrap();
        let migration_id = MigrationId::generate();
        donor
            .start_migration(MigrationStart {
                migration_id,
                partition_key: PartitionKey::new(key),
                protocol: Protocol::MultiTenant,
                recipient_connection_string: String::new(),
                read_preference: String::new(),
            })
            .await
            .unwrap();
        donor.start_blocking(migration_id).await.unwrap();
        (donor, migration_id)
    }

    #[tokio::test]
    async fn never_collects_active_migrations() {
        let (donor, migration_id) = donor_with_migration("T1").await;
        let far_future = SystemTime::now() + Duration::from_secs(3600 * 24 * 365);

        let summary = collect_garbage(&donor, far_future).await.unwrap();
        assert_eq!(summary, GcSummary::default());
        assert_eq!(donor.records().await.len(), 1);

        donor.commit(migration_id, Timestamp(100)).await.unwrap();
        let summary = collect_garbage(&donor, far_future).await.unwrap();
        assert_eq!(summary.removed, 0);
        assert!(donor.registry().lookup(&PartitionKey::new("T1")).is_some());
    }

    #[tokio::test]
    async fn collects_after_expiry() {
        let (donor, migration_id) = donor_with_migration("T1").await;
        donor
            .abort(migration_id, Timestamp(100), "test".to_string())
            .await
            .unwrap();
        let expire_at = SystemTime::now() + Duration::from_secs(60);
        donor.forget(migration_id, expire_at).await.unwrap();

        let summary = collect_garbage(&donor, SystemTime::now()).await.unwrap();
        assert_eq!(summary.not_yet_expired, 1);
        assert_eq!(summary.removed, 0);

        let summary = collect_garbage(&donor, expire_at + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert!(donor.records().await.is_empty());
        assert!(donor.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn skips_blockers_with_waiters() {
        let (donor, migration_id) = donor_with_migration("T1").await;
        let key = PartitionKey::new("T1");
        let blocker = donor.registry().lookup(&key).unwrap();

        let cancel = CancellationToken::new();
        let waiter = tokio::spawn({
            let blocker = Arc::clone(&blocker);
            let cancel = cancel.clone();
            async move { blocker.admit(&Operation::write(Timestamp(500)), &cancel).await }
        });
        while blocker.num_waiters() == 0 {
            sleep(Duration::from_millis(1)).await;
        }

        donor.commit(migration_id, Timestamp(600)).await.unwrap();
        donor
            .forget(migration_id, SystemTime::now())
            .await
            .unwrap();

        // The committed waiter has been woken but may not have run yet.
        let summary = collect_garbage(&donor, SystemTime::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(summary.removed + summary.skipped_with_waiters, 1);

        assert!(waiter.await.unwrap().is_err());
        assert_eq!(blocker.num_waiters(), 0);
        let summary = collect_garbage(&donor, SystemTime::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(summary.skipped_with_waiters, 0);
        assert!(donor.records().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn task_main_stops_on_cancel() {
        let (donor, migration_id) = donor_with_migration("T1").await;
        donor.commit(migration_id, Timestamp(100)).await.unwrap();
        donor
            .forget(migration_id, SystemTime::now())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(task_main(Arc::clone(&donor), cancel.clone()));
        while !donor.registry().is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(donor.records().await.is_empty());
    }
}
