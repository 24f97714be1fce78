//! End-to-end migration scenarios driven through the donor API.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use migration_blocker::access_blocker::{AdmitError, Operation};
use migration_blocker::donor::{MigrationDonor, MigrationStart};
use migration_blocker::record_store::{FileMigrationStore, MemoryMigrationStore, MigrationStore};
use migration_blocker::state::{MigrationState, PartitionKey, Protocol};
use migration_blocker::BlockerConf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use utils::id::MigrationId;
use utils::logging::{self, LogFormat};
use utils::timestamp::Timestamp;

fn init_logging() {
    // Only the first test to get here installs the subscriber.
    let _ = logging::init(LogFormat::Test, logging::Output::Stderr);
}

fn start(key: &str) -> MigrationStart {
    MigrationStart {
        migration_id: MigrationId::generate(),
        partition_key: PartitionKey::new(key),
        protocol: Protocol::MultiTenant,
        recipient_connection_string: "recipient-rs/recipient-0:27017".to_string(),
        read_preference: "primaryPreferred".to_string(),
    }
}

async fn primary<S: MigrationStore>(store: S) -> Arc<MigrationDonor<S>> {
    init_logging();
    let donor = Arc::new(MigrationDonor::new(BlockerConf::dummy(), store));
    donor.step_up().await.unwrap();
    donor
}

fn spawn_admit<S: MigrationStore + 'static>(
    donor: &Arc<MigrationDonor<S>>,
    key: &str,
    op: Operation,
    cancel: &CancellationToken,
) -> JoinHandle<Result<(), AdmitError>> {
    let donor = Arc::clone(donor);
    let key = PartitionKey::new(key);
    let cancel = cancel.clone();
    tokio::spawn(async move { donor.admit(&key, &op, &cancel).await })
}

async fn wait_for_waiters<S: MigrationStore>(donor: &MigrationDonor<S>, key: &str, n: usize) {
    let blocker = donor
        .registry()
        .lookup(&PartitionKey::new(key))
        .expect("partition has a blocker");
    while blocker.num_waiters() != n {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Starts a migration on `key` and moves it to blocking, returning its id
/// and block timestamp.
async fn blocking_migration<S: MigrationStore>(
    donor: &MigrationDonor<S>,
    key: &str,
) -> (MigrationId, Timestamp) {
    let s = start(key);
    let migration_id = s.migration_id;
    donor.start_migration(s).await.unwrap();
    let block_ts = donor.start_blocking(migration_id).await.unwrap();
    (migration_id, block_ts)
}

#[tokio::test(start_paused = true)]
async fn blocked_write_is_rejected_after_commit() {
    let donor = primary(MemoryMigrationStore::new()).await;
    let cancel = CancellationToken::new();
    let (migration_id, block_ts) = blocking_migration(&donor, "T1").await;

    // Reads before the boundary are never held up.
    donor
        .admit(
            &PartitionKey::new("T1"),
            &Operation::read_at(Timestamp(block_ts.0 - 1)),
            &cancel,
        )
        .await
        .unwrap();

    let write = spawn_admit(&donor, "T1", Operation::write(block_ts + 50), &cancel);
    wait_for_waiters(&donor, "T1", 1).await;

    donor.commit(migration_id, block_ts + 100).await.unwrap();
    match write.await.unwrap() {
        Err(AdmitError::MigrationCommitted {
            recipient_connection_string,
            read_preference,
            ..
        }) => {
            assert_eq!(recipient_connection_string, "recipient-rs/recipient-0:27017");
            assert_eq!(read_preference, "primaryPreferred");
        }
        other => panic!("expected MigrationCommitted, got {other:?}"),
    }

    let status = donor.status();
    let blocker = &status.blockers[&PartitionKey::new("T1")];
    assert_eq!(blocker.state, MigrationState::Committed);
    assert_eq!(blocker.num_blocked_writes, 1);
    assert_eq!(blocker.num_tenant_migration_committed_errors, 1);
    assert_eq!(blocker.num_waiters, 0);
}

#[tokio::test(start_paused = true)]
async fn stale_write_timestamp_does_not_bypass_the_gate() {
    let donor = primary(MemoryMigrationStore::new()).await;
    let cancel = CancellationToken::new();
    let (migration_id, block_ts) = blocking_migration(&donor, "T1").await;
    let stale = Timestamp(block_ts.0 - 1);

    let write = spawn_admit(&donor, "T1", Operation::write(stale), &cancel);
    wait_for_waiters(&donor, "T1", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!write.is_finished());

    donor.commit(migration_id, block_ts + 100).await.unwrap();
    assert!(matches!(
        write.await.unwrap(),
        Err(AdmitError::MigrationCommitted { .. })
    ));
    let res = donor
        .admit(&PartitionKey::new("T1"), &Operation::write(stale), &cancel)
        .await;
    assert!(matches!(res, Err(AdmitError::MigrationCommitted { .. })), "{res:?}");

    let status = donor.status();
    let blocker = &status.blockers[&PartitionKey::new("T1")];
    assert_eq!(blocker.num_blocked_writes, 1);
    assert_eq!(blocker.num_tenant_migration_committed_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn blocked_write_proceeds_after_abort() {
    let donor = primary(MemoryMigrationStore::new()).await;
    let cancel = CancellationToken::new();
    let (migration_id, block_ts) = blocking_migration(&donor, "T1").await;

    let write = spawn_admit(&donor, "T1", Operation::write(block_ts + 50), &cancel);
    wait_for_waiters(&donor, "T1", 1).await;

    donor
        .abort(migration_id, block_ts + 100, "recipient failed".to_string())
        .await
        .unwrap();
    write.await.unwrap().unwrap();

    let status = donor.status();
    let blocker = &status.blockers[&PartitionKey::new("T1")];
    assert_eq!(blocker.state, MigrationState::Aborted);
    assert_eq!(blocker.abort_reason.as_deref(), Some("recipient failed"));
    assert_eq!(blocker.num_blocked_writes, 1);
    assert_eq!(blocker.num_tenant_migration_aborted_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn read_deadline_expires_while_blocking() {
    let donor = primary(MemoryMigrationStore::new()).await;
    let cancel = CancellationToken::new();
    let (_, block_ts) = blocking_migration(&donor, "T1").await;

    let op = Operation::read_at(block_ts).with_timeout(Duration::from_millis(10));
    let res = donor.admit(&PartitionKey::new("T1"), &op, &cancel).await;
    assert!(
        matches!(res, Err(AdmitError::DeadlineExceeded { .. })),
        "{res:?}"
    );

    let status = donor.status();
    let blocker = &status.blockers[&PartitionKey::new("T1")];
    assert_eq!(blocker.num_blocked_reads, 1);
    assert_eq!(blocker.num_tenant_migration_committed_errors, 0);
    assert_eq!(blocker.num_tenant_migration_aborted_errors, 0);
    assert_eq!(blocker.state, MigrationState::Blocking);
}

#[tokio::test(start_paused = true)]
async fn partitions_are_isolated() {
    let donor = primary(MemoryMigrationStore::new()).await;
    let cancel = CancellationToken::new();
    let (m1, ts1) = blocking_migration(&donor, "T1").await;
    let (_m2, ts2) = blocking_migration(&donor, "T2").await;

    let t2_write = spawn_admit(&donor, "T2", Operation::write(ts2 + 10), &cancel);
    wait_for_waiters(&donor, "T2", 1).await;

    donor.commit(m1, ts1 + 100).await.unwrap();

    // T1 now rejects, T2 still holds its waiter and admits old reads.
    let res = donor
        .admit(&PartitionKey::new("T1"), &Operation::write(ts2 + 200), &cancel)
        .await;
    assert!(matches!(res, Err(AdmitError::MigrationCommitted { .. })));
    donor
        .admit(
            &PartitionKey::new("T2"),
            &Operation::read_at(Timestamp(ts2.0 - 1)),
            &cancel,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!t2_write.is_finished());
    assert_eq!(
        donor.registry().lookup(&PartitionKey::new("T2")).unwrap().state(),
        MigrationState::Blocking
    );

    // Untouched partitions are never gated.
    donor
        .admit(&PartitionKey::new("T3"), &Operation::write(ts2 + 300), &cancel)
        .await
        .unwrap();

    t2_write.abort();
}

#[tokio::test(start_paused = true)]
async fn restart_in_blocking_keeps_gating() {
    let workdir = camino_tempfile::tempdir().unwrap();
    let dir = workdir.path().join("migrations");
    let cancel = CancellationToken::new();

    let (migration_id, block_ts) = {
        let donor = primary(open_store(&dir)).await;
        let (migration_id, block_ts) = blocking_migration(&donor, "T1").await;

        let write = spawn_admit(&donor, "T1", Operation::write(block_ts + 10), &cancel);
        wait_for_waiters(&donor, "T1", 1).await;
        // The in-flight operation dies with the process.
        write.abort();
        assert!(write.await.unwrap_err().is_cancelled());
        (migration_id, block_ts)
    };

    let donor = primary(open_store(&dir)).await;
    let blocker = donor.registry().lookup(&PartitionKey::new("T1")).unwrap();
    assert_eq!(blocker.migration_id(), migration_id);
    assert_eq!(blocker.state(), MigrationState::Blocking);
    assert_eq!(blocker.block_timestamp(), Some(block_ts));
    assert_eq!(blocker.num_waiters(), 0);
    assert_eq!(blocker.status().num_blocked_writes, 0);

    let write = spawn_admit(&donor, "T1", Operation::write(block_ts + 20), &cancel);
    wait_for_waiters(&donor, "T1", 1).await;
    assert!(!write.is_finished());

    // Timestamps handed out after the restart stay above the old ones.
    assert!(donor.clock().tick() > block_ts);

    donor.commit(migration_id, block_ts + 30).await.unwrap();
    assert!(matches!(
        write.await.unwrap(),
        Err(AdmitError::MigrationCommitted { .. })
    ));
    // Idempotent after restart too.
    assert_eq!(donor.start_blocking(migration_id).await.unwrap(), block_ts);
}

#[tokio::test]
async fn forgotten_migration_is_collected_across_restart() {
    let workdir = camino_tempfile::tempdir().unwrap();
    let dir = workdir.path().join("migrations");

    let (old, new) = {
        let donor = primary(open_store(&dir)).await;
        let (old, ts) = blocking_migration(&donor, "T1").await;
        donor.commit(old, ts + 1).await.unwrap();
        donor
            .forget(old, std::time::SystemTime::now())
            .await
            .unwrap();
        let (new, _) = blocking_migration(&donor, "T1").await;
        (old, new)
    };

    let donor = primary(open_store(&dir)).await;
    let blocker = donor.registry().lookup(&PartitionKey::new("T1")).unwrap();
    assert_eq!(blocker.migration_id(), new);
    assert_eq!(donor.records().await.len(), 2);

    let summary = migration_blocker::gc::collect_garbage(
        &donor,
        std::time::SystemTime::now() + Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(summary.removed, 1);
    let records = donor.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].migration_id, new);
    assert!(records.iter().all(|r| r.migration_id != old));
    assert!(donor.registry().lookup(&PartitionKey::new("T1")).is_some());
}

fn open_store(dir: &Utf8Path) -> FileMigrationStore {
    FileMigrationStore::open(dir, true).unwrap()
}
