//! Global prometheus metrics of the migration access blockers.
//!
//! Per-migration counters live on each blocker and are reported in its
//! status; these aggregate over all blockers of the process.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

pub static BLOCKED_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "migration_blocker_blocked_operations_total",
        "Number of operations suspended waiting for a migration decision, by kind",
        &["kind"]
    )
    .expect("Failed to register migration_blocker_blocked_operations_total counter")
});

pub static REJECTED_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "migration_blocker_rejected_operations_total",
        "Number of operations rejected by an access blocker, by reason",
        &["reason"]
    )
    .expect("Failed to register migration_blocker_rejected_operations_total counter")
});

pub static WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "migration_blocker_wait_seconds",
        "Time operations spent suspended in an access blocker",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to register migration_blocker_wait_seconds histogram")
});

pub static STATE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "migration_blocker_state_transitions_total",
        "Number of migration transitions applied to access blockers, by target state",
        &["state"]
    )
    .expect("Failed to register migration_blocker_state_transitions_total counter")
});

pub static ACTIVE_BLOCKERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "migration_blocker_active_blockers",
        "Number of access blockers currently registered"
    )
    .expect("Failed to register migration_blocker_active_blockers gauge")
});

pub static GC_REMOVED_MIGRATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "migration_blocker_gc_removed_migrations_total",
        "Number of forgotten migrations removed by the garbage collector"
    )
    .expect("Failed to register migration_blocker_gc_removed_migrations_total counter")
});

pub static PERSIST_RECORD_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "migration_blocker_persist_record_seconds",
        "Seconds to durably persist a migration record",
        vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("Failed to register migration_blocker_persist_record_seconds histogram")
});

pub static RECOVERY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "migration_blocker_recovery_seconds",
        "Seconds to rebuild the blocker registry from the record store",
        vec![0.001, 0.01, 0.1, 1.0, 10.0]
    )
    .expect("Failed to register migration_blocker_recovery_seconds histogram")
});
