//! Running commands through the gate.
//!
//! The command layer describes each command through [`GatedCommand`];
//! [`run_gated`] makes sure the storage callback only runs once the blocker
//! of the command's partition admitted it, and never while the command is
//! suspended.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::access_blocker::{AdmitError, EffectiveTimestamp, Operation, OperationKind};
use crate::donor::MigrationDonor;
use crate::record_store::MigrationStore;
use crate::state::PartitionKey;

/// What the gate needs to know about an incoming command.
pub trait GatedCommand {
    /// The tenant id or shard key range the command targets.
    fn partition_key(&self) -> PartitionKey;

    fn kind(&self) -> OperationKind;

    /// For writes the timestamp they will commit at; for reads the one they
    /// are pinned to, or [`EffectiveTimestamp::Linearizable`].
    fn effective_timestamp(&self) -> EffectiveTimestamp;

    /// The client's time limit for the whole command.
    fn deadline(&self) -> Option<Instant> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatedError<E> {
    #[error(transparent)]
    Admit(AdmitError),
    #[error("command failed: {0}")]
    Execute(E),
}

/// Admits `cmd` on `donor` and, if allowed, runs `exec`.
pub async fn run_gated<S, C, F, Fut, T, E>(
    donor: &MigrationDonor<S>,
    cmd: &C,
    cancel: &CancellationToken,
    exec: F,
) -> Result<T, GatedError<E>>
where
    S: MigrationStore,
    C: GatedCommand + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let op = Operation {
        kind: cmd.kind(),
        timestamp: cmd.effective_timestamp(),
        deadline: cmd.deadline(),
    };
    donor
        .admit(&cmd.partition_key(), &op, cancel)
        .await
        .map_err(GatedError::Admit)?;
    exec().await.map_err(GatedError::Execute)
}
