//! Map from partition key to the access blocker gating it.
//!
//! Lookups happen on the hot path of every operation, so the map sits behind
//! a plain [`RwLock`] held only for the duration of a map access. Blockers
//! are handed out as `Arc`s and waited on outside the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::*;
use utils::id::MigrationId;

use crate::access_blocker::{AccessBlocker, BlockerStatus};
use crate::metrics::ACTIVE_BLOCKERS;
use crate::state::PartitionKey;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("partition {partition_key} is already gated by active migration {existing}")]
    Conflict {
        partition_key: PartitionKey,
        existing: MigrationId,
    },
}

#[derive(Default)]
pub struct BlockerRegistry {
    blockers: RwLock<HashMap<PartitionKey, Arc<AccessBlocker>>>,
}

impl BlockerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The blocker gating `partition_key`, if any.
    pub fn lookup(&self, partition_key: &PartitionKey) -> Option<Arc<AccessBlocker>> {
        self.blockers.read().unwrap().get(partition_key).cloned()
    }

    /// Installs `blocker` for its partition key.
    ///
    /// A terminal blocker of an earlier migration is replaced. Registering
    /// the same migration twice is a no-op that returns the blocker already
    /// in place, so the caller always gets the one that gates operations.
    pub fn register(&self, blocker: Arc<AccessBlocker>) -> Result<Arc<AccessBlocker>, RegistryError> {
        let partition_key = blocker.partition_key().clone();
        let mut blockers = self.blockers.write().unwrap();
        if let Some(existing) = blockers.get(&partition_key) {
            if existing.migration_id() == blocker.migration_id() {
                return Ok(Arc::clone(existing));
            }
            check_replaceable(existing, &partition_key)?;
            info!(
                partition_key = %partition_key,
                "replacing blocker of finished migration {} with {}",
                existing.migration_id(),
                blocker.migration_id()
            );
        } else {
            ACTIVE_BLOCKERS.inc();
        }
        blockers.insert(partition_key, Arc::clone(&blocker));
        Ok(blocker)
    }

    /// Fails with the error [`BlockerRegistry::register`] would return for a
    /// blocker of `migration_id` on `partition_key`, without installing it.
    pub fn check_register(
        &self,
        partition_key: &PartitionKey,
        migration_id: MigrationId,
    ) -> Result<(), RegistryError> {
        match self.blockers.read().unwrap().get(partition_key) {
            Some(existing) if existing.migration_id() != migration_id => {
                check_replaceable(existing, partition_key)
            }
            _ => Ok(()),
        }
    }

    /// Removes the blocker for `partition_key` if it belongs to
    /// `migration_id` and its migration is finished and forgotten.
    /// Returns whether anything was removed.
    pub fn unregister(&self, partition_key: &PartitionKey, migration_id: MigrationId) -> bool {
        let mut blockers = self.blockers.write().unwrap();
        let Some(existing) = blockers.get(partition_key) else {
            return false;
        };
        if existing.migration_id() != migration_id
            || !existing.is_terminal()
            || !existing.is_forgotten()
        {
            return false;
        }
        blockers.remove(partition_key);
        ACTIVE_BLOCKERS.dec();
        true
    }

    /// Drops the blocker for `partition_key` regardless of its state, if it
    /// belongs to `migration_id`. Used when the durable record it was built
    /// from no longer exists.
    pub(crate) fn remove_stale(&self, partition_key: &PartitionKey, migration_id: MigrationId) -> bool {
        let mut blockers = self.blockers.write().unwrap();
        match blockers.get(partition_key) {
            Some(existing) if existing.migration_id() == migration_id => {
                blockers.remove(partition_key);
                ACTIVE_BLOCKERS.dec();
                true
            }
            _ => false,
        }
    }

    pub fn get_by_migration_id(&self, migration_id: MigrationId) -> Option<Arc<AccessBlocker>> {
        self.blockers
            .read()
            .unwrap()
            .values()
            .find(|b| b.migration_id() == migration_id)
            .cloned()
    }

    pub fn blockers(&self) -> Vec<Arc<AccessBlocker>> {
        self.blockers.read().unwrap().values().cloned().collect()
    }

    /// Status of every registered blocker, keyed by partition key.
    pub fn snapshot(&self) -> BTreeMap<PartitionKey, BlockerStatus> {
        // Collect first: status() takes the blocker's own locks.
        self.blockers()
            .into_iter()
            .map(|b| (b.partition_key().clone(), b.status()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blockers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_replaceable(
    existing: &AccessBlocker,
    partition_key: &PartitionKey,
) -> Result<(), RegistryError> {
    if existing.is_terminal() {
        Ok(())
    } else {
        Err(RegistryError::Conflict {
            partition_key: partition_key.clone(),
            existing: existing.migration_id(),
        })
    }
}
