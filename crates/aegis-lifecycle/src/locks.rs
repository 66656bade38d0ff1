//! Per-position mutual exclusion, sharded by [`PositionId`] so concurrent
//! work against unrelated positions never contends.

use std::collections::BTreeMap;
use std::sync::Arc;

use aegis_schemas::PositionId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily-populated set of per-position locks. Entries are created on
/// first use and never removed: a closed position's lock is cheap to keep
/// around and removing it would race a concurrent `lock()` call against the
/// same id.
pub struct PositionLocks {
    shards: Mutex<BTreeMap<PositionId, Arc<Mutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        PositionLocks { shards: Mutex::new(BTreeMap::new()) }
    }

    /// Acquires the lock for `position_id`, creating it if this is the
    /// first request against that id.
    pub async fn lock(&self, position_id: PositionId) -> OwnedMutexGuard<()> {
        let shard = {
            let mut shards = self.shards.lock().await;
            Arc::clone(shards.entry(position_id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        shard.lock_owned().await
    }
}

impl Default for PositionLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_positions_do_not_contend() {
        let locks = PositionLocks::new();
        let a = PositionId::new();
        let b = PositionId::new();
        let guard_a = locks.lock(a).await;
        // A lock on a different position must not block.
        let guard_b = tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock(b)).await;
        assert!(guard_b.is_ok());
        drop(guard_a);
    }

    #[tokio::test]
    async fn same_position_serializes() {
        let locks = PositionLocks::new();
        let id = PositionId::new();
        let guard = locks.lock(id).await;
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), locks.lock(id)).await;
        assert!(second.is_err());
        drop(guard);
    }
}
