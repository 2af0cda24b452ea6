//! Store-side protocol primitives shared by the proposal and release
//! coordinators: the propose lock and the global index.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use lockstep_common::{LockstepError, Result};
use lockstep_store::{CoordinationStore, TxnCompare, TxnOp};

use crate::config::LockServiceConfig;
use crate::keys::KeyLayout;

/// Read the global index; an absent key means no operation was ever
/// committed.
pub async fn read_index(store: &Arc<dyn CoordinationStore>, keys: &KeyLayout) -> Result<u64> {
    match store.get(&keys.index_key()).await? {
        Some(raw) => raw
            .parse()
            .map_err(|_| LockstepError::Infrastructure(format!("corrupt global index '{raw}'"))),
        None => Ok(0),
    }
}

/// Compare guarding a commit against the index value it was read at.
pub fn index_compare(keys: &KeyLayout, index: u64) -> TxnCompare {
    if index == 0 {
        TxnCompare::KeyAbsent(keys.index_key())
    } else {
        TxnCompare::ValueEquals(keys.index_key(), index.to_string())
    }
}

/// Holds the store-resident propose lock until released.
///
/// The key is bound to a short-lived lease so a crashed holder cannot wedge
/// acquisition across the cluster; release revokes the lease, which deletes
/// the key.
pub struct ProposeLockGuard {
    store: Arc<dyn CoordinationStore>,
    lease: lockstep_store::LeaseId,
}

impl ProposeLockGuard {
    pub async fn release(self) {
        if let Err(e) = self.store.revoke_lease(self.lease).await {
            // The lease's own TTL bounds how long the lock stays stuck.
            warn!(error = %e, "Failed to release propose lock; lease TTL will reclaim it");
        }
    }
}

/// Contend for the propose lock, retrying until `propose_lock_timeout`.
pub async fn acquire_propose_lock(
    store: &Arc<dyn CoordinationStore>,
    keys: &KeyLayout,
    owner: &str,
    config: &LockServiceConfig,
) -> Result<ProposeLockGuard> {
    let key = keys.propose_lock_key();
    let deadline = Instant::now() + config.propose_lock_timeout;
    loop {
        let lease = store.grant_lease(config.propose_lock_ttl).await?;
        let acquired = store
            .txn(
                vec![TxnCompare::KeyAbsent(key.clone())],
                vec![TxnOp::PutWithLease {
                    key: key.clone(),
                    value: owner.to_string(),
                    lease,
                }],
            )
            .await?;
        if acquired {
            debug!(owner = %owner, "Propose lock acquired");
            return Ok(ProposeLockGuard {
                store: store.clone(),
                lease,
            });
        }
        if let Err(e) = store.revoke_lease(lease).await {
            debug!(error = %e, "Failed to revoke unused propose-lock lease");
        }
        if Instant::now() >= deadline {
            return Err(LockstepError::Infrastructure(
                "propose lock contended past timeout".to_string(),
            ));
        }
        tokio::time::sleep(config.propose_retry_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_store::MemoryStore;
    use std::time::Duration;

    fn setup() -> (Arc<dyn CoordinationStore>, KeyLayout, LockServiceConfig) {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let keys = KeyLayout::new("/test");
        let config = LockServiceConfig {
            propose_lock_timeout: Duration::from_millis(200),
            propose_retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        (store, keys, config)
    }

    #[tokio::test]
    async fn test_read_index_defaults_to_zero() {
        let (store, keys, _) = setup();
        assert_eq!(read_index(&store, &keys).await.unwrap(), 0);

        store.put(&keys.index_key(), "17").await.unwrap();
        assert_eq!(read_index(&store, &keys).await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_corrupt_index_is_infrastructure_error() {
        let (store, keys, _) = setup();
        store.put(&keys.index_key(), "banana").await.unwrap();
        assert!(matches!(
            read_index(&store, &keys).await.unwrap_err(),
            LockstepError::Infrastructure(_)
        ));
    }

    #[tokio::test]
    async fn test_propose_lock_excludes_and_releases() {
        let (store, keys, config) = setup();

        let guard = acquire_propose_lock(&store, &keys, "a", &config)
            .await
            .unwrap();

        // A second contender times out while the lock is held.
        let err = acquire_propose_lock(&store, &keys, "b", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LockstepError::Infrastructure(_)));

        guard.release().await;
        assert_eq!(store.get(&keys.propose_lock_key()).await.unwrap(), None);

        // Released, so the next contender wins.
        let guard = acquire_propose_lock(&store, &keys, "b", &config)
            .await
            .unwrap();
        guard.release().await;
    }
}
