//! In-memory coordination store.
//!
//! A single-process implementation of the full store contract, used by the
//! integration tests and by embedded deployments. All mutations go through
//! one mutex-guarded state so transactions are atomic and every watcher
//! observes the same total order. The event log is retained in full so a
//! watch can replay from any past revision.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use lockstep_common::{LockstepError, Result};

use crate::store::CoordinationStore;
use crate::types::{
    KeyValue, LeaseId, TxnCompare, TxnOp, WatchEvent, WatchEventKind, WatchMessage, WatchStream,
};

struct LeaseInfo {
    #[allow(dead_code)]
    ttl: Duration,
    keys: Vec<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchMessage>,
}

#[derive(Default)]
struct StoreState {
    kvs: BTreeMap<String, String>,
    revision: u64,
    log: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl StoreState {
    fn emit(&mut self, kind: WatchEventKind, key: &str, value: Option<String>, prev: Option<String>) {
        self.revision += 1;
        let event = WatchEvent {
            kind,
            key: key.to_string(),
            value,
            prev_value: prev,
            revision: self.revision,
        };
        self.log.push(event.clone());
        self.watchers.retain(|watcher| {
            if !event.key.starts_with(&watcher.prefix) {
                return true;
            }
            watcher.tx.send(WatchMessage::Event(event.clone())).is_ok()
        });
    }

    fn apply_put(&mut self, key: &str, value: &str) {
        let prev = self.kvs.insert(key.to_string(), value.to_string());
        self.emit(WatchEventKind::Create, key, Some(value.to_string()), prev);
    }

    fn apply_delete(&mut self, key: &str) -> bool {
        match self.kvs.remove(key) {
            Some(prev) => {
                self.emit(WatchEventKind::Delete, key, None, Some(prev));
                true
            }
            None => false,
        }
    }

    fn check(&self, compare: &TxnCompare) -> bool {
        match compare {
            TxnCompare::KeyAbsent(key) => !self.kvs.contains_key(key),
            TxnCompare::KeyExists(key) => self.kvs.contains_key(key),
            TxnCompare::ValueEquals(key, expected) => {
                self.kvs.get(key).is_some_and(|value| value == expected)
            }
        }
    }
}

/// In-memory `CoordinationStore` with replayable watches and revocable
/// leases.
///
/// Leases here never expire on their own: renewal policy belongs to the
/// store per the contract, and tests simulate a participant crash by
/// calling [`MemoryStore::expire_lease`].
pub struct MemoryStore {
    state: Mutex<StoreState>,
    leases: DashMap<LeaseId, LeaseInfo>,
    next_lease: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            leases: DashMap::new(),
            next_lease: AtomicU64::new(1),
        }
    }

    /// Force-expire a lease, deleting its attached keys. Test hook standing
    /// in for the store's own TTL enforcement.
    pub async fn expire_lease(&self, lease: LeaseId) -> Result<()> {
        debug!(lease = lease, "Force-expiring lease");
        self.revoke_lease(lease).await
    }

    /// Drop every active watch, delivering the explicit `Canceled` signal.
    /// Test hook for exercising desynchronization recovery.
    pub fn cancel_watches(&self) {
        let mut state = self.state.lock();
        for watcher in state.watchers.drain(..) {
            let _ = watcher.tx.send(WatchMessage::Canceled);
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().kvs.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().apply_put(key, value);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, u64)> {
        let state = self.state.lock();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok((kvs, state.revision))
    }

    async fn txn(&self, compares: Vec<TxnCompare>, ops: Vec<TxnOp>) -> Result<bool> {
        // Validate leases before taking the state lock so a bad lease fails
        // the call rather than half-applying.
        for op in &ops {
            if let TxnOp::PutWithLease { lease, .. } = op
                && !self.leases.contains_key(lease)
            {
                return Err(LockstepError::Infrastructure(format!(
                    "txn references unknown lease {lease}"
                )));
            }
        }

        let mut state = self.state.lock();
        if !compares.iter().all(|compare| state.check(compare)) {
            return Ok(false);
        }
        for op in ops {
            match op {
                TxnOp::Put { key, value } => state.apply_put(&key, &value),
                TxnOp::PutWithLease { key, value, lease } => {
                    state.apply_put(&key, &value);
                    if let Some(mut info) = self.leases.get_mut(&lease) {
                        info.keys.push(key);
                    }
                }
                TxnOp::Delete { key } => {
                    state.apply_delete(&key);
                }
            }
        }
        Ok(true)
    }

    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        // Replay history first, then register for live events, all under
        // the state lock so no mutation is missed or duplicated.
        for event in &state.log {
            if event.revision >= from_revision && event.key.starts_with(prefix) {
                let _ = tx.send(WatchMessage::Event(event.clone()));
            }
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.leases.insert(
            lease,
            LeaseInfo {
                ttl,
                keys: Vec::new(),
            },
        );
        Ok(lease)
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let Some(mut info) = self.leases.get_mut(&lease) else {
            return Err(LockstepError::Infrastructure(format!(
                "unknown lease {lease}"
            )));
        };
        info.keys.push(key.to_string());
        drop(info);
        self.state.lock().apply_put(key, value);
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let Some((_, info)) = self.leases.remove(&lease) else {
            // Revoking an unknown lease is a no-op; the keys are already
            // gone.
            return Ok(());
        };
        let mut state = self.state.lock();
        for key in info.keys {
            state.apply_delete(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_put_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("/a").await.unwrap(), None);
        store.put("/a", "1").await.unwrap();
        assert_eq!(store.get("/a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_txn_commits_only_when_compares_hold() {
        let store = MemoryStore::new();
        store.put("/idx", "3").await.unwrap();

        let committed = store
            .txn(
                vec![TxnCompare::ValueEquals("/idx".into(), "3".into())],
                vec![TxnOp::Put {
                    key: "/idx".into(),
                    value: "4".into(),
                }],
            )
            .await
            .unwrap();
        assert!(committed);

        // The compare now sees "4", so the same txn must fail.
        let committed = store
            .txn(
                vec![TxnCompare::ValueEquals("/idx".into(), "3".into())],
                vec![TxnOp::Put {
                    key: "/idx".into(),
                    value: "5".into(),
                }],
            )
            .await
            .unwrap();
        assert!(!committed);
        assert_eq!(store.get("/idx").await.unwrap(), Some("4".to_string()));
    }

    #[tokio::test]
    async fn test_txn_delete_requires_existence() {
        let store = MemoryStore::new();
        let committed = store
            .txn(
                vec![TxnCompare::KeyExists("/gone".into())],
                vec![TxnOp::Delete { key: "/gone".into() }],
            )
            .await
            .unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn test_watch_replays_history_then_live_events() {
        let store = MemoryStore::new();
        store.put("/locks/1", "a").await.unwrap();
        store.put("/other", "x").await.unwrap();
        store.put("/locks/2", "b").await.unwrap();

        let mut stream = store.watch("/locks/", 1).await.unwrap();
        store.put("/locks/3", "c").await.unwrap();

        let mut keys = Vec::new();
        for _ in 0..3 {
            match stream.recv().await.unwrap() {
                WatchMessage::Event(event) => keys.push(event.key),
                WatchMessage::Canceled => panic!("unexpected cancel"),
            }
        }
        assert_eq!(keys, vec!["/locks/1", "/locks/2", "/locks/3"]);
    }

    #[tokio::test]
    async fn test_watch_from_snapshot_revision_misses_nothing() {
        let store = MemoryStore::new();
        store.put("/locks/1", "a").await.unwrap();

        let (kvs, revision) = store.get_prefix("/locks/").await.unwrap();
        assert_eq!(kvs.len(), 1);

        store.put("/locks/2", "b").await.unwrap();
        let mut stream = store.watch("/locks/", revision + 1).await.unwrap();
        match stream.recv().await.unwrap() {
            WatchMessage::Event(event) => assert_eq!(event.key, "/locks/2"),
            WatchMessage::Canceled => panic!("unexpected cancel"),
        }
    }

    #[tokio::test]
    async fn test_delete_event_carries_prev_value() {
        let store = MemoryStore::new();
        store.put("/locks/1", "payload").await.unwrap();
        let mut stream = store.watch("/locks/", store.revision() + 1).await.unwrap();

        store
            .txn(
                vec![TxnCompare::KeyExists("/locks/1".into())],
                vec![TxnOp::Delete {
                    key: "/locks/1".into(),
                }],
            )
            .await
            .unwrap();

        match stream.recv().await.unwrap() {
            WatchMessage::Event(event) => {
                assert_eq!(event.kind, WatchEventKind::Delete);
                assert_eq!(event.prev_value, Some("payload".to_string()));
                assert_eq!(event.value, None);
            }
            WatchMessage::Canceled => panic!("unexpected cancel"),
        }
    }

    #[tokio::test]
    async fn test_lease_revocation_deletes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.put_with_lease("/svc/a", "{}", lease).await.unwrap();

        let mut stream = store.watch("/svc/", store.revision() + 1).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        assert_eq!(store.get("/svc/a").await.unwrap(), None);
        match stream.recv().await.unwrap() {
            WatchMessage::Event(event) => {
                assert_eq!(event.kind, WatchEventKind::Delete);
                assert_eq!(event.key, "/svc/a");
            }
            WatchMessage::Canceled => panic!("unexpected cancel"),
        }
    }

    #[tokio::test]
    async fn test_revoking_unknown_lease_is_noop() {
        let store = MemoryStore::new();
        store.revoke_lease(99).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_watches_signals_consumers() {
        let store = MemoryStore::new();
        let mut stream = store.watch("/", 1).await.unwrap();
        store.cancel_watches();
        assert!(matches!(
            stream.recv().await.unwrap(),
            WatchMessage::Canceled
        ));
    }
}
