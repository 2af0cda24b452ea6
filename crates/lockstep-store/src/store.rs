//! The coordination-store contract.

use std::time::Duration;

use async_trait::async_trait;

use lockstep_common::Result;

use crate::types::{KeyValue, LeaseId, TxnCompare, TxnOp, WatchStream};

/// Contract Lockstep requires from its coordination store.
///
/// The store is assumed linearizable: reads observe all committed writes,
/// transactions are atomic compare-and-swap, and watch streams deliver every
/// committed mutation in commit order.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a single key unconditionally.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Atomic snapshot of every key under a prefix, together with the store
    /// revision the snapshot was taken at. Watching from `revision + 1`
    /// observes exactly the mutations not included in the snapshot.
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, u64)>;

    /// Execute `ops` atomically if and only if all `compares` hold.
    /// Returns whether the transaction committed.
    async fn txn(&self, compares: Vec<TxnCompare>, ops: Vec<TxnOp>) -> Result<bool>;

    /// Subscribe to mutations of keys under `prefix`, starting at
    /// `from_revision` (inclusive). Events arrive strictly in commit order.
    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream>;

    /// Grant a revocable lease. Keys attached to the lease are deleted when
    /// the lease is revoked or expires. Keep-alive policy is the store's
    /// responsibility, not the caller's.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Write a key bound to a lease's lifetime.
    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}
