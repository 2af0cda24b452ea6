//! Lock-semantics plugins.
//!
//! A provider owns what "locked" means for the path subtree it is
//! registered under. The protocol core never interprets lock targets; it
//! only asks the provider to test conflicts, apply replicated lock/unlock
//! events, and (de)serialize targets for persistence.

use std::collections::HashMap;

use lockstep_common::{LockstepError, Result};

use crate::model::Lock;

/// Capability interface each lock-semantics plugin implements.
///
/// `can_lock` is a pure conflict test and must not mutate state; `lock` and
/// `unlock` are only ever driven by replicated events (or a resync replay),
/// so their state transitions happen in the same order on every replica.
pub trait LockProvider: Send {
    /// Pure conflict test: would this lock be grantable right now?
    fn can_lock(&self, lock: &Lock) -> Result<()>;

    /// Apply a replicated lock event.
    fn lock(&mut self, request_id: u64, lock: &Lock) -> Result<()>;

    /// Apply a replicated unlock event.
    fn unlock(&mut self, request_id: u64, lock: &Lock) -> Result<()>;

    /// Serialize the provider-defined target for persistence.
    fn serialize_target(&self, target: &serde_json::Value) -> Result<String>;

    /// Reverse of `serialize_target`.
    fn deserialize_target(&self, raw: &str) -> Result<serde_json::Value>;

    /// Drop all state (full resynchronization).
    fn clear(&mut self);
}

#[derive(Debug)]
struct Holder {
    request_id: u64,
    count: u32,
}

/// Reference provider: at most one request may hold a given
/// `(path, name)` at a time.
///
/// Re-entrant for the same request id because intra-request conflicts are
/// permitted: a request carrying the same lock twice applies two `lock`
/// events that both succeed.
#[derive(Default)]
pub struct ExclusiveProvider {
    held: HashMap<(String, String), Holder>,
}

impl ExclusiveProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(lock: &Lock) -> (String, String) {
        (lock.path.join("/"), lock.name.clone())
    }
}

impl LockProvider for ExclusiveProvider {
    fn can_lock(&self, lock: &Lock) -> Result<()> {
        match self.held.get(&Self::key(lock)) {
            Some(holder) => Err(LockstepError::Conflict(format!(
                "lock '{}' on '{}' held by request {}",
                lock.name,
                lock.path_display(),
                holder.request_id
            ))),
            None => Ok(()),
        }
    }

    fn lock(&mut self, request_id: u64, lock: &Lock) -> Result<()> {
        let holder = self.held.entry(Self::key(lock)).or_insert(Holder {
            request_id,
            count: 0,
        });
        if holder.request_id != request_id {
            // A replicated create conflicting with replicated state means
            // the replicas have diverged.
            return Err(LockstepError::Desynchronized(format!(
                "lock '{}' on '{}' granted to request {} while held by request {}",
                lock.name,
                lock.path_display(),
                request_id,
                holder.request_id
            )));
        }
        holder.count += 1;
        Ok(())
    }

    fn unlock(&mut self, request_id: u64, lock: &Lock) -> Result<()> {
        let key = Self::key(lock);
        let Some(holder) = self.held.get_mut(&key) else {
            return Err(LockstepError::Desynchronized(format!(
                "unlock of '{}' on '{}' for request {} but nothing is held",
                lock.name,
                lock.path_display(),
                request_id
            )));
        };
        if holder.request_id != request_id {
            return Err(LockstepError::Desynchronized(format!(
                "unlock of '{}' on '{}' for request {} but held by request {}",
                lock.name,
                lock.path_display(),
                request_id,
                holder.request_id
            )));
        }
        holder.count -= 1;
        if holder.count == 0 {
            self.held.remove(&key);
        }
        Ok(())
    }

    fn serialize_target(&self, target: &serde_json::Value) -> Result<String> {
        serde_json::to_string(target)
            .map_err(|e| LockstepError::InvalidTarget(format!("unserializable target: {e}")))
    }

    fn deserialize_target(&self, raw: &str) -> Result<serde_json::Value> {
        serde_json::from_str(raw)
            .map_err(|e| LockstepError::InvalidTarget(format!("unreadable target '{raw}': {e}")))
    }

    fn clear(&mut self) {
        self.held.clear();
    }
}
