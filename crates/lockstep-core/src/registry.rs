//! Lock provider registry and local replica of the global lock state.
//!
//! The registry runs as a single-threaded actor. Its providers are only
//! ever mutated by replicated events applied in store order (or by a full
//! resync replay), which is what makes every process's replica converge.

use tokio::sync::mpsc;
use tracing::{debug, error};

use lockstep_common::{Completer, LockstepError, PathTrie, Result, completion_pair};

use crate::model::{Lock, LockRequest, LockRequestRecord, RecordedLock};
use crate::provider::LockProvider;

pub enum RegistryCommand {
    TestAndSerialize {
        request: LockRequest,
        reply: Completer<Result<Vec<RecordedLock>>>,
    },
    ApplyEvent {
        is_locking: bool,
        record: LockRequestRecord,
        reply: Completer<Result<()>>,
    },
    WaitForIndex {
        target: u64,
        reply: Completer<u64>,
    },
    ResetState {
        index: u64,
        records: Vec<LockRequestRecord>,
        reply: Completer<Result<()>>,
    },
    LocalIndex {
        reply: Completer<u64>,
    },
}

/// Path-indexed table of lock-semantics plugins plus the local index.
pub struct LockProviderRegistry {
    providers: PathTrie<Box<dyn LockProvider>>,
    local_index: u64,
    waiters: Vec<(u64, Completer<u64>)>,
    rx: mpsc::UnboundedReceiver<RegistryCommand>,
}

impl LockProviderRegistry {
    pub fn new(rx: mpsc::UnboundedReceiver<RegistryCommand>) -> Self {
        Self {
            providers: PathTrie::new(),
            local_index: 0,
            waiters: Vec::new(),
            rx,
        }
    }

    /// Register a provider under a path pattern (literal tokens and/or the
    /// `*` wildcard). Must happen before the actor is spawned.
    pub fn register_provider(&mut self, pattern: &[String], provider: Box<dyn LockProvider>) {
        self.providers.insert(pattern, provider);
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }
        debug!("Registry actor stopped");
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::TestAndSerialize { request, reply } => {
                reply.complete(self.test_and_serialize(&request));
            }
            RegistryCommand::ApplyEvent {
                is_locking,
                record,
                reply,
            } => {
                // A create's record id is the global-index slot it was
                // committed at, so it must land exactly one past the local
                // index; any other id means events were missed.
                let result = if is_locking && record.id != self.local_index + 1 {
                    Err(LockstepError::Desynchronized(format!(
                        "create of request {} arrived at local index {}",
                        record.id, self.local_index
                    )))
                } else {
                    self.apply(is_locking, &record)
                };
                match &result {
                    Ok(()) => {
                        self.local_index += 1;
                        debug!(
                            index = self.local_index,
                            request_id = record.id,
                            is_locking = is_locking,
                            "Applied replicated lock event"
                        );
                        self.wake_waiters();
                    }
                    Err(e) => {
                        // LocalIndex stays where it was: callers waiting on
                        // an index bound keep waiting or time out, and the
                        // supervisor resynchronizes the whole service.
                        error!(
                            index = self.local_index,
                            request_id = record.id,
                            error = %e,
                            "Failed to apply replicated lock event; replica is desynchronized"
                        );
                    }
                }
                reply.complete(result);
            }
            RegistryCommand::WaitForIndex { target, reply } => {
                if self.local_index >= target {
                    reply.complete(self.local_index);
                } else {
                    self.waiters.push((target, reply));
                }
            }
            RegistryCommand::ResetState {
                index,
                records,
                reply,
            } => {
                reply.complete(self.reset_state(index, &records));
            }
            RegistryCommand::LocalIndex { reply } => {
                reply.complete(self.local_index);
            }
        }
    }

    /// Conflict-test and serialize every lock of a request, aborting on the
    /// first failure. Mutates nothing; safe to call speculatively.
    fn test_and_serialize(&self, request: &LockRequest) -> Result<Vec<RecordedLock>> {
        let mut recorded = Vec::with_capacity(request.locks.len());
        for lock in &request.locks {
            let provider = self
                .providers
                .get(&lock.path)
                .ok_or_else(|| LockstepError::NoProvider(lock.path_display()))?;
            provider.can_lock(lock)?;
            recorded.push(RecordedLock {
                path: lock.path.clone(),
                name: lock.name.clone(),
                target: provider.serialize_target(&lock.target)?,
            });
        }
        Ok(recorded)
    }

    fn apply(&mut self, is_locking: bool, record: &LockRequestRecord) -> Result<()> {
        for recorded in &record.locks {
            let provider = self
                .providers
                .get_mut(&recorded.path)
                .ok_or_else(|| LockstepError::NoProvider(recorded.path.join("/")))?;
            let lock = Lock {
                path: recorded.path.clone(),
                name: recorded.name.clone(),
                target: provider.deserialize_target(&recorded.target)?,
            };
            if is_locking {
                provider.lock(record.id, &lock)?;
            } else {
                provider.unlock(record.id, &lock)?;
            }
        }
        Ok(())
    }

    /// Clear every provider, replay `lock` for every held record, and set
    /// the local index in one step.
    fn reset_state(&mut self, index: u64, records: &[LockRequestRecord]) -> Result<()> {
        self.providers.for_each_mut(&mut |provider| provider.clear());
        for record in records {
            self.apply(true, record)?;
        }
        self.local_index = index;
        debug!(
            index = index,
            records = records.len(),
            "Registry state reset from snapshot"
        );
        self.wake_waiters();
        Ok(())
    }

    fn wake_waiters(&mut self) {
        let local_index = self.local_index;
        let mut remaining = Vec::with_capacity(self.waiters.len());
        for (target, reply) in self.waiters.drain(..) {
            if local_index >= target {
                reply.complete(local_index);
            } else {
                remaining.push((target, reply));
            }
        }
        self.waiters = remaining;
    }
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(tx: mpsc::UnboundedSender<RegistryCommand>) -> Self {
        Self { tx }
    }

    fn stopped() -> LockstepError {
        LockstepError::Infrastructure("registry actor stopped".to_string())
    }

    pub async fn test_and_serialize(&self, request: LockRequest) -> Result<Vec<RecordedLock>> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(RegistryCommand::TestAndSerialize { request, reply })
            .map_err(|_| Self::stopped())?;
        waiter.wait().await.map_err(|_| Self::stopped())?
    }

    pub async fn apply_event(&self, is_locking: bool, record: LockRequestRecord) -> Result<()> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(RegistryCommand::ApplyEvent {
                is_locking,
                record,
                reply,
            })
            .map_err(|_| Self::stopped())?;
        waiter.wait().await.map_err(|_| Self::stopped())?
    }

    /// Block until the local index reaches `target`, or the timeout lapses.
    pub async fn wait_for_index(&self, target: u64, timeout: std::time::Duration) -> Result<u64> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(RegistryCommand::WaitForIndex { target, reply })
            .map_err(|_| Self::stopped())?;
        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Ok(index)) => Ok(index),
            Ok(Err(_)) => Err(Self::stopped()),
            Err(_) => Err(LockstepError::Infrastructure(format!(
                "replica did not reach index {target} in time"
            ))),
        }
    }

    pub async fn reset_state(&self, index: u64, records: Vec<LockRequestRecord>) -> Result<()> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(RegistryCommand::ResetState {
                index,
                records,
                reply,
            })
            .map_err(|_| Self::stopped())?;
        waiter.wait().await.map_err(|_| Self::stopped())?
    }

    pub async fn local_index(&self) -> Result<u64> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(RegistryCommand::LocalIndex { reply })
            .map_err(|_| Self::stopped())?;
        waiter.wait().await.map_err(|_| Self::stopped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Lock;
    use crate::provider::ExclusiveProvider;
    use std::time::Duration;

    fn spawn_registry() -> RegistryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = LockProviderRegistry::new(rx);
        registry.register_provider(
            &["obj".to_string(), "*".to_string()],
            Box::new(ExclusiveProvider::new()),
        );
        registry.spawn();
        RegistryHandle::new(tx)
    }

    fn request(name: &str) -> LockRequest {
        LockRequest::new("test", vec![Lock::new(["obj", "1"], name)])
    }

    fn record(id: u64, name: &str) -> LockRequestRecord {
        LockRequestRecord {
            id,
            owner_service_id: "svc".to_string(),
            reason: "test".to_string(),
            timestamp_ms: 0,
            locks: vec![RecordedLock {
                path: vec!["obj".to_string(), "1".to_string()],
                name: name.to_string(),
                target: "null".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_test_and_serialize_detects_conflicts() {
        let registry = spawn_registry();

        let recorded = registry.test_and_serialize(request("write")).await.unwrap();
        assert_eq!(recorded.len(), 1);

        registry.apply_event(true, record(1, "write")).await.unwrap();
        let err = registry
            .test_and_serialize(request("write"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        registry
            .apply_event(false, record(1, "write"))
            .await
            .unwrap();
        assert!(registry.test_and_serialize(request("write")).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_provider_for_unknown_path() {
        let registry = spawn_registry();
        let request = LockRequest::new("test", vec![Lock::new(["other"], "write")]);
        let err = registry.test_and_serialize(request).await.unwrap_err();
        assert!(matches!(err, LockstepError::NoProvider(_)));
    }

    #[tokio::test]
    async fn test_local_index_advances_per_event() {
        let registry = spawn_registry();
        assert_eq!(registry.local_index().await.unwrap(), 0);

        registry.apply_event(true, record(1, "a")).await.unwrap();
        assert_eq!(registry.local_index().await.unwrap(), 1);

        registry.apply_event(false, record(1, "a")).await.unwrap();
        assert_eq!(registry.local_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_index_unadvanced() {
        let registry = spawn_registry();
        registry.apply_event(true, record(1, "a")).await.unwrap();

        // A second grant of the same lock is a replica divergence.
        let err = registry.apply_event(true, record(2, "a")).await.unwrap_err();
        assert!(err.is_desynchronized());
        assert_eq!(registry.local_index().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_skipping_index_slots_is_desync() {
        let registry = spawn_registry();

        // A fresh replica is at index 0; a create committed at slot 5 can
        // only mean the events in between were missed.
        let err = registry.apply_event(true, record(5, "a")).await.unwrap_err();
        assert!(err.is_desynchronized());
        assert_eq!(registry.local_index().await.unwrap(), 0);

        // The expected next slot still applies cleanly.
        registry.apply_event(true, record(1, "a")).await.unwrap();
        assert_eq!(registry.local_index().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_index_wakes_on_apply() {
        let registry = spawn_registry();

        let waiter_registry = registry.clone();
        let waiter = tokio::spawn(async move {
            waiter_registry
                .wait_for_index(2, Duration::from_secs(5))
                .await
        });

        registry.apply_event(true, record(1, "a")).await.unwrap();
        registry.apply_event(true, record(2, "b")).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_index_times_out() {
        let registry = spawn_registry();
        let err = registry
            .wait_for_index(5, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LockstepError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_reset_state_replays_snapshot() {
        let registry = spawn_registry();
        registry
            .reset_state(7, vec![record(3, "write")])
            .await
            .unwrap();

        assert_eq!(registry.local_index().await.unwrap(), 7);
        let err = registry
            .test_and_serialize(request("write"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // A reset with no records clears the providers.
        registry.reset_state(9, vec![]).await.unwrap();
        assert!(registry.test_and_serialize(request("write")).await.is_ok());
    }
}
