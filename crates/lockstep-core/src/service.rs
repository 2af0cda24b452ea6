//! Service composition root: startup, resynchronization, client API.
//!
//! `LockServiceBuilder` wires the actors together (channels first, then
//! handles, so the cyclic references between proposal and retry resolve),
//! runs the initial resynchronization, and hands back a `LockService`. A
//! supervisor task listens for desynchronization signals and re-runs the
//! same resynchronization until it succeeds.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use lockstep_common::{LockstepError, Result, completion_pair};
use lockstep_store::CoordinationStore;

use crate::config::LockServiceConfig;
use crate::keys::KeyLayout;
use crate::lease::{LeaseMonitor, LeaseMonitorHandle};
use crate::liveness::{LivenessHandle, ServiceLivenessTracker};
use crate::model::{AcquireOptions, LockRequest, LockRequestRecord};
use crate::proposal::{ProposalCoordinator, ProposalHandle};
use crate::provider::LockProvider;
use crate::registry::{LockProviderRegistry, RegistryHandle};
use crate::release::{ReleaseCoordinator, ReleaseHandle};
use crate::retry::{RetryHandle, RetryQueue};
use crate::watcher::ReplicationWatcher;

/// Why a replica stopped trusting itself.
#[derive(Clone, Debug)]
pub enum DesyncReason {
    /// The store canceled or closed the replication watch.
    WatchLost,
    /// This service's own liveness key disappeared.
    SelfKeyLost,
    /// A replicated event could not be applied to the local replica.
    ReplicaDiverged(String),
}

impl fmt::Display for DesyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesyncReason::WatchLost => write!(f, "replication watch lost"),
            DesyncReason::SelfKeyLost => write!(f, "own liveness key lost"),
            DesyncReason::ReplicaDiverged(detail) => write!(f, "replica diverged: {detail}"),
        }
    }
}

/// This process's service id, readable from any component.
///
/// The id changes on every resynchronization (registration mints a fresh
/// one), so components read it at use time instead of capturing it.
#[derive(Clone)]
pub struct SharedServiceId {
    inner: Arc<RwLock<String>>,
}

impl SharedServiceId {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(String::new())),
        }
    }

    pub fn get(&self) -> String {
        self.inner.read().clone()
    }

    pub fn set(&self, id: String) {
        *self.inner.write() = id;
    }
}

impl Default for SharedServiceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything resynchronization needs; owned by the supervisor and used
/// once at startup.
struct ResyncContext {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    service_id: SharedServiceId,
    registry: RegistryHandle,
    liveness: LivenessHandle,
    retry: RetryHandle,
    lease_monitor: LeaseMonitorHandle,
    desync_tx: mpsc::UnboundedSender<DesyncReason>,
    watcher_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ResyncContext {
    /// Register, snapshot, reset, re-watch. On return the replica reflects
    /// the snapshot and the watcher covers every later revision.
    async fn resync(&self) -> Result<()> {
        if let Some(task) = self.watcher_task.lock().take() {
            task.abort();
        }

        let service_id = self.liveness.register_self().await?;

        // The snapshot is atomic and includes our just-written liveness
        // key; watching from revision + 1 closes the gap exactly.
        let (kvs, revision) = self.store.get_prefix(&self.keys.root_prefix()).await?;

        let mut index = 0u64;
        let mut records = Vec::new();
        let mut live_services = HashSet::new();
        for kv in kvs {
            if kv.key == self.keys.index_key() {
                index = kv.value.parse().map_err(|_| {
                    LockstepError::Infrastructure(format!("corrupt global index: {}", kv.value))
                })?;
            } else if self.keys.parse_request_key(&kv.key).is_some() {
                records.push(LockRequestRecord::from_json(&kv.value)?);
            } else if let Some(id) = self.keys.parse_service_key(&kv.key) {
                live_services.insert(id.to_string());
            }
        }
        records.sort_by_key(|record| record.id);

        self.registry.reset_state(index, records.clone()).await?;
        self.liveness.reset_ownership(records, live_services).await?;

        let watcher = ReplicationWatcher::new(
            self.store.clone(),
            self.keys.clone(),
            self.service_id.clone(),
            self.registry.clone(),
            self.liveness.clone(),
            self.retry.clone(),
            self.lease_monitor.clone(),
            self.desync_tx.clone(),
        )
        .spawn(revision + 1);
        *self.watcher_task.lock() = Some(watcher);

        // Parked acquisitions were tested against the old replica.
        self.retry.state_advanced();

        info!(
            service_id = %service_id,
            index = index,
            revision = revision,
            "Service synchronized with store"
        );
        Ok(())
    }
}

/// Builds and starts a `LockService` over a coordination store.
pub struct LockServiceBuilder {
    store: Arc<dyn CoordinationStore>,
    config: LockServiceConfig,
    providers: Vec<(Vec<String>, Box<dyn LockProvider>)>,
}

impl LockServiceBuilder {
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockServiceConfig) -> Self {
        Self {
            store,
            config,
            providers: Vec::new(),
        }
    }

    /// Register a lock provider under a path pattern (literal tokens and/or
    /// the `*` wildcard). Every participating process must register the
    /// same providers, or replicas will not converge.
    pub fn register_provider(
        mut self,
        pattern: impl IntoIterator<Item = impl Into<String>>,
        provider: Box<dyn LockProvider>,
    ) -> Self {
        self.providers
            .push((pattern.into_iter().map(Into::into).collect(), provider));
        self
    }

    /// Wire the actors, run the initial synchronization, start the
    /// supervisor.
    pub async fn start(self) -> Result<LockService> {
        let keys = KeyLayout::new(&self.config.key_prefix);
        let service_id = SharedServiceId::new();

        // Channels first; handles can then be passed into actors that
        // reference each other.
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let (lease_tx, lease_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (proposal_tx, proposal_rx) = mpsc::unbounded_channel();
        let (liveness_tx, liveness_rx) = mpsc::unbounded_channel();
        let (desync_tx, mut desync_rx) = mpsc::unbounded_channel();

        let registry = RegistryHandle::new(registry_tx);
        let release = ReleaseHandle::new(release_tx.clone());
        let lease_monitor = LeaseMonitorHandle::new(lease_tx);
        let retry = RetryHandle::new(retry_tx);
        let proposal = ProposalHandle::new(proposal_tx);
        let liveness = LivenessHandle::new(liveness_tx);

        let mut registry_actor = LockProviderRegistry::new(registry_rx);
        for (pattern, provider) in self.providers {
            registry_actor.register_provider(&pattern, provider);
        }
        registry_actor.spawn();

        ReleaseCoordinator::new(
            self.store.clone(),
            keys.clone(),
            self.config.clone(),
            service_id.clone(),
            release_tx,
            release_rx,
        )
        .spawn();

        LeaseMonitor::new(release.clone(), self.config.lease_tick, lease_rx).spawn();

        RetryQueue::new(proposal.clone(), lease_monitor.clone(), retry_rx).spawn();

        ProposalCoordinator::new(
            self.store.clone(),
            keys.clone(),
            self.config.clone(),
            service_id.clone(),
            registry.clone(),
            retry.clone(),
            lease_monitor.clone(),
            proposal_rx,
        )
        .spawn();

        ServiceLivenessTracker::new(
            self.store.clone(),
            keys.clone(),
            self.config.clone(),
            service_id.clone(),
            release.clone(),
            lease_monitor.clone(),
            desync_tx.clone(),
            liveness_rx,
        )
        .spawn();

        let context = ResyncContext {
            store: self.store,
            keys,
            service_id: service_id.clone(),
            registry: registry.clone(),
            liveness,
            retry: retry.clone(),
            lease_monitor: lease_monitor.clone(),
            desync_tx,
            watcher_task: Arc::new(Mutex::new(None)),
        };
        context.resync().await?;
        let watcher_task = context.watcher_task.clone();

        let resync_retry_delay = self.config.resync_retry_delay;
        let supervisor = tokio::spawn(async move {
            while let Some(reason) = desync_rx.recv().await {
                // Later signals describe the same stale replica; one
                // resynchronization covers them all.
                while desync_rx.try_recv().is_ok() {}
                warn!(reason = %reason, "Replica desynchronized; resynchronizing");
                loop {
                    match context.resync().await {
                        Ok(()) => break,
                        Err(e) => {
                            error!(error = %e, "Resynchronization failed; retrying");
                            tokio::time::sleep(resync_retry_delay).await;
                        }
                    }
                }
            }
        });

        Ok(LockService {
            config: self.config,
            service_id,
            registry,
            proposal,
            retry,
            release,
            lease_monitor,
            watcher_task,
            supervisor,
        })
    }
}

/// A running Lockstep service instance.
///
/// Dropping the service stops its actors and background tasks.
pub struct LockService {
    config: LockServiceConfig,
    service_id: SharedServiceId,
    registry: RegistryHandle,
    proposal: ProposalHandle,
    retry: RetryHandle,
    release: ReleaseHandle,
    lease_monitor: LeaseMonitorHandle,
    watcher_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    supervisor: JoinHandle<()>,
}

impl LockService {
    /// Acquire all locks of `request` atomically.
    ///
    /// Returns the committed request id. Conflicting requests wait, in FIFO
    /// order, for the conflict to clear; the wait is bounded by the
    /// caller's timeout (or the configured default). A timeout bounds only
    /// the wait: an attempt whose commit races the deadline is resolved by
    /// the committed store state, and the id is recovered by the usual
    /// replication path even though the caller sees `Timeout`.
    pub async fn acquire(&self, request: LockRequest, options: AcquireOptions) -> Result<u64> {
        if request.locks.is_empty() {
            return Err(LockstepError::InvalidRequest(
                "no locks in request".to_string(),
            ));
        }
        let attempt_id = Uuid::new_v4();
        let timeout = options
            .timeout
            .unwrap_or(self.config.default_acquire_timeout);
        let (completer, waiter) = completion_pair();
        self.proposal
            .acquire(attempt_id, request, options.lease, completer);

        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LockstepError::Infrastructure(
                "acquisition abandoned".to_string(),
            )),
            Err(_) => {
                self.retry.cancel(attempt_id);
                Err(LockstepError::Timeout)
            }
        }
    }

    /// Convenience wrapper: acquire with default options.
    pub async fn acquire_default(&self, request: LockRequest) -> Result<u64> {
        self.acquire(request, AcquireOptions::default()).await
    }

    /// Release a previously acquired request. Fire-and-forget and
    /// idempotent: releasing an already-released id is a no-op.
    pub fn release(&self, request_id: u64) {
        self.lease_monitor.remove(request_id);
        self.release.release(request_id);
    }

    /// Renew the client-level lease of a held request.
    pub async fn renew(&self, request_id: u64) -> Result<()> {
        self.lease_monitor.renew(request_id).await
    }

    /// The local replica's index. Diagnostic only; it may trail the global
    /// index at any instant.
    pub async fn local_index(&self) -> Result<u64> {
        self.registry.local_index().await
    }

    /// This instance's current service id. Changes on resynchronization.
    pub fn service_id(&self) -> String {
        self.service_id.get()
    }
}

impl Drop for LockService {
    fn drop(&mut self) {
        self.supervisor.abort();
        if let Some(task) = self.watcher_task.lock().take() {
            task.abort();
        }
    }
}
