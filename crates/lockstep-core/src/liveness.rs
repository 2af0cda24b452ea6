//! Service liveness tracker.
//!
//! Each process registers a leased key in the store; the key's
//! disappearance is the cluster-wide death signal. The tracker attributes
//! lock ownership to services from replicated events so that when a peer's
//! key vanishes, that peer's orphaned lock requests can be released. Losing
//! our *own* key means every replica we hold is suspect: the whole service
//! resynchronizes from scratch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lockstep_common::{Completer, LockstepError, Result, completion_pair};
use lockstep_store::{CoordinationStore, LeaseId};

use crate::config::LockServiceConfig;
use crate::keys::KeyLayout;
use crate::lease::LeaseMonitorHandle;
use crate::model::{LockRequestRecord, ServiceRecord};
use crate::release::ReleaseHandle;
use crate::service::{DesyncReason, SharedServiceId};

pub enum LivenessCommand {
    /// (Re-)register this process under a fresh id and store lease.
    RegisterSelf {
        reply: Completer<Result<String>>,
    },
    /// Rebuild the ownership map from a snapshot; schedules release of
    /// records whose owner is not among the live services.
    ResetOwnership {
        records: Vec<LockRequestRecord>,
        live_services: HashSet<String>,
        reply: Completer<()>,
    },
    /// A replicated lock event, used for ownership attribution.
    LockEvent {
        is_locking: bool,
        owner_service_id: String,
        request_id: u64,
    },
    ServiceUp {
        service_id: String,
    },
    ServiceDown {
        service_id: String,
    },
}

pub struct ServiceLivenessTracker {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    config: LockServiceConfig,
    service_id: SharedServiceId,
    self_lease: Option<LeaseId>,
    /// service id -> lock request ids it currently owns.
    owned: HashMap<String, HashSet<u64>>,
    release: ReleaseHandle,
    lease_monitor: LeaseMonitorHandle,
    desync_tx: mpsc::UnboundedSender<DesyncReason>,
    rx: mpsc::UnboundedReceiver<LivenessCommand>,
}

impl ServiceLivenessTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        config: LockServiceConfig,
        service_id: SharedServiceId,
        release: ReleaseHandle,
        lease_monitor: LeaseMonitorHandle,
        desync_tx: mpsc::UnboundedSender<DesyncReason>,
        rx: mpsc::UnboundedReceiver<LivenessCommand>,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            service_id,
            self_lease: None,
            owned: HashMap::new(),
            release,
            lease_monitor,
            desync_tx,
            rx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                LivenessCommand::RegisterSelf { reply } => {
                    reply.complete(self.register_self().await);
                }
                LivenessCommand::ResetOwnership {
                    records,
                    live_services,
                    reply,
                } => {
                    self.reset_ownership(records, live_services);
                    reply.complete(());
                }
                LivenessCommand::LockEvent {
                    is_locking,
                    owner_service_id,
                    request_id,
                } => {
                    if is_locking {
                        self.owned
                            .entry(owner_service_id)
                            .or_default()
                            .insert(request_id);
                    } else if let Some(ids) = self.owned.get_mut(&owner_service_id) {
                        ids.remove(&request_id);
                        if ids.is_empty() {
                            self.owned.remove(&owner_service_id);
                        }
                    }
                }
                LivenessCommand::ServiceUp { service_id } => {
                    debug!(peer = %service_id, "Peer service registered");
                }
                LivenessCommand::ServiceDown { service_id } => {
                    self.service_down(service_id);
                }
            }
        }
        debug!("Liveness tracker stopped");
    }

    async fn register_self(&mut self) -> Result<String> {
        if let Some(old_lease) = self.self_lease.take() {
            // Best effort: the old key may already be gone, which is what
            // brought us here in the first place.
            if let Err(e) = self.store.revoke_lease(old_lease).await {
                debug!(error = %e, "Could not revoke stale liveness lease");
            }
        }

        let id = Uuid::new_v4().to_string();
        let lease = self.store.grant_lease(self.config.service_ttl).await?;
        let record = ServiceRecord {
            id: id.clone(),
            lease_id: lease,
        };
        let value = serde_json::to_string(&record).map_err(|e| {
            LockstepError::Infrastructure(format!("failed to encode service record: {e}"))
        })?;
        self.store
            .put_with_lease(&self.keys.service_key(&id), &value, lease)
            .await?;

        self.self_lease = Some(lease);
        self.service_id.set(id.clone());
        info!(service_id = %id, lease = lease, "Service registered");
        Ok(id)
    }

    fn reset_ownership(&mut self, records: Vec<LockRequestRecord>, live: HashSet<String>) {
        self.owned.clear();
        let mut orphans = Vec::new();
        for record in records {
            if !live.contains(&record.owner_service_id) {
                orphans.push(record.id);
                continue;
            }
            self.owned
                .entry(record.owner_service_id)
                .or_default()
                .insert(record.id);
        }
        if !orphans.is_empty() {
            warn!(
                count = orphans.len(),
                "Snapshot contains lock requests of dead services; scheduling release"
            );
            self.release.delayed_release(orphans);
        }
    }

    fn service_down(&mut self, service_id: String) {
        if service_id == self.service_id.get() {
            // Our own liveness key vanished: every in-memory replica is
            // invalid, not just the ownership map.
            error!("Own liveness key deleted; full resynchronization required");
            let _ = self.desync_tx.send(DesyncReason::SelfKeyLost);
            return;
        }
        let Some(ids) = self.owned.remove(&service_id) else {
            debug!(peer = %service_id, "Dead peer owned no lock requests");
            return;
        };
        warn!(
            peer = %service_id,
            orphaned = ids.len(),
            "Peer service died; releasing its lock requests"
        );
        let ids: Vec<u64> = ids.into_iter().collect();
        for id in &ids {
            // Drop any client-level lease bookkeeping alongside the
            // liveness-triggered release so no stale entry outlives the
            // record.
            self.lease_monitor.remove(*id);
        }
        self.release.delayed_release(ids);
    }
}

/// Cloneable handle to the liveness tracker.
#[derive(Clone)]
pub struct LivenessHandle {
    tx: mpsc::UnboundedSender<LivenessCommand>,
}

impl LivenessHandle {
    pub fn new(tx: mpsc::UnboundedSender<LivenessCommand>) -> Self {
        Self { tx }
    }

    fn stopped() -> LockstepError {
        LockstepError::Infrastructure("liveness tracker stopped".to_string())
    }

    pub async fn register_self(&self) -> Result<String> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(LivenessCommand::RegisterSelf { reply })
            .map_err(|_| Self::stopped())?;
        waiter.wait().await.map_err(|_| Self::stopped())?
    }

    pub async fn reset_ownership(
        &self,
        records: Vec<LockRequestRecord>,
        live_services: HashSet<String>,
    ) -> Result<()> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(LivenessCommand::ResetOwnership {
                records,
                live_services,
                reply,
            })
            .map_err(|_| Self::stopped())?;
        waiter.wait().await.map_err(|_| Self::stopped())
    }

    pub fn lock_event(&self, is_locking: bool, owner_service_id: String, request_id: u64) {
        let _ = self.tx.send(LivenessCommand::LockEvent {
            is_locking,
            owner_service_id,
            request_id,
        });
    }

    pub fn service_up(&self, service_id: String) {
        let _ = self.tx.send(LivenessCommand::ServiceUp { service_id });
    }

    pub fn service_down(&self, service_id: String) {
        let _ = self.tx.send(LivenessCommand::ServiceDown { service_id });
    }
}
