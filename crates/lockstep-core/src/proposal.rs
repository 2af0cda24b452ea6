//! Proposal coordinator: the propose → replicate → commit cycle.
//!
//! All in-process acquisitions drain through this actor's single command
//! queue, so the read-index / catch-up / conflict-test / commit sequence is
//! atomic with respect to other local acquisitions; cross-process
//! serialization comes solely from the store-resident propose lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use lockstep_common::{Completer, LockstepError, Result, completion_pair, current_timestamp_ms};
use lockstep_store::{CoordinationStore, TxnOp};

use crate::config::LockServiceConfig;
use crate::keys::KeyLayout;
use crate::lease::LeaseMonitorHandle;
use crate::model::{LockRequest, LockRequestRecord};
use crate::registry::RegistryHandle;
use crate::retry::{PendingAcquisition, RetryHandle};
use crate::service::SharedServiceId;
use crate::store_ops::{acquire_propose_lock, index_compare, read_index};

pub enum ProposalCommand {
    /// A fresh client acquisition. Conflicts are parked in the retry queue;
    /// other failures complete the slot directly.
    Acquire {
        attempt_id: Uuid,
        request: LockRequest,
        lease: Option<Duration>,
        completer: Completer<Result<u64>>,
    },
    /// A single re-proposal on behalf of the retry queue; all failures are
    /// returned to it.
    ProposeOnce {
        request: LockRequest,
        reply: Completer<Result<u64>>,
    },
}

pub struct ProposalCoordinator {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    config: LockServiceConfig,
    service_id: SharedServiceId,
    registry: RegistryHandle,
    retry: RetryHandle,
    lease_monitor: LeaseMonitorHandle,
    rx: mpsc::UnboundedReceiver<ProposalCommand>,
}

impl ProposalCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        config: LockServiceConfig,
        service_id: SharedServiceId,
        registry: RegistryHandle,
        retry: RetryHandle,
        lease_monitor: LeaseMonitorHandle,
        rx: mpsc::UnboundedReceiver<ProposalCommand>,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            service_id,
            registry,
            retry,
            lease_monitor,
            rx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                ProposalCommand::Acquire {
                    attempt_id,
                    request,
                    lease,
                    completer,
                } => match self.propose(&request).await {
                    Ok(request_id) => {
                        if let Some(ttl) = lease {
                            self.lease_monitor.add(request_id, ttl);
                        }
                        completer.complete(Ok(request_id));
                        // Clears any cancellation that raced ahead of this
                        // outcome.
                        self.retry.resolved(attempt_id);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(attempt = %attempt_id, error = %e, "Acquisition conflicted; parking");
                        self.retry.enqueue(PendingAcquisition {
                            attempt_id,
                            request,
                            lease,
                            completer,
                            last_error: Some(e),
                        });
                    }
                    Err(e) => {
                        completer.complete(Err(e));
                        self.retry.resolved(attempt_id);
                    }
                },
                ProposalCommand::ProposeOnce { request, reply } => {
                    reply.complete(self.propose(&request).await);
                }
            }
        }
        debug!("Proposal coordinator stopped");
    }

    async fn propose(&self, request: &LockRequest) -> Result<u64> {
        let owner = self.service_id.get();
        let guard = acquire_propose_lock(&self.store, &self.keys, &owner, &self.config).await?;
        let result = self.propose_locked(request, &owner).await;
        // The propose lock is always released on exit, success or not.
        guard.release().await;
        result
    }

    async fn propose_locked(&self, request: &LockRequest, owner: &str) -> Result<u64> {
        let index = read_index(&self.store, &self.keys).await?;

        // Core correctness property: the conflict test below must see a
        // fully caught-up replica, so a request is never granted against a
        // stale view.
        self.registry
            .wait_for_index(index, self.config.catch_up_timeout)
            .await?;

        let locks = self.registry.test_and_serialize(request.clone()).await?;

        let id = index + 1;
        let record = LockRequestRecord {
            id,
            owner_service_id: owner.to_string(),
            reason: request.reason.clone(),
            timestamp_ms: current_timestamp_ms(),
            locks,
        };
        let committed = self
            .store
            .txn(
                vec![index_compare(&self.keys, index)],
                vec![
                    TxnOp::Put {
                        key: self.keys.request_key(id),
                        value: record.to_json()?,
                    },
                    TxnOp::Put {
                        key: self.keys.index_key(),
                        value: id.to_string(),
                    },
                ],
            )
            .await?;
        if !committed {
            // Some other writer advanced the index between our read and the
            // commit; the attempt is safely retryable.
            return Err(LockstepError::Infrastructure(
                "global index advanced during commit".to_string(),
            ));
        }

        info!(
            request_id = id,
            reason = %request.reason,
            locks = record.locks.len(),
            "Lock request committed"
        );
        Ok(id)
    }
}

/// Cloneable handle to the proposal coordinator.
#[derive(Clone)]
pub struct ProposalHandle {
    tx: mpsc::UnboundedSender<ProposalCommand>,
}

impl ProposalHandle {
    pub fn new(tx: mpsc::UnboundedSender<ProposalCommand>) -> Self {
        Self { tx }
    }

    /// Submit a fresh acquisition. The completer is resolved on commit, on
    /// a non-conflict failure, or by the retry queue.
    pub fn acquire(
        &self,
        attempt_id: Uuid,
        request: LockRequest,
        lease: Option<Duration>,
        completer: Completer<Result<u64>>,
    ) {
        if let Err(mpsc::error::SendError(command)) = self.tx.send(ProposalCommand::Acquire {
            attempt_id,
            request,
            lease,
            completer,
        }) && let ProposalCommand::Acquire { completer, .. } = command
        {
            completer.complete(Err(LockstepError::Infrastructure(
                "proposal coordinator stopped".to_string(),
            )));
        }
    }

    /// One propose cycle with no retry routing; used by the retry queue.
    pub async fn propose_once(&self, request: LockRequest) -> Result<u64> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(ProposalCommand::ProposeOnce { request, reply })
            .map_err(|_| {
                LockstepError::Infrastructure("proposal coordinator stopped".to_string())
            })?;
        waiter.wait().await.map_err(|_| {
            LockstepError::Infrastructure("proposal coordinator stopped".to_string())
        })?
    }
}
