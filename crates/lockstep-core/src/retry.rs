//! Retry queue for conflicted acquisitions.
//!
//! Only conflict failures land here; infrastructure errors are surfaced or
//! retried by their own component. Whenever the replication watcher applies
//! new state, queued requests are re-proposed in FIFO order, stopping at
//! the first that still cannot be granted — FIFO fairness is the only
//! starvation guarantee.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use lockstep_common::{Completer, LockstepError, Result};

use crate::lease::LeaseMonitorHandle;
use crate::model::LockRequest;
use crate::proposal::ProposalHandle;

/// An acquisition waiting for conflicting state to clear.
pub struct PendingAcquisition {
    pub attempt_id: Uuid,
    pub request: LockRequest,
    pub lease: Option<Duration>,
    pub completer: Completer<Result<u64>>,
    pub last_error: Option<LockstepError>,
}

pub enum RetryCommand {
    Enqueue(PendingAcquisition),
    /// The local replica advanced; conflicting requests may now be
    /// grantable.
    StateAdvanced,
    /// The caller gave up waiting.
    Cancel { attempt_id: Uuid },
    /// The attempt finished without ever parking here (committed, or
    /// failed with a non-conflict error); any cancellation tombstone for
    /// it is stale.
    Resolved { attempt_id: Uuid },
}

pub struct RetryQueue {
    pending: VecDeque<PendingAcquisition>,
    /// Attempts canceled before their enqueue arrived (the caller timed out
    /// while the proposal coordinator still owned the attempt).
    canceled: HashSet<Uuid>,
    proposal: ProposalHandle,
    lease_monitor: LeaseMonitorHandle,
    rx: mpsc::UnboundedReceiver<RetryCommand>,
}

impl RetryQueue {
    pub fn new(
        proposal: ProposalHandle,
        lease_monitor: LeaseMonitorHandle,
        rx: mpsc::UnboundedReceiver<RetryCommand>,
    ) -> Self {
        Self {
            pending: VecDeque::new(),
            canceled: HashSet::new(),
            proposal,
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
                RetryCommand::Enqueue(pending) => self.enqueue(pending),
                RetryCommand::StateAdvanced => self.retry_front().await,
                RetryCommand::Cancel { attempt_id } => self.cancel(attempt_id),
                RetryCommand::Resolved { attempt_id } => {
                    self.canceled.remove(&attempt_id);
                }
            }
        }
        debug!("Retry queue stopped");
    }

    fn enqueue(&mut self, pending: PendingAcquisition) {
        if self.canceled.remove(&pending.attempt_id) {
            let error = pending.last_error.unwrap_or(LockstepError::Timeout);
            pending.completer.complete(Err(error));
            return;
        }
        debug!(
            attempt = %pending.attempt_id,
            reason = %pending.request.reason,
            queued = self.pending.len() + 1,
            "Acquisition parked for retry"
        );
        self.pending.push_back(pending);
    }

    async fn retry_front(&mut self) {
        loop {
            let Some(request) = self.pending.front().map(|front| front.request.clone()) else {
                break;
            };
            match self.proposal.propose_once(request).await {
                Ok(request_id) => {
                    let Some(pending) = self.pending.pop_front() else {
                        break;
                    };
                    debug!(
                        attempt = %pending.attempt_id,
                        request_id = request_id,
                        "Parked acquisition succeeded on retry"
                    );
                    if let Some(ttl) = pending.lease {
                        self.lease_monitor.add(request_id, ttl);
                    }
                    pending.completer.complete(Ok(request_id));
                }
                Err(e) => {
                    let conflict = e.is_conflict();
                    if let Some(front) = self.pending.front_mut() {
                        if !conflict {
                            warn!(attempt = %front.attempt_id, error = %e, "Retry attempt failed");
                        }
                        front.last_error = Some(e);
                    }
                    break;
                }
            }
        }
    }

    fn cancel(&mut self, attempt_id: Uuid) {
        if let Some(position) = self
            .pending
            .iter()
            .position(|pending| pending.attempt_id == attempt_id)
        {
            if let Some(pending) = self.pending.remove(position) {
                let error = pending.last_error.unwrap_or(LockstepError::Timeout);
                pending.completer.complete(Err(error));
            }
        } else {
            // Not here yet: remember the cancellation so a late enqueue is
            // resolved immediately instead of lingering forever.
            self.canceled.insert(attempt_id);
        }
    }
}

/// Cloneable handle to the retry queue.
#[derive(Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<RetryCommand>,
}

impl RetryHandle {
    pub fn new(tx: mpsc::UnboundedSender<RetryCommand>) -> Self {
        Self { tx }
    }

    pub fn enqueue(&self, pending: PendingAcquisition) {
        let _ = self.tx.send(RetryCommand::Enqueue(pending));
    }

    pub fn state_advanced(&self) {
        let _ = self.tx.send(RetryCommand::StateAdvanced);
    }

    pub fn cancel(&self, attempt_id: Uuid) {
        let _ = self.tx.send(RetryCommand::Cancel { attempt_id });
    }

    pub fn resolved(&self, attempt_id: Uuid) {
        let _ = self.tx.send(RetryCommand::Resolved { attempt_id });
    }
}
