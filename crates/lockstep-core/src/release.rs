//! Release coordinator: removes committed lock requests from the store.
//!
//! Releases are idempotent: a request whose key is already gone (double
//! release, peer cleanup won the race) counts as released. Failed attempts
//! stay in the pending set and are retried on a randomized timer so
//! processes releasing the same orphaned set do not stampede the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lockstep_store::{CoordinationStore, TxnCompare, TxnOp};

use crate::config::LockServiceConfig;
use crate::keys::KeyLayout;
use crate::service::SharedServiceId;
use crate::store_ops::{acquire_propose_lock, index_compare, read_index};

pub enum ReleaseCommand {
    /// Release now.
    Release(u64),
    /// Release soon (lease expiry, liveness cleanup); batched onto the
    /// retry timer instead of hitting the store immediately.
    DelayedRelease(Vec<u64>),
    RetryTick,
}

pub struct ReleaseCoordinator {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    config: LockServiceConfig,
    service_id: SharedServiceId,
    pending: BTreeSet<u64>,
    timer_armed: bool,
    self_tx: mpsc::UnboundedSender<ReleaseCommand>,
    rx: mpsc::UnboundedReceiver<ReleaseCommand>,
}

impl ReleaseCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        config: LockServiceConfig,
        service_id: SharedServiceId,
        self_tx: mpsc::UnboundedSender<ReleaseCommand>,
        rx: mpsc::UnboundedReceiver<ReleaseCommand>,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            service_id,
            pending: BTreeSet::new(),
            timer_armed: false,
            self_tx,
            rx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                ReleaseCommand::Release(id) => {
                    self.pending.insert(id);
                    self.flush().await;
                }
                ReleaseCommand::DelayedRelease(ids) => {
                    for id in ids {
                        self.pending.insert(id);
                    }
                    self.arm_timer();
                }
                ReleaseCommand::RetryTick => {
                    self.timer_armed = false;
                    self.flush().await;
                }
            }
        }
        debug!("Release coordinator stopped");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let owner = self.service_id.get();
        let guard = match acquire_propose_lock(&self.store, &self.keys, &owner, &self.config).await
        {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "Could not take propose lock for release; will retry");
                self.arm_timer();
                return;
            }
        };
        self.release_pending().await;
        guard.release().await;
        if !self.pending.is_empty() {
            self.arm_timer();
        }
    }

    async fn release_pending(&mut self) {
        let mut index = match read_index(&self.store, &self.keys).await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "Could not read global index for release; will retry");
                return;
            }
        };

        for id in self.pending.clone() {
            let key = self.keys.request_key(id);
            match self.store.get(&key).await {
                Ok(None) => {
                    // Already gone: a double release is a no-op, not an
                    // error.
                    debug!(request_id = id, "Lock request already released");
                    self.pending.remove(&id);
                    continue;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(request_id = id, error = %e, "Release read failed; will retry");
                    return;
                }
            }

            let committed = self
                .store
                .txn(
                    vec![
                        index_compare(&self.keys, index),
                        TxnCompare::KeyExists(key.clone()),
                    ],
                    vec![
                        TxnOp::Delete { key },
                        TxnOp::Put {
                            key: self.keys.index_key(),
                            value: (index + 1).to_string(),
                        },
                    ],
                )
                .await;
            match committed {
                Ok(true) => {
                    index += 1;
                    self.pending.remove(&id);
                    info!(request_id = id, index = index, "Released lock request");
                }
                Ok(false) => {
                    warn!(
                        request_id = id,
                        "Global index advanced during release; will retry"
                    );
                    return;
                }
                Err(e) => {
                    warn!(request_id = id, error = %e, "Release transaction failed; will retry");
                    return;
                }
            }
        }
    }

    /// Arm the retry timer with randomized delay. Only armed while the
    /// pending set is non-empty, and never doubly armed.
    fn arm_timer(&mut self) {
        if self.timer_armed || self.pending.is_empty() {
            return;
        }
        self.timer_armed = true;
        let jitter_ms = self.config.release_retry_jitter.as_millis() as u64;
        let delay = self.config.release_retry_base
            + std::time::Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ReleaseCommand::RetryTick);
        });
    }
}

/// Cloneable handle to the release coordinator.
#[derive(Clone)]
pub struct ReleaseHandle {
    tx: mpsc::UnboundedSender<ReleaseCommand>,
}

impl ReleaseHandle {
    pub fn new(tx: mpsc::UnboundedSender<ReleaseCommand>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget: accepted into the pending set, no completion
    /// contract beyond that.
    pub fn release(&self, request_id: u64) {
        let _ = self.tx.send(ReleaseCommand::Release(request_id));
    }

    pub fn delayed_release(&self, request_ids: Vec<u64>) {
        if request_ids.is_empty() {
            return;
        }
        let _ = self.tx.send(ReleaseCommand::DelayedRelease(request_ids));
    }
}
