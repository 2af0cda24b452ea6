//! Replication watcher: the only writer of replica state.
//!
//! One watch over the protocol's root prefix observes request and service
//! mutations in a single commit order. Request events are applied to the
//! registry in that order; service events feed the liveness tracker. Any
//! gap — a canceled watch, a closed stream, an event the replica cannot
//! apply, an undecodable record — means the replica can no longer be
//! trusted, and the watcher signals the supervisor and stops.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lockstep_store::{CoordinationStore, WatchEvent, WatchEventKind, WatchMessage};

use crate::keys::KeyLayout;
use crate::lease::LeaseMonitorHandle;
use crate::liveness::LivenessHandle;
use crate::model::LockRequestRecord;
use crate::registry::RegistryHandle;
use crate::retry::RetryHandle;
use crate::service::{DesyncReason, SharedServiceId};

pub struct ReplicationWatcher {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    service_id: SharedServiceId,
    registry: RegistryHandle,
    liveness: LivenessHandle,
    retry: RetryHandle,
    lease_monitor: LeaseMonitorHandle,
    desync_tx: mpsc::UnboundedSender<DesyncReason>,
}

impl ReplicationWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        service_id: SharedServiceId,
        registry: RegistryHandle,
        liveness: LivenessHandle,
        retry: RetryHandle,
        lease_monitor: LeaseMonitorHandle,
        desync_tx: mpsc::UnboundedSender<DesyncReason>,
    ) -> Self {
        Self {
            store,
            keys,
            service_id,
            registry,
            liveness,
            retry,
            lease_monitor,
            desync_tx,
        }
    }

    /// Start watching from `from_revision` (the first revision NOT covered
    /// by the snapshot the replica was built from).
    pub fn spawn(self, from_revision: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(from_revision))
    }

    async fn run(self, from_revision: u64) {
        let mut stream = match self
            .store
            .watch(&self.keys.root_prefix(), from_revision)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Could not open replication watch");
                let _ = self.desync_tx.send(DesyncReason::WatchLost);
                return;
            }
        };
        info!(from_revision = from_revision, "Replication watch started");

        loop {
            match stream.recv().await {
                Some(WatchMessage::Event(event)) => {
                    if let Err(reason) = self.handle_event(event).await {
                        let _ = self.desync_tx.send(reason);
                        return;
                    }
                }
                Some(WatchMessage::Canceled) | None => {
                    warn!("Replication watch lost");
                    let _ = self.desync_tx.send(DesyncReason::WatchLost);
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, event: WatchEvent) -> Result<(), DesyncReason> {
        if let Some(request_id) = self.keys.parse_request_key(&event.key) {
            return self.handle_request_event(request_id, event).await;
        }
        if let Some(service_id) = self.keys.parse_service_key(&event.key) {
            self.handle_service_event(service_id, event.kind);
            return Ok(());
        }
        // Index and propose-lock mutations carry no replica state.
        Ok(())
    }

    async fn handle_request_event(
        &self,
        request_id: u64,
        event: WatchEvent,
    ) -> Result<(), DesyncReason> {
        let is_locking = event.kind == WatchEventKind::Create;
        // Creates carry the record in `value`, deletes in `prev_value`; the
        // providers need the full record either way to undo their state.
        let raw = match event.kind {
            WatchEventKind::Create => event.value,
            WatchEventKind::Delete => event.prev_value,
        };
        let Some(raw) = raw else {
            error!(
                request_id = request_id,
                kind = ?event.kind,
                "Request event without a record payload"
            );
            return Err(DesyncReason::ReplicaDiverged(format!(
                "request {request_id} event carried no record"
            )));
        };
        let record = LockRequestRecord::from_json(&raw).map_err(|e| {
            error!(request_id = request_id, error = %e, "Undecodable lock request record");
            DesyncReason::ReplicaDiverged(format!("request {request_id} record undecodable"))
        })?;
        let owner = record.owner_service_id.clone();

        if let Err(e) = self.registry.apply_event(is_locking, record).await {
            return Err(DesyncReason::ReplicaDiverged(e.to_string()));
        }
        self.liveness.lock_event(is_locking, owner, request_id);

        if !is_locking {
            // However the release came about, any client-level lease for
            // the request is now moot.
            self.lease_monitor.remove(request_id);
            // A release may have cleared the conflict blocking a parked
            // acquisition.
            self.retry.state_advanced();
        }
        Ok(())
    }

    fn handle_service_event(&self, service_id: &str, kind: WatchEventKind) {
        match kind {
            WatchEventKind::Create => {
                if service_id != self.service_id.get() {
                    debug!(peer = %service_id, "Observed peer service registration");
                }
                self.liveness.service_up(service_id.to_string());
            }
            WatchEventKind::Delete => {
                self.liveness.service_down(service_id.to_string());
            }
        }
    }
}
