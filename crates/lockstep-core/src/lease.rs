//! Client-level lease monitor.
//!
//! Leases here are advisory TTLs on held lock requests, owned entirely by
//! this process; they are independent of the store's native lease
//! mechanism, which is reserved for service-liveness keys. A request whose
//! lease expires without renewal is handed to the release coordinator.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use lockstep_common::{Completer, LockstepError, Result, completion_pair};

use crate::release::ReleaseHandle;

pub enum LeaseCommand {
    Add {
        request_id: u64,
        ttl: Duration,
    },
    Renew {
        request_id: u64,
        reply: Completer<Result<()>>,
    },
    Remove {
        request_id: u64,
    },
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

/// Deadline map scanned once per tick.
pub struct LeaseMonitor {
    entries: HashMap<u64, LeaseEntry>,
    release: ReleaseHandle,
    tick: Duration,
    rx: mpsc::UnboundedReceiver<LeaseCommand>,
}

impl LeaseMonitor {
    pub fn new(
        release: ReleaseHandle,
        tick: Duration,
        rx: mpsc::UnboundedReceiver<LeaseCommand>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            release,
            tick,
            rx,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command);
                }
                _ = ticker.tick() => self.scan(),
            }
        }
        debug!("Lease monitor stopped");
    }

    fn handle(&mut self, command: LeaseCommand) {
        match command {
            LeaseCommand::Add { request_id, ttl } => {
                self.entries.insert(
                    request_id,
                    LeaseEntry {
                        ttl,
                        deadline: Instant::now() + ttl,
                    },
                );
                debug!(request_id = request_id, ttl_ms = ttl.as_millis() as u64, "Lease added");
            }
            LeaseCommand::Renew { request_id, reply } => {
                let result = match self.entries.get_mut(&request_id) {
                    Some(entry) => {
                        entry.deadline = Instant::now() + entry.ttl;
                        debug!(request_id = request_id, "Lease renewed");
                        Ok(())
                    }
                    None => Err(LockstepError::UnknownRequest(request_id)),
                };
                reply.complete(result);
            }
            LeaseCommand::Remove { request_id } => {
                self.entries.remove(&request_id);
            }
        }
    }

    /// Force-release every entry past its deadline. Entries are removed
    /// eagerly; the replicated delete event makes the later `Remove`
    /// a no-op.
    fn scan(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.entries.remove(id);
            warn!(
                request_id = id,
                "Client lease expired without renewal; scheduling release"
            );
        }
        self.release.delayed_release(expired);
    }
}

/// Cloneable handle to the lease monitor.
#[derive(Clone)]
pub struct LeaseMonitorHandle {
    tx: mpsc::UnboundedSender<LeaseCommand>,
}

impl LeaseMonitorHandle {
    pub fn new(tx: mpsc::UnboundedSender<LeaseCommand>) -> Self {
        Self { tx }
    }

    pub fn add(&self, request_id: u64, ttl: Duration) {
        let _ = self.tx.send(LeaseCommand::Add { request_id, ttl });
    }

    pub async fn renew(&self, request_id: u64) -> Result<()> {
        let (reply, waiter) = completion_pair();
        self.tx
            .send(LeaseCommand::Renew { request_id, reply })
            .map_err(|_| LockstepError::Infrastructure("lease monitor stopped".to_string()))?;
        waiter
            .wait()
            .await
            .map_err(|_| LockstepError::Infrastructure("lease monitor stopped".to_string()))?
    }

    pub fn remove(&self, request_id: u64) {
        let _ = self.tx.send(LeaseCommand::Remove { request_id });
    }
}
