//! Lockstep Core - Distributed mutual-exclusion protocol
//!
//! This crate implements the lock-acquisition/release protocol and its
//! supporting machinery over a linearizable coordination store:
//! - `LockProviderRegistry`: path-indexed lock-semantics plugins and the
//!   local replica of who holds what
//! - `ProposalCoordinator`: the propose / replicate / commit cycle
//! - `RetryQueue`: conflicted acquisitions re-attempted on new state
//! - `ReleaseCoordinator`: conditional removal with randomized retry
//! - `ReplicationWatcher`: ordered fan-out of store mutations
//! - `LeaseMonitor`: client-level lock TTLs
//! - `ServiceLivenessTracker`: orphan cleanup after participant crashes
//! - `LockService`: composition root, startup and resynchronization
//!
//! Every component runs as a single-threaded actor draining its own command
//! queue; the only way any component's view of "who holds what" changes is
//! by applying a replicated event, so all replicas converge in the same
//! order.

pub mod config;
pub mod keys;
pub mod lease;
pub mod liveness;
pub mod model;
pub mod proposal;
pub mod provider;
pub mod registry;
pub mod release;
pub mod retry;
pub mod service;
pub mod store_ops;
pub mod watcher;

// Re-export commonly used types
pub use config::LockServiceConfig;
pub use model::{AcquireOptions, Lock, LockRequest, LockRequestRecord, RecordedLock, ServiceRecord};
pub use provider::{ExclusiveProvider, LockProvider};
pub use service::{DesyncReason, LockService, LockServiceBuilder};
