//! Lockstep Store - Coordination store contract
//!
//! This crate defines the interface Lockstep expects from its linearizable
//! coordination store (an etcd-like system):
//! - point reads/writes and atomic prefix snapshots
//! - compare-and-swap transactions
//! - ordered watch streams replayable from a revision
//! - revocable time-based leases
//!
//! It also ships `MemoryStore`, a complete in-process implementation used by
//! tests and embedded deployments.

pub mod memory;
pub mod store;
pub mod types;

pub use memory::MemoryStore;
pub use store::CoordinationStore;
pub use types::{
    KeyValue, LeaseId, TxnCompare, TxnOp, WatchEvent, WatchEventKind, WatchMessage, WatchStream,
};
