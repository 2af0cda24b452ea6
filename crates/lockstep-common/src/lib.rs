//! Lockstep Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used across all Lockstep
//! components:
//! - Error taxonomy (`LockstepError`)
//! - One-shot completion slots for actor request/reply
//! - Path-pattern trie for provider registration
//! - Timestamp helpers

pub mod completion;
pub mod error;
pub mod time;
pub mod trie;

// Re-exports for convenience
pub use completion::{Completer, Waiter, completion_pair};
pub use error::{LockstepError, Result};
pub use time::current_timestamp_ms;
pub use trie::{PathTrie, WILDCARD};
