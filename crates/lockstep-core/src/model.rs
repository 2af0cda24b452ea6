//! Lock request data model.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lockstep_common::{LockstepError, Result};

/// A single path-addressed lock inside a request. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    /// Path segments selecting the provider that owns this lock's
    /// semantics.
    pub path: Vec<String>,
    /// Lock name within the provider's subtree.
    pub name: String,
    /// Provider-defined payload; opaque to the protocol core.
    #[serde(default)]
    pub target: serde_json::Value,
}

impl Lock {
    pub fn new(path: impl IntoIterator<Item = impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            name: name.into(),
            target: serde_json::Value::Null,
        }
    }

    pub fn with_target(mut self, target: serde_json::Value) -> Self {
        self.target = target;
        self
    }

    /// Path rendered for logs and error messages.
    pub fn path_display(&self) -> String {
        self.path.join("/")
    }
}

/// One atomic proposal containing one or more locks.
///
/// Locks within a single request are never checked against each other;
/// intra-request conflicts are permitted by design. Only inter-request
/// conflicts are checked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub reason: String,
    pub locks: Vec<Lock>,
}

impl LockRequest {
    pub fn new(reason: impl Into<String>, locks: Vec<Lock>) -> Self {
        Self {
            reason: reason.into(),
            locks,
        }
    }
}

/// A lock inside a persisted record, with its target already serialized by
/// the owning provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedLock {
    pub path: Vec<String>,
    pub name: String,
    pub target: String,
}

/// The persisted form of a committed lock request.
///
/// Existence of the record's key in the store is the sole source of truth
/// for "is this lock held". The id doubles as the global-index slot the
/// record was committed at.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequestRecord {
    pub id: u64,
    pub owner_service_id: String,
    pub reason: String,
    pub timestamp_ms: i64,
    pub locks: Vec<RecordedLock>,
}

impl LockRequestRecord {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| LockstepError::Infrastructure(format!("failed to encode record: {e}")))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| LockstepError::Infrastructure(format!("corrupt lock record: {e}")))
    }
}

/// Persisted registration of a live service instance. The key is bound to a
/// store lease; its disappearance signals the service's death.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub lease_id: u64,
}

/// Caller-side options for an acquisition.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcquireOptions {
    /// How long the caller is willing to wait for a result. Bounds only the
    /// wait, never an in-flight commit. Falls back to the service default.
    pub timeout: Option<Duration>,
    /// Optional client-level TTL: the request is force-released if not
    /// renewed within this duration.
    pub lease: Option<Duration>,
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}
