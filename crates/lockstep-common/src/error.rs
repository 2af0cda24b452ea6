//! Error types for Lockstep
//!
//! The taxonomy follows how each failure is recovered from:
//! - `Conflict`: a requested lock cannot currently be granted; the
//!   acquisition is parked in the retry queue and re-attempted when new
//!   replicated state arrives.
//! - `Infrastructure`: store unreachable, a transaction race lost, a lease
//!   grant failed; recovered by the owning component's own retry/backoff.
//! - `Timeout`: a caller's wait budget elapsed while the request was still
//!   conflicting; surfaced to the caller, never used to abort an in-flight
//!   commit.
//! - `Desynchronized`: the local replica diverged from the store's history;
//!   fatal to the process's view of state, triggers full resynchronization.

/// Application-specific error types
#[derive(thiserror::Error, Clone, Debug)]
pub enum LockstepError {
    #[error("lock conflict: {0}")]
    Conflict(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("operation timed out")]
    Timeout,

    #[error("local replica desynchronized: {0}")]
    Desynchronized(String),

    #[error("unknown lock request '{0}'")]
    UnknownRequest(u64),

    #[error("no lock provider registered for path '{0}'")]
    NoProvider(String),

    #[error("invalid lock target: {0}")]
    InvalidTarget(String),

    #[error("invalid lock request: {0}")]
    InvalidRequest(String),
}

impl LockstepError {
    /// Whether this error is a lock conflict (recoverable via retry on new
    /// replicated state).
    pub fn is_conflict(&self) -> bool {
        matches!(self, LockstepError::Conflict(_))
    }

    /// Whether this error mandates full state resynchronization.
    pub fn is_desynchronized(&self) -> bool {
        matches!(self, LockstepError::Desynchronized(_))
    }
}

pub type Result<T> = std::result::Result<T, LockstepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockstepError::Conflict("write lock on obj/1 held by request 5".to_string());
        assert_eq!(
            format!("{}", err),
            "lock conflict: write lock on obj/1 held by request 5"
        );

        let err = LockstepError::UnknownRequest(42);
        assert_eq!(format!("{}", err), "unknown lock request '42'");

        let err = LockstepError::Timeout;
        assert_eq!(format!("{}", err), "operation timed out");
    }

    #[test]
    fn test_error_classification() {
        assert!(LockstepError::Conflict("x".into()).is_conflict());
        assert!(!LockstepError::Timeout.is_conflict());
        assert!(LockstepError::Desynchronized("gap".into()).is_desynchronized());
        assert!(!LockstepError::Infrastructure("down".into()).is_desynchronized());
    }
}
