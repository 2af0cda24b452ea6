//! One-shot completion slots for actor request/reply.
//!
//! A `Completer`/`Waiter` pair carries a single result from an actor back to
//! the caller that sent it a command. Unlike a bare oneshot channel the slot
//! is cancel-safe in both directions:
//! - completing after the waiter canceled (or was dropped by a timeout) is a
//!   no-op, not a panic;
//! - dropping the completer without a result wakes the waiter with an
//!   `Aborted` error so callers never hang on a dead actor.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// The completer was dropped before producing a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Aborted;

impl std::fmt::Display for Aborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "completion aborted: completer dropped without a result")
    }
}

impl std::error::Error for Aborted {}

enum SlotState<T> {
    /// No result yet, waiter still interested.
    Empty,
    /// Result delivered, not yet observed.
    Set(T),
    /// Result observed by the waiter.
    Taken,
    /// Waiter gave up; any later result is discarded.
    Canceled,
    /// Completer dropped without a result.
    Aborted,
}

struct Shared<T> {
    state: Mutex<SlotState<T>>,
    notify: Notify,
}

/// Producing half of a completion slot.
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
    done: bool,
}

/// Consuming half of a completion slot.
pub struct Waiter<T> {
    shared: Arc<Shared<T>>,
}

/// Create a linked completer/waiter pair.
pub fn completion_pair<T>() -> (Completer<T>, Waiter<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(SlotState::Empty),
        notify: Notify::new(),
    });
    (
        Completer {
            shared: shared.clone(),
            done: false,
        },
        Waiter { shared },
    )
}

impl<T> Completer<T> {
    /// Deliver the result. Returns `false` (and drops the value) if the
    /// waiter already canceled or a result was already delivered.
    pub fn complete(mut self, value: T) -> bool {
        self.done = true;
        let mut state = self.shared.state.lock();
        match *state {
            SlotState::Empty => {
                *state = SlotState::Set(value);
                drop(state);
                self.shared.notify.notify_one();
                true
            }
            _ => false,
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.shared.state.lock();
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Aborted;
            drop(state);
            self.shared.notify.notify_one();
        }
    }
}

impl<T> Waiter<T> {
    /// Block until the result arrives. Errors if the completer was dropped
    /// without producing one.
    pub async fn wait(self) -> Result<T, Aborted> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                match std::mem::replace(&mut *state, SlotState::Taken) {
                    SlotState::Set(value) => return Ok(value),
                    SlotState::Aborted => {
                        *state = SlotState::Aborted;
                        return Err(Aborted);
                    }
                    other => *state = other,
                }
            }
            notified.await;
        }
    }

    /// Explicitly give up on the result. Any later `complete` is discarded.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Canceled;
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        // A waiter dropped mid-wait (e.g. by a timeout wrapper) behaves like
        // an explicit cancel.
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_complete_then_wait() {
        let (completer, waiter) = completion_pair();
        assert!(completer.complete(7u64));
        assert_eq!(waiter.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn test_wait_then_complete() {
        let (completer, waiter) = completion_pair();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(completer.complete("done"));
        assert_eq!(handle.await.unwrap(), Ok("done"));
    }

    #[tokio::test]
    async fn test_complete_after_cancel_is_noop() {
        let (completer, waiter) = completion_pair::<u64>();
        waiter.cancel();
        assert!(!completer.complete(1));
    }

    #[tokio::test]
    async fn test_complete_after_waiter_dropped_is_noop() {
        let (completer, waiter) = completion_pair::<u64>();
        drop(waiter);
        assert!(!completer.complete(1));
    }

    #[tokio::test]
    async fn test_dropped_completer_aborts_wait() {
        let (completer, waiter) = completion_pair::<u64>();
        drop(completer);
        assert_eq!(waiter.wait().await, Err(Aborted));
    }

    #[tokio::test]
    async fn test_timeout_wrapper_discards_late_result() {
        let (completer, waiter) = completion_pair::<u64>();
        let result = tokio::time::timeout(Duration::from_millis(10), waiter.wait()).await;
        assert!(result.is_err());
        // The waiter was dropped by the timeout; the late result is discarded.
        assert!(!completer.complete(99));
    }
}
