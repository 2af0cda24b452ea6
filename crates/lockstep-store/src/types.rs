//! Wire-level types of the coordination store contract.

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Identifier of a store-granted lease.
pub type LeaseId = u64;

/// A key with its current value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Kind of mutation observed on a watched key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Delete,
}

/// A single ordered mutation from a watch stream.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// New value (`None` for deletes).
    pub value: Option<String>,
    /// Value before the mutation (`None` for creates).
    pub prev_value: Option<String>,
    /// Store revision at which the mutation was committed.
    pub revision: u64,
}

/// Item delivered on a watch stream.
#[derive(Clone, Debug)]
pub enum WatchMessage {
    Event(WatchEvent),
    /// The store dropped this watch. No further events will arrive; the
    /// consumer must treat its local replica as stale.
    Canceled,
}

/// Ordered stream of watch messages.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchMessage>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next message. `None` means the store side is gone
    /// without an explicit cancel (treated the same way by consumers).
    pub async fn recv(&mut self) -> Option<WatchMessage> {
        self.rx.recv().await
    }

    /// Adapt into a `futures`-style stream.
    pub fn into_stream(self) -> UnboundedReceiverStream<WatchMessage> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Condition guarding a transaction.
#[derive(Clone, Debug)]
pub enum TxnCompare {
    KeyAbsent(String),
    KeyExists(String),
    ValueEquals(String, String),
}

/// Mutation applied when all of a transaction's compares hold.
#[derive(Clone, Debug)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
    },
    PutWithLease {
        key: String,
        value: String,
        lease: LeaseId,
    },
    Delete {
        key: String,
    },
}
