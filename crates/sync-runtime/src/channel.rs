use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sync_core::{Drained, EngineEvent, EngineInput, IngressQueue, PushOutcome, ViewSnapshot};
use thiserror::Error;
use tokio::sync::{Notify, broadcast, futures::Notified, watch};

/// Outcome and defect stream handed to UI subscribers.
pub type EventStream = broadcast::Receiver<EngineEvent>;

/// Errors returned by runtime handle operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// The engine actor has shut down.
    #[error("sync runtime is shut down")]
    Closed,
}

/// Ingress queue shared by the receive loop, UI handles and the actor.
/// The lock is held only for a push or a drain.
#[derive(Debug, Clone)]
pub struct SharedIngress {
    queue: Arc<Mutex<IngressQueue>>,
    wake: Arc<Notify>,
}

impl SharedIngress {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(IngressQueue::new(capacity))),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn push(&self, input: EngineInput) -> PushOutcome {
        let outcome = self.lock().push(input);
        self.wake.notify_one();
        outcome
    }

    pub fn drain(&self) -> Drained {
        self.lock().drain()
    }

    /// Resolves once something was pushed since the last wake-up.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    fn lock(&self) -> MutexGuard<'_, IngressQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event fan-out plus the latest published snapshot.
#[derive(Debug, Clone)]
pub struct SyncChannels {
    event_tx: broadcast::Sender<EngineEvent>,
    snapshot_tx: watch::Sender<Arc<ViewSnapshot>>,
}

impl SyncChannels {
    pub fn new(event_buffer: usize, initial: ViewSnapshot) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (snapshot_tx, _) = watch::channel(Arc::new(initial));
        Self {
            event_tx,
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn latest(&self) -> Arc<ViewSnapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn publish(&self, snapshot: ViewSnapshot) {
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
