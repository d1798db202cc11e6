use parking_lot::Mutex;
use tokio::sync::broadcast;

const STATUS_CAPACITY: usize = 16;

/// The coordination phase a client is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Training is paused until more participants join.
    WaitingForParticipants,
    /// Waiting for the session to hand out the peers of the next peer round.
    RetrievingPeers,
    /// The local model is being trained.
    Training,
    /// The local model was sent and the global model is being awaited.
    UpdatingModel,
    /// The connection to the session is closed.
    Disconnected,
}

/// Publishes status transitions to any amount of subscribers.
///
/// Publishing the status that is already current is a no-op, so subscribers only ever observe
/// transitions.
#[derive(Debug)]
pub struct StatusBoard {
    tx: broadcast::Sender<Status>,
    current: Mutex<Option<Status>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);

        Self {
            tx,
            current: Mutex::new(None),
        }
    }

    /// Moves to `status`.
    ///
    /// # Returns
    /// `false` if `status` was already the current one.
    pub fn publish(&self, status: Status) -> bool {
        let mut current = self.current.lock();
        if *current == Some(status) {
            return false;
        }

        *current = Some(status);
        let _ = self.tx.send(status);
        true
    }

    pub fn current(&self) -> Option<Status> {
        *self.current.lock()
    }

    /// Subscribes to every transition published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.tx.subscribe()
    }
}
