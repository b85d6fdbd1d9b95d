// Worker Channel Port
// Ordered, per-worker frame delivery in both directions.

use crate::domain::{Frame, WorkerId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel to worker {0} is closed")]
    Closed(WorkerId),

    #[error("Frame encoding failed: {0}")]
    Encode(String),

    #[error("Frame decoding failed: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Frame received from a worker, tagged with its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFrame {
    pub worker_id: WorkerId,
    pub frame: Frame,
}

// Worker processes write their tagged outbox straight to stdout
impl From<WorkerFrame> for Frame {
    fn from(tagged: WorkerFrame) -> Self {
        tagged.frame
    }
}

/// Shared sender all workers report into (the dispatcher's inbox)
pub type WorkerInbox = mpsc::UnboundedSender<WorkerFrame>;

/// Dispatcher-side sending half of a worker channel
#[derive(Debug, Clone)]
pub struct WorkerLink {
    worker_id: WorkerId,
    tx: mpsc::UnboundedSender<Frame>,
}

impl WorkerLink {
    pub fn new(worker_id: WorkerId, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { worker_id, tx }
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Closed(self.worker_id.clone()))
    }

    /// False once the worker side has gone away
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Worker-side sending half, tags every frame with the worker id
#[derive(Debug, Clone)]
pub struct WorkerOutbox {
    worker_id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerFrame>,
}

impl WorkerOutbox {
    pub fn new(worker_id: WorkerId, tx: mpsc::UnboundedSender<WorkerFrame>) -> Self {
        Self { worker_id, tx }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(WorkerFrame {
                worker_id: self.worker_id.clone(),
                frame,
            })
            .map_err(|_| TransportError::Closed(self.worker_id.clone()))
    }
}

/// Everything a worker needs to talk to its dispatcher
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub inbound: mpsc::UnboundedReceiver<Frame>,
    pub outbox: WorkerOutbox,
}

/// In-memory channel pair for a worker living in the same process
pub fn worker_channel(worker_id: WorkerId, inbox: WorkerInbox) -> (WorkerLink, WorkerEndpoint) {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = WorkerLink::new(worker_id.clone(), tx);
    let endpoint = WorkerEndpoint {
        inbound: rx,
        outbox: WorkerOutbox::new(worker_id, inbox),
    };
    (link, endpoint)
}
