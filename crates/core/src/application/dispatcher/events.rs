// Dispatcher events

use std::sync::Arc;

use crate::domain::{DispatcherStats, Frame, Pid, WorkerId};
use crate::AppError;

/// Why a dispatcher `Error` event was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherErrorReason {
    ShuttingDown,
    DispatchingMessage,
    DispatchingCustomMessage,
    SendingMessage,
    CreatingWorker,
}

impl DispatcherErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherErrorReason::ShuttingDown => "shuttingDown",
            DispatcherErrorReason::DispatchingMessage => "dispatchingMessage",
            DispatcherErrorReason::DispatchingCustomMessage => "dispatchingCustomMessage",
            DispatcherErrorReason::SendingMessage => "sendingMessage",
            DispatcherErrorReason::CreatingWorker => "creatingWorker",
        }
    }
}

impl std::fmt::Display for DispatcherErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    Start,
    Patrolling,
    /// A queue message was handed to a worker
    Consumed {
        worker_id: WorkerId,
        message_id: String,
    },
    Processed {
        worker_id: WorkerId,
    },
    CustomMessageProcessed {
        worker_id: WorkerId,
    },
    WorkerExit {
        worker_id: WorkerId,
        pid: Pid,
        remaining: usize,
    },
    /// Capacity just became saturated
    LimitReached,
    /// Non-protocol frame from a worker
    Message {
        worker_id: WorkerId,
        frame: Frame,
    },
    Shutdown {
        stats: DispatcherStats,
    },
    Error {
        reason: DispatcherErrorReason,
        cause: Arc<AppError>,
    },
}
