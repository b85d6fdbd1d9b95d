// Worker events

use std::sync::Arc;

use crate::domain::{CustomMessage, WorkerId};
use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorReason {
    DecodingMessage,
    ProcessingMessage,
    ProcessingCustomMessage,
    /// The channel back to the dispatcher failed; the worker stops
    Unrecoverable,
}

impl WorkerErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerErrorReason::DecodingMessage => "decodingMessage",
            WorkerErrorReason::ProcessingMessage => "processingMessage",
            WorkerErrorReason::ProcessingCustomMessage => "processingCustomMessage",
            WorkerErrorReason::Unrecoverable => "unrecoverable",
        }
    }
}

impl std::fmt::Display for WorkerErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Start {
        worker_id: WorkerId,
    },
    Patrolling {
        worker_id: WorkerId,
    },
    /// Custom message received from the dispatcher
    Message {
        worker_id: WorkerId,
        message: CustomMessage,
    },
    /// Dispatcher side of the channel went away
    Disconnected {
        worker_id: WorkerId,
    },
    Error {
        worker_id: WorkerId,
        reason: WorkerErrorReason,
        cause: Arc<AppError>,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &WorkerId {
        match self {
            WorkerEvent::Start { worker_id }
            | WorkerEvent::Patrolling { worker_id }
            | WorkerEvent::Message { worker_id, .. }
            | WorkerEvent::Disconnected { worker_id }
            | WorkerEvent::Error { worker_id, .. } => worker_id,
        }
    }
}
