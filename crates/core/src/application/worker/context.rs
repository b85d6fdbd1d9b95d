// Handler context
//
// Borrowed view of the worker handed to message handlers.

use crate::domain::{CustomMessage, WorkerId, WorkerState};
use crate::port::{TransportError, WorkerOutbox};

pub struct WorkerContext<'a> {
    worker_id: &'a WorkerId,
    received: u64,
    state: &'a mut WorkerState,
    outbox: &'a WorkerOutbox,
}

impl<'a> WorkerContext<'a> {
    pub(crate) fn new(
        worker_id: &'a WorkerId,
        received: u64,
        state: &'a mut WorkerState,
        outbox: &'a WorkerOutbox,
    ) -> Self {
        Self {
            worker_id,
            received,
            state,
            outbox,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.worker_id
    }

    /// Messages received so far, including the current one
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn state(&self) -> WorkerState {
        *self.state
    }

    /// Stop taking work once the current message is acknowledged
    pub fn shutdown(&mut self) {
        if *self.state == WorkerState::Running {
            *self.state = WorkerState::Shutting;
        }
    }

    pub fn send_custom_message(&self, message: CustomMessage) -> Result<(), TransportError> {
        self.outbox.send(message.into_frame())
    }
}
