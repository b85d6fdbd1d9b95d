// Dispatcher handle: talk to a running dispatcher from other tasks

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{CustomMessage, DispatcherState, DispatcherStats};
use crate::{AppError, Result};

/// Point-in-time view of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSnapshot {
    pub state: DispatcherState,
    pub stats: DispatcherStats,
    pub workers: usize,
    pub schedulable: usize,
    pub retired: usize,
    pub cached: usize,
    pub limit_reached: bool,
}

#[derive(Debug)]
pub(crate) enum DispatcherCommand {
    Shutdown(Option<AppError>),
    CustomMessage(CustomMessage),
    ClearStat,
    Snapshot(oneshot::Sender<DispatcherSnapshot>),
}

/// Cloneable handle; commands are processed by the dispatcher loop in order
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
}

impl DispatcherHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<DispatcherCommand>) -> Self {
        Self { tx }
    }

    /// Begin graceful shutdown
    pub fn shutdown(&self) -> Result<()> {
        self.send(DispatcherCommand::Shutdown(None))
    }

    /// Begin shutdown and make `run` return `error`
    pub fn shutdown_with_error(&self, error: AppError) -> Result<()> {
        self.send(DispatcherCommand::Shutdown(Some(error)))
    }

    pub fn dispatch_custom_message(&self, message: CustomMessage) -> Result<()> {
        self.send(DispatcherCommand::CustomMessage(message))
    }

    pub fn clear_stat(&self) -> Result<()> {
        self.send(DispatcherCommand::ClearStat)
    }

    pub async fn snapshot(&self) -> Result<DispatcherSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DispatcherCommand::Snapshot(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| AppError::InvalidState("dispatcher stopped".to_string()))
    }

    fn send(&self, command: DispatcherCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| AppError::InvalidState("dispatcher stopped".to_string()))
    }
}
