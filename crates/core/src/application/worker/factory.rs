// Worker factory
//
// Holds everything needed to build identical workers: configuration,
// handlers and event listeners. Supervisors call `make_worker` once per
// spawned worker.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::WorkerConfig;
use super::events::WorkerEvent;
use super::handler::{CustomMessageHandler, DelayCondition, MessageHandler};
use super::Worker;
use crate::domain::{ExitMode, QueueMessage, WorkerId};
use crate::port::WorkerEndpoint;

#[derive(Clone, Default)]
pub struct WorkerFactory {
    config: WorkerConfig,
    message_handler: Option<Arc<dyn MessageHandler>>,
    custom_handler: Option<Arc<dyn CustomMessageHandler>>,
    delay_condition: Option<DelayCondition>,
    listeners: Vec<mpsc::UnboundedSender<WorkerEvent>>,
}

impl WorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_message_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.message_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_custom_message_handler(
        mut self,
        handler: impl CustomMessageHandler + 'static,
    ) -> Self {
        self.custom_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_delay_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&QueueMessage) -> Option<Duration> + Send + Sync + 'static,
    {
        self.delay_condition = Some(Arc::new(condition));
        self
    }

    /// Zero is ignored
    pub fn with_idle_shutdown(mut self, seconds: u64) -> Self {
        self.config.set_idle_shutdown(seconds);
        self
    }

    pub fn with_exit_mode(mut self, mode: ExitMode) -> Self {
        self.config.exit_mode = mode;
        self
    }

    /// Zero is ignored
    pub fn with_patrol_period(mut self, seconds: u64) -> Self {
        self.config.set_patrol_period(seconds);
        self
    }

    /// Every worker built afterwards forwards its events to `tx`
    pub fn register_listener(mut self, tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        self.listeners.push(tx);
        self
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn make_worker(&self, worker_id: WorkerId, endpoint: WorkerEndpoint) -> Worker {
        let mut worker = Worker::new(worker_id, endpoint, self.config.clone());
        if let Some(handler) = &self.message_handler {
            worker.set_message_handler(Arc::clone(handler));
        }
        if let Some(handler) = &self.custom_handler {
            worker.set_custom_message_handler(Arc::clone(handler));
        }
        if let Some(condition) = &self.delay_condition {
            worker.set_delay_condition(Arc::clone(condition));
        }
        for tx in &self.listeners {
            worker.attach(tx.clone());
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkerState;
    use crate::port::worker_channel;

    #[test]
    fn test_make_worker_applies_config() {
        let factory = WorkerFactory::new()
            .with_idle_shutdown(3)
            .with_exit_mode(ExitMode::Passive)
            .with_patrol_period(0);

        let (inbox, _inbox_rx) = mpsc::unbounded_channel();
        let id = WorkerId::new("w1");
        let (_link, endpoint) = worker_channel(id.clone(), inbox);
        let worker = factory.make_worker(id.clone(), endpoint);

        assert_eq!(worker.id(), &id);
        assert_eq!(worker.state(), WorkerState::Shutdown);
        assert_eq!(worker.config().idle_shutdown, Some(Duration::from_secs(3)));
        assert_eq!(worker.config().exit_mode, ExitMode::Passive);
        assert_eq!(worker.config().patrol_period, WorkerConfig::default().patrol_period);
    }
}
