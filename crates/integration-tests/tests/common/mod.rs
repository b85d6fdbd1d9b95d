// Shared rig: a real dispatcher over in-process workers and a mock feed
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use warren_core::application::{
    Dispatcher, DispatcherConfig, DispatcherEvent, DispatcherHandle, DispatcherSnapshot,
    MessageHandler, WorkerContext, WorkerFactory,
};
use warren_core::domain::QueueMessage;
use warren_core::port::queue_feed::mocks::MockFeed;
use warren_core::port::{DeliveryTag, QueueFeed, SequentialIdProvider};
use warren_infra_system::TaskSupervisor;

const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Holds handlers until released
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn closed() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open() -> Self {
        let gate = Self::closed();
        gate.release();
        gate
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }
}

/// Records message contents as handling starts, then waits at the gate
pub struct GatedHandler {
    gate: watch::Receiver<bool>,
    handled: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle(
        &self,
        message: QueueMessage,
        _ctx: &mut WorkerContext<'_>,
    ) -> anyhow::Result<()> {
        self.handled
            .lock()
            .unwrap()
            .push(message.content_str().unwrap_or_default().to_string());
        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            gate.changed().await?;
        }
        Ok(())
    }
}

/// Factory whose workers run a [`GatedHandler`]
pub fn gated_factory(gate: &Gate) -> (WorkerFactory, Arc<Mutex<Vec<String>>>) {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let factory = WorkerFactory::new().with_message_handler(GatedHandler {
        gate: gate.tx.subscribe(),
        handled: Arc::clone(&handled),
    });
    (factory, handled)
}

pub fn config(max_workers: Option<usize>, cache_limit: usize) -> DispatcherConfig {
    DispatcherConfig {
        max_workers,
        cache_limit,
        ..DispatcherConfig::default()
    }
}

pub struct Rig {
    pub feed: MockFeed,
    pub handle: DispatcherHandle,
    pub events: mpsc::UnboundedReceiver<DispatcherEvent>,
    run: JoinHandle<(Dispatcher, warren_core::Result<()>)>,
}

impl Rig {
    /// Spawn the dispatcher loop and wait for it to connect the feed
    pub async fn start(config: DispatcherConfig, factory: WorkerFactory) -> Self {
        let feed = MockFeed::new();
        let mut dispatcher = Dispatcher::new(
            config,
            Arc::new(feed.clone()),
            Box::new(TaskSupervisor::new(Arc::new(factory))),
            Arc::new(SequentialIdProvider::new("id")),
        );
        let events = dispatcher.subscribe();
        let handle = dispatcher.handle();
        let run = tokio::spawn(async move {
            let result = dispatcher.run().await;
            (dispatcher, result)
        });

        while !feed.is_connected() {
            tokio::task::yield_now().await;
        }
        Self {
            feed,
            handle,
            events,
            run,
        }
    }

    pub async fn publish(&self, content: &str) -> DeliveryTag {
        self.feed.publish("jobs", content).await.unwrap()
    }

    pub async fn snapshot(&self) -> DispatcherSnapshot {
        self.handle.snapshot().await.unwrap()
    }

    /// Poll snapshots until `done` holds
    pub async fn wait_until(&self, done: impl Fn(&DispatcherSnapshot) -> bool) -> DispatcherSnapshot {
        let poll = async {
            loop {
                let snapshot = self.snapshot().await;
                if done(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(EVENT_TIMEOUT, poll)
            .await
            .expect("dispatcher never reached the expected state")
    }

    /// Next event matching `wanted`, skipping the rest
    pub async fn wait_for(&mut self, wanted: impl Fn(&DispatcherEvent) -> bool) -> DispatcherEvent {
        let events = &mut self.events;
        let next = async {
            loop {
                let event = events.recv().await.expect("event bus closed");
                if wanted(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(EVENT_TIMEOUT, next)
            .await
            .expect("expected dispatcher event never arrived")
    }

    /// Events already emitted and not yet consumed
    pub fn drain_events(&mut self) -> Vec<DispatcherEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn wait_processed(&mut self, count: usize) {
        for _ in 0..count {
            self.wait_for(|e| matches!(e, DispatcherEvent::Processed { .. }))
                .await;
        }
    }

    /// Ask for a graceful shutdown and wait for `run` to return
    pub async fn shutdown(self) -> (Dispatcher, warren_core::Result<()>) {
        self.handle.shutdown().unwrap();
        self.join().await
    }

    pub async fn join(self) -> (Dispatcher, warren_core::Result<()>) {
        tokio::time::timeout(EVENT_TIMEOUT, self.run)
            .await
            .expect("dispatcher did not stop")
            .expect("dispatcher task panicked")
    }
}
