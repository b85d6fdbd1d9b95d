// Dispatcher
//
// Single-owner event loop. Feed deliveries, worker frames, handle commands
// and timers are all processed on the task that calls `run`, so the
// scheduler, worker table and cache need no locking.

pub mod config;
pub mod events;
pub mod handle;
mod table;


pub use config::{DeliveryGuarantee, DispatcherConfig};
pub use events::{DispatcherErrorReason, DispatcherEvent};
pub use handle::{DispatcherHandle, DispatcherSnapshot};

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::constants::{
    DELIVERY_BUFFER_SIZE, LAST_MSG_RESEND_INTERVAL, REAP_INTERVAL, SHUTDOWN_POLL_INTERVAL,
};
use super::events::EventBus;
use super::scheduler::WorkerScheduler;
use crate::domain::{
    AmqpMeta, ControlMessage, CustomMessage, DispatcherState, DispatcherStats, Frame,
    MessageType, QueueEnvelope, WorkerId,
};
use crate::port::{
    Delivery, DeliveryTag, ExitedWorker, IdProvider, QueueFeed, TransportError, WorkerFrame,
    WorkerInbox, WorkerSupervisor,
};
use crate::{AppError, Result};
use handle::DispatcherCommand;
use table::WorkerTable;

/// Work waiting in the cache (or about to be dispatched)
#[derive(Debug, Clone)]
enum PendingMessage {
    /// `tag` is kept only when the ack is deferred until dispatch
    Queue {
        envelope: QueueEnvelope,
        tag: Option<DeliveryTag>,
    },
    Custom(CustomMessage),
}

impl PendingMessage {
    fn encode(&self) -> Result<Frame> {
        match self {
            PendingMessage::Queue { envelope, .. } => {
                Ok(Frame::new(MessageType::Queue.code(), envelope.encode()?))
            }
            PendingMessage::Custom(message) => Ok(message.clone().into_frame()),
        }
    }

    fn tag(&self) -> Option<DeliveryTag> {
        match self {
            PendingMessage::Queue { tag, .. } => *tag,
            PendingMessage::Custom(_) => None,
        }
    }

    fn failure_reason(&self) -> DispatcherErrorReason {
        match self {
            PendingMessage::Queue { .. } => DispatcherErrorReason::DispatchingMessage,
            PendingMessage::Custom(_) => DispatcherErrorReason::DispatchingCustomMessage,
        }
    }
}

enum Wakeup {
    Delivery(Delivery),
    FeedClosed,
    Frame(WorkerFrame),
    Command(DispatcherCommand),
    Reap,
    Patrol,
}

/// Master side of the worker pool
pub struct Dispatcher {
    config: DispatcherConfig,
    feed: Arc<dyn QueueFeed>,
    supervisor: Box<dyn WorkerSupervisor>,
    id_provider: Arc<dyn IdProvider>,

    state: DispatcherState,
    scheduler: WorkerScheduler,
    workers: WorkerTable,
    cache: VecDeque<PendingMessage>,
    stats: DispatcherStats,
    feed_paused: bool,
    // Set once workers have been told to quit; no further dispatching
    quitting: bool,
    shutdown_error: Option<AppError>,

    events: EventBus<DispatcherEvent>,
    inbox_tx: WorkerInbox,
    inbox_rx: mpsc::UnboundedReceiver<WorkerFrame>,
    command_tx: mpsc::UnboundedSender<DispatcherCommand>,
    command_rx: mpsc::UnboundedReceiver<DispatcherCommand>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        feed: Arc<dyn QueueFeed>,
        supervisor: Box<dyn WorkerSupervisor>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            scheduler: WorkerScheduler::new(config.worker_capacity),
            config,
            feed,
            supervisor,
            id_provider,
            state: DispatcherState::Shutdown,
            workers: WorkerTable::default(),
            cache: VecDeque::new(),
            stats: DispatcherStats::default(),
            feed_paused: false,
            quitting: false,
            shutdown_error: None,
            events: EventBus::new(),
            inbox_tx,
            inbox_rx,
            command_tx,
            command_rx,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DispatcherEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle::new(self.command_tx.clone())
    }

    /// Run until shutdown completes
    ///
    /// Returns the error passed to `shutdown`, if any, once all workers are gone
    /// (or the shutdown timeout elapsed).
    pub async fn run(&mut self) -> Result<()> {
        if self.state != DispatcherState::Shutdown {
            warn!(state = %self.state, "Dispatcher is already running");
            return Ok(());
        }
        self.workers.clear();
        self.scheduler = WorkerScheduler::new(self.config.worker_capacity);
        self.shutdown_error = None;
        self.feed_paused = false;
        self.quitting = false;
        self.state = DispatcherState::Running;
        info!(
            max_workers = ?self.config.max_workers,
            cache_limit = self.config.cache_limit,
            worker_capacity = self.config.worker_capacity,
            "Dispatcher started"
        );
        self.events.emit(DispatcherEvent::Start);

        let (sink, mut deliveries) = mpsc::channel(DELIVERY_BUFFER_SIZE);
        if let Err(e) = self.feed.connect(sink).await {
            error!(error = %e, "Failed to connect queue feed");
            self.shutdown(Some(e.into())).await;
        }

        let mut reap_tick = time::interval(REAP_INTERVAL);
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let patrol_period = self.config.patrol_period;
        let mut patrol_tick = time::interval_at(Instant::now() + patrol_period, patrol_period);
        patrol_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        while self.state == DispatcherState::Running {
            let wakeup = tokio::select! {
                delivery = deliveries.recv(), if feed_open => match delivery {
                    Some(delivery) => Wakeup::Delivery(delivery),
                    None => Wakeup::FeedClosed,
                },
                Some(frame) = self.inbox_rx.recv() => Wakeup::Frame(frame),
                Some(command) = self.command_rx.recv() => Wakeup::Command(command),
                _ = reap_tick.tick() => Wakeup::Reap,
                _ = patrol_tick.tick() => Wakeup::Patrol,
            };

            match wakeup {
                Wakeup::Delivery(delivery) => self.on_consume(delivery).await,
                Wakeup::FeedClosed => {
                    warn!("Queue feed closed its delivery channel");
                    feed_open = false;
                }
                Wakeup::Frame(WorkerFrame { worker_id, frame }) => {
                    self.on_message(worker_id, frame).await
                }
                Wakeup::Command(command) => self.handle_command(command).await,
                Wakeup::Reap => {}
                Wakeup::Patrol => {
                    debug!(
                        workers = self.workers.len(),
                        cached = self.cache.len(),
                        "Dispatcher patrol"
                    );
                    self.events.emit(DispatcherEvent::Patrolling);
                }
            }
            self.reap_workers().await;
        }

        let undelivered = deliveries.len();
        if undelivered > 0 {
            warn!(undelivered, "Discarding deliveries received after shutdown");
        }
        drop(deliveries);

        self.flush_cached().await;
        self.inform_workers_quit().await;

        self.state = DispatcherState::Shutdown;
        info!(
            consumed = self.stats.consumed,
            processed = self.stats.processed,
            peak_workers = self.stats.peak_num_workers,
            peak_cached = self.stats.peak_num_cached,
            "Dispatcher stopped"
        );
        self.events.emit(DispatcherEvent::Shutdown {
            stats: self.stats.clone(),
        });

        match self.shutdown_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop consuming and start draining; only effective while running
    pub async fn shutdown(&mut self, error: Option<AppError>) {
        if self.state != DispatcherState::Running {
            return;
        }
        match error {
            Some(e) => {
                error!(error = %e, "Dispatcher shutting down on error");
                if self.shutdown_error.is_none() {
                    self.shutdown_error = Some(e);
                }
            }
            None => info!("Dispatcher shutting down"),
        }
        if let Err(e) = self.feed.disconnect().await {
            warn!(error = %e, "Failed to disconnect queue feed");
        }
        self.state = DispatcherState::Flushing;
    }

    /// Handle one delivery from the feed
    pub async fn on_consume(&mut self, delivery: Delivery) {
        let was_saturated = self.limit_reached();
        let Delivery {
            queue,
            tag,
            message,
        } = delivery;

        self.stats.observe_message_length(message.content.len());
        let envelope = QueueEnvelope::new(
            self.id_provider.generate_id(),
            AmqpMeta {
                exchange: message.exchange,
                queue,
                routing_key: message.routing_key,
                headers: message.headers,
            },
            message.content,
        );
        let defer_ack = self.config.delivery_guarantee == DeliveryGuarantee::AtLeastOnce;
        let pending = PendingMessage::Queue {
            envelope,
            tag: defer_ack.then_some(tag),
        };

        self.enqueue(pending, was_saturated).await;
        if !defer_ack {
            self.ack(tag).await;
        }
        self.apply_backpressure(was_saturated).await;
    }

    /// Send an application message to a worker, caching it while saturated
    ///
    /// Refused once workers have been told to quit.
    pub async fn dispatch_custom_message(&mut self, message: CustomMessage) {
        if self.quitting || self.state == DispatcherState::Shutdown {
            self.emit_error(
                DispatcherErrorReason::DispatchingCustomMessage,
                AppError::InvalidState(format!(
                    "custom message {} refused, workers are quitting",
                    message.kind()
                )),
            );
            return;
        }
        let was_saturated = self.limit_reached();
        self.enqueue(PendingMessage::Custom(message), was_saturated)
            .await;
        self.apply_backpressure(was_saturated).await;
    }

    /// Handle one frame from a worker
    pub async fn on_message(&mut self, worker_id: WorkerId, frame: Frame) {
        match frame.message_type() {
            Some(MessageType::Processed) => {
                self.stats.processed += 1;
                self.complete(&worker_id);
                self.events.emit(DispatcherEvent::Processed { worker_id });
                self.try_dispatch_cached().await;
            }
            Some(MessageType::CustomMessageProcessed) => {
                self.complete(&worker_id);
                self.events
                    .emit(DispatcherEvent::CustomMessageProcessed { worker_id });
                self.try_dispatch_cached().await;
            }
            Some(MessageType::StopSending) => {
                debug!(worker_id = %worker_id, "Worker asked to stop sending");
                self.scheduler.retire(&worker_id);
                if let Err(e) = self.send_control(&worker_id, &ControlMessage::LastMsg) {
                    self.emit_error(DispatcherErrorReason::SendingMessage, e);
                }
            }
            Some(MessageType::IQuit) => {
                debug!(worker_id = %worker_id, "Worker is quitting");
                if let Err(e) = self.send_control(&worker_id, &ControlMessage::RogerThat) {
                    self.emit_error(DispatcherErrorReason::SendingMessage, e);
                }
            }
            Some(MessageType::KillMe) => self.kill_worker(&worker_id),
            _ => self.events.emit(DispatcherEvent::Message { worker_id, frame }),
        }
    }

    pub fn set_max_workers(&mut self, n: i64) -> bool {
        self.config.set_max_workers(n)
    }

    pub fn set_cache_limit(&mut self, n: i64) -> bool {
        self.config.set_cache_limit(n)
    }

    /// Takes effect on the next `run`
    pub fn set_patrol_period(&mut self, seconds: u64) -> bool {
        self.config.set_patrol_period(seconds)
    }

    pub fn set_shutdown_timeout(&mut self, seconds: i64) -> bool {
        self.config.set_shutdown_timeout(seconds)
    }

    pub fn set_worker_capacity(&mut self, capacity: usize) -> bool {
        if !self.config.set_worker_capacity(capacity) {
            return false;
        }
        self.scheduler.change_levels(capacity);
        true
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    pub fn clear_stat(&mut self) {
        self.stats.clear();
    }

    pub fn count_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn count_schedulable(&self) -> usize {
        self.scheduler.count_schedulable()
    }

    pub fn num_cached(&self) -> usize {
        self.cache.len()
    }

    /// At the worker cap and every worker is busy or retired
    pub fn limit_reached(&self) -> bool {
        match self.config.max_workers {
            None => false,
            Some(max) => self.workers.len() >= max && self.scheduler.count_schedulable() == 0,
        }
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            state: self.state,
            stats: self.stats.clone(),
            workers: self.workers.len(),
            schedulable: self.scheduler.count_schedulable(),
            retired: self.scheduler.count_retired(),
            cached: self.cache.len(),
            limit_reached: self.limit_reached(),
        }
    }

    async fn handle_command(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::Shutdown(error) => self.shutdown(error).await,
            DispatcherCommand::CustomMessage(message) => {
                self.dispatch_custom_message(message).await
            }
            DispatcherCommand::ClearStat => self.clear_stat(),
            DispatcherCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // Cache while saturated (or while older messages are still cached), dispatch otherwise
    async fn enqueue(&mut self, pending: PendingMessage, was_saturated: bool) {
        if was_saturated || !self.cache.is_empty() {
            self.cache.push_back(pending);
            self.stats.observe_cached(self.cache.len());
            if !was_saturated {
                self.drain_cached().await;
            }
            return;
        }
        match self.dispatch(&pending) {
            Ok(_) => self.settle_dispatched(&pending).await,
            Err(e) => {
                self.emit_error(pending.failure_reason(), e);
                if let Some(tag) = pending.tag() {
                    self.reject(tag).await;
                }
            }
        }
    }

    async fn apply_backpressure(&mut self, was_saturated: bool) {
        if !self.limit_reached() {
            return;
        }
        if !was_saturated {
            info!(workers = self.workers.len(), "Worker limit reached");
            self.events.emit(DispatcherEvent::LimitReached);
        }
        if self.state == DispatcherState::Running
            && !self.feed_paused
            && self.cache.len() >= self.config.cache_limit
        {
            info!(cached = self.cache.len(), "Pausing queue feed");
            self.feed_paused = true;
            if let Err(e) = self.feed.pause().await {
                error!(error = %e, "Failed to pause queue feed");
                self.shutdown(Some(e.into())).await;
            }
        }
    }

    /// Dispatch the oldest cached message if a worker is available
    ///
    /// With an empty cache this resumes a paused feed instead. Returns true
    /// when a cached message was dispatched.
    async fn try_dispatch_cached(&mut self) -> bool {
        if self.quitting || self.limit_reached() {
            return false;
        }
        let Some(pending) = self.cache.pop_front() else {
            if self.feed_paused
                && self.state == DispatcherState::Running
                && self.feed.is_connected()
            {
                info!("Resuming queue feed");
                self.feed_paused = false;
                if let Err(e) = self.feed.resume().await {
                    error!(error = %e, "Failed to resume queue feed");
                    self.shutdown(Some(e.into())).await;
                }
            }
            return false;
        };
        match self.dispatch(&pending) {
            Ok(_) => {
                self.settle_dispatched(&pending).await;
                true
            }
            Err(e) => {
                self.emit_error(pending.failure_reason(), e);
                self.cache.push_front(pending);
                false
            }
        }
    }

    async fn drain_cached(&mut self) {
        while self.try_dispatch_cached().await {}
    }

    fn dispatch(&mut self, pending: &PendingMessage) -> Result<WorkerId> {
        let frame = pending.encode()?;
        let worker_id = self.schedule_worker()?;

        let sent = match self.workers.get(&worker_id) {
            Some(entry) => entry.link.send(frame),
            None => Err(TransportError::Closed(worker_id.clone())),
        };
        if let Err(e) = sent {
            self.scheduler.release(&worker_id);
            return Err(e.into());
        }
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            entry.sent += 1;
        }

        if let PendingMessage::Queue { envelope, .. } = pending {
            self.stats.consumed += 1;
            debug!(
                worker_id = %worker_id,
                message_id = %envelope.message_id,
                "Dispatched queue message"
            );
            self.events.emit(DispatcherEvent::Consumed {
                worker_id: worker_id.clone(),
                message_id: envelope.message_id.clone(),
            });
        }
        Ok(worker_id)
    }

    fn schedule_worker(&mut self) -> Result<WorkerId> {
        // every worker has already been sent LAST_MSG
        if self.quitting {
            return Err(AppError::InvalidState(
                "no workers scheduled while quitting".to_string(),
            ));
        }
        while let Some(worker_id) = self.scheduler.allocate() {
            if self
                .workers
                .get(&worker_id)
                .is_some_and(|entry| entry.link.is_writable())
            {
                return Ok(worker_id);
            }
            debug!(worker_id = %worker_id, "Skipping worker with a closed channel");
        }

        if let Some(max) = self.config.max_workers {
            if self.workers.len() >= max {
                return Err(AppError::InvalidState(format!(
                    "worker limit of {max} reached"
                )));
            }
        }

        let worker_id = WorkerId::new(self.id_provider.generate_id());
        let spawned = match self.supervisor.spawn(&worker_id, self.inbox_tx.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(error = %e, "Failed to create worker");
                self.emit_error(DispatcherErrorReason::CreatingWorker, e.clone().into());
                return Err(e.into());
            }
        };

        self.scheduler.add(&worker_id, true);
        self.workers
            .insert(worker_id.clone(), spawned.pid, spawned.link);
        self.stats.observe_workers(self.workers.len());
        info!(
            worker_id = %worker_id,
            pid = spawned.pid,
            workers = self.workers.len(),
            "Created worker"
        );
        Ok(worker_id)
    }

    fn complete(&mut self, worker_id: &WorkerId) {
        self.scheduler.release(worker_id);
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.processed += 1;
        }
    }

    fn send_control(&self, worker_id: &WorkerId, message: &ControlMessage) -> Result<()> {
        let entry = self
            .workers
            .get(worker_id)
            .ok_or_else(|| TransportError::Closed(worker_id.clone()))?;
        entry.link.send(message.encode()?)?;
        Ok(())
    }

    fn kill_worker(&mut self, worker_id: &WorkerId) {
        let Some(pid) = self.workers.get(worker_id).map(|entry| entry.pid) else {
            warn!(worker_id = %worker_id, "Kill requested by unknown worker");
            return;
        };
        if !self.supervisor.is_alive(pid) {
            debug!(worker_id = %worker_id, pid, "Worker already gone, waiting for reap");
            return;
        }
        info!(worker_id = %worker_id, pid, "Killing worker");
        if let Err(e) = self.supervisor.terminate(pid, true) {
            warn!(worker_id = %worker_id, pid, error = %e, "Failed to kill worker");
        }
    }

    async fn reap_workers(&mut self) {
        for exited in self.supervisor.reap() {
            self.on_worker_exit(exited).await;
        }
    }

    async fn on_worker_exit(&mut self, exited: ExitedWorker) {
        let ExitedWorker { worker_id, pid } = exited;
        self.scheduler.remove(&worker_id);
        if let Some(entry) = self.workers.remove(&worker_id) {
            if entry.sent > entry.processed {
                warn!(
                    worker_id = %worker_id,
                    unfinished = entry.sent - entry.processed,
                    "Worker exited with unfinished messages"
                );
            }
        }
        info!(
            worker_id = %worker_id,
            pid,
            remaining = self.workers.len(),
            "Worker exited"
        );
        self.events.emit(DispatcherEvent::WorkerExit {
            worker_id,
            pid,
            remaining: self.workers.len(),
        });
        if self.state == DispatcherState::Running {
            self.drain_cached().await;
        }
    }

    // Wait for one frame or command (or the deadline), then reap
    async fn pump_until(&mut self, deadline: Instant) {
        let wakeup = tokio::select! {
            Some(frame) = self.inbox_rx.recv() => Some(Wakeup::Frame(frame)),
            Some(command) = self.command_rx.recv() => Some(Wakeup::Command(command)),
            _ = time::sleep_until(deadline) => None,
        };
        match wakeup {
            Some(Wakeup::Frame(WorkerFrame { worker_id, frame })) => {
                self.on_message(worker_id, frame).await
            }
            Some(Wakeup::Command(command)) => self.handle_command(command).await,
            _ => {}
        }
        self.reap_workers().await;
    }

    /// Hand every cached message to a worker before telling workers to quit
    ///
    /// Gives up once no progress was made for `shutdown_timeout`.
    async fn flush_cached(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        info!(cached = self.cache.len(), "Flushing cached messages");
        let timeout = self.config.shutdown_timeout;
        let mut stall_deadline = Instant::now() + timeout;
        let mut last_len = self.cache.len();

        loop {
            self.drain_cached().await;
            if self.cache.is_empty() {
                break;
            }
            let now = Instant::now();
            if self.cache.len() < last_len {
                last_len = self.cache.len();
                stall_deadline = now + timeout;
            } else if now >= stall_deadline {
                warn!(
                    remaining = self.cache.len(),
                    "Flushing stalled, giving up on cached messages"
                );
                break;
            }
            self.pump_until((now + SHUTDOWN_POLL_INTERVAL).min(stall_deadline))
                .await;
        }
    }

    /// Send LAST_MSG to every worker and wait for them to exit
    async fn inform_workers_quit(&mut self) {
        self.quitting = true;
        self.discard_cached().await;

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut next_notice = Instant::now();
        while !self.workers.is_empty() {
            let now = Instant::now();
            if now >= next_notice {
                for worker_id in self.workers.ids() {
                    if let Err(e) = self.send_control(&worker_id, &ControlMessage::LastMsg) {
                        self.emit_error(DispatcherErrorReason::ShuttingDown, e);
                    }
                }
                next_notice = now + LAST_MSG_RESEND_INTERVAL;
            }
            if now >= deadline {
                break;
            }
            self.pump_until((now + SHUTDOWN_POLL_INTERVAL).min(deadline).min(next_notice))
                .await;
        }

        if !self.workers.is_empty() {
            warn!(
                remaining = self.workers.len(),
                "Shutdown timeout elapsed, killing remaining workers"
            );
            for worker_id in self.workers.ids() {
                self.kill_worker(&worker_id);
            }
            self.reap_workers().await;
        }
    }

    async fn discard_cached(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        warn!(dropped = self.cache.len(), "Dropping undispatched cached messages");
        while let Some(pending) = self.cache.pop_front() {
            if let Some(tag) = pending.tag() {
                self.reject(tag).await;
            }
        }
    }

    async fn settle_dispatched(&mut self, pending: &PendingMessage) {
        if let Some(tag) = pending.tag() {
            self.ack(tag).await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) {
        if let Err(e) = self.feed.ack(tag).await {
            warn!(tag, error = %e, "Failed to ack delivery");
        }
    }

    async fn reject(&self, tag: DeliveryTag) {
        if let Err(e) = self.feed.reject(tag, true).await {
            warn!(tag, error = %e, "Failed to requeue delivery");
        }
    }

    fn emit_error(&mut self, reason: DispatcherErrorReason, cause: AppError) {
        warn!(reason = %reason, error = %cause, "Dispatcher error");
        self.events.emit(DispatcherEvent::Error {
            reason,
            cause: Arc::new(cause),
        });
    }
}
