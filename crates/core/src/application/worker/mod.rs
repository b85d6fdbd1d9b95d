// Worker - message processing loop
//
// Receives frames from the dispatcher, runs the registered handlers and
// answers with the control protocol. One message is handled at a time.

pub mod config;
pub mod context;
pub mod events;
pub mod factory;
pub mod handler;
mod panic_guard;
mod shutdown;


pub use config::WorkerConfig;
pub use context::WorkerContext;
pub use events::{WorkerErrorReason, WorkerEvent};
pub use factory::WorkerFactory;
pub use handler::{
    custom_handler_fn, message_handler_fn, CustomMessageHandler, DelayCondition,
    FnCustomHandler, FnMessageHandler, MessageHandler,
};
pub use panic_guard::{execute_guarded, execute_guarded_async, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::events::EventBus;
use crate::domain::{
    CustomMessage, ExitMode, Frame, MessageType, QueueEnvelope, QueueMessage, WorkerId,
    WorkerState,
};
use crate::port::{TransportError, WorkerEndpoint, WorkerOutbox};
use crate::{AppError, Result};

enum Wakeup {
    Frame(Frame),
    Disconnected,
    DeferredDue,
    IdleTimeout,
    Patrol,
    ShutdownRequested,
}

/// Worker side of the control protocol
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    state: WorkerState,
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbox: WorkerOutbox,

    received: u64,
    // LAST_MSG seen: nothing more will be sent
    no_more: bool,
    idle_deadline: Option<Instant>,
    // Keyed by due time, then arrival order
    deferred: BTreeMap<(Instant, u64), QueueMessage>,
    deferred_seq: u64,

    message_handler: Option<Arc<dyn MessageHandler>>,
    custom_handler: Option<Arc<dyn CustomMessageHandler>>,
    delay_condition: Option<DelayCondition>,
    shutdown_token: Option<ShutdownToken>,
    events: EventBus<WorkerEvent>,
}

impl Worker {
    pub fn new(id: WorkerId, endpoint: WorkerEndpoint, config: WorkerConfig) -> Self {
        Self {
            id,
            config,
            state: WorkerState::Shutdown,
            inbound: endpoint.inbound,
            outbox: endpoint.outbox,
            received: 0,
            no_more: false,
            idle_deadline: None,
            deferred: BTreeMap::new(),
            deferred_seq: 0,
            message_handler: None,
            custom_handler: None,
            delay_condition: None,
            shutdown_token: None,
            events: EventBus::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Queue messages received so far
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.message_handler = Some(handler);
    }

    pub fn set_custom_message_handler(&mut self, handler: Arc<dyn CustomMessageHandler>) {
        self.custom_handler = Some(handler);
    }

    pub fn set_delay_condition(&mut self, condition: DelayCondition) {
        self.delay_condition = Some(condition);
    }

    /// Shut down voluntarily once `token` fires
    pub fn set_shutdown_token(&mut self, token: ShutdownToken) {
        self.shutdown_token = Some(token);
    }

    pub fn set_idle_shutdown(&mut self, seconds: u64) -> bool {
        self.config.set_idle_shutdown(seconds)
    }

    /// Disarm idle shutdown, including a deadline already running
    pub fn no_idle_shutdown(&mut self) {
        self.config.clear_idle_shutdown();
        self.idle_deadline = None;
    }

    pub fn set_exit_mode(&mut self, mode: ExitMode) {
        self.config.exit_mode = mode;
    }

    pub fn set_patrol_period(&mut self, seconds: u64) -> bool {
        self.config.set_patrol_period(seconds)
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn attach(&mut self, tx: mpsc::UnboundedSender<WorkerEvent>) {
        self.events.attach(tx);
    }

    /// Stop taking work; STOP_SENDING goes out with the next acknowledgement
    pub fn shutdown(&mut self) {
        if self.state == WorkerState::Running {
            info!(worker_id = %self.id, "Worker shutting down");
            self.state = WorkerState::Shutting;
        }
    }

    pub fn send_custom_message(&self, message: CustomMessage) -> Result<()> {
        self.outbox.send(message.into_frame())?;
        Ok(())
    }

    /// Run until the dispatcher acknowledges the quit or goes away
    pub async fn run(&mut self) -> Result<()> {
        if self.state != WorkerState::Shutdown {
            warn!(worker_id = %self.id, state = %self.state, "Worker is already running");
            return Ok(());
        }
        self.state = WorkerState::Running;
        info!(worker_id = %self.id, "Worker started");
        self.events.emit(WorkerEvent::Start {
            worker_id: self.id.clone(),
        });
        self.arm_idle_timer();

        let patrol_period = self.config.patrol_period;
        let mut patrol_tick = time::interval_at(Instant::now() + patrol_period, patrol_period);
        patrol_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state != WorkerState::Shutdown {
            let deferred_at = self.deferred.keys().next().map(|(at, _)| *at);
            // Idle shutdown is suspended while deferred work is outstanding
            let idle_at = self.idle_deadline.filter(|_| self.deferred.is_empty());

            let wakeup = tokio::select! {
                frame = self.inbound.recv() => match frame {
                    Some(frame) => Wakeup::Frame(frame),
                    None => Wakeup::Disconnected,
                },
                _ = sleep_until_some(deferred_at) => Wakeup::DeferredDue,
                _ = sleep_until_some(idle_at) => Wakeup::IdleTimeout,
                _ = patrol_tick.tick() => Wakeup::Patrol,
                _ = wait_for_token(self.shutdown_token.as_mut()) => Wakeup::ShutdownRequested,
            };

            let outcome = match wakeup {
                Wakeup::Frame(frame) => self.on_frame(frame).await,
                Wakeup::Disconnected => {
                    info!(worker_id = %self.id, "Dispatcher channel closed");
                    self.events.emit(WorkerEvent::Disconnected {
                        worker_id: self.id.clone(),
                    });
                    self.state = WorkerState::Shutdown;
                    Ok(())
                }
                Wakeup::DeferredDue => self.run_due_deferred().await,
                Wakeup::IdleTimeout => self.on_idle_timeout(),
                Wakeup::Patrol => {
                    debug!(
                        worker_id = %self.id,
                        received = self.received,
                        deferred = self.deferred.len(),
                        "Worker patrolling"
                    );
                    self.events.emit(WorkerEvent::Patrolling {
                        worker_id: self.id.clone(),
                    });
                    Ok(())
                }
                Wakeup::ShutdownRequested => self.on_shutdown_requested(),
            };

            if let Err(e) = outcome {
                error!(worker_id = %self.id, error = %e, "Lost channel to dispatcher");
                self.state = WorkerState::Shutdown;
                self.emit_error(WorkerErrorReason::Unrecoverable, e.clone().into());
                return Err(e.into());
            }
        }

        if !self.deferred.is_empty() {
            warn!(
                worker_id = %self.id,
                dropped = self.deferred.len(),
                "Worker stopped with deferred messages pending"
            );
        }
        info!(worker_id = %self.id, received = self.received, "Worker stopped");
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> std::result::Result<(), TransportError> {
        self.idle_deadline = None;
        match frame.message_type() {
            Some(MessageType::Queue) => self.on_queue_frame(frame).await?,
            Some(MessageType::LastMsg) => {
                debug!(worker_id = %self.id, "Dispatcher has no more messages");
                self.no_more = true;
            }
            Some(MessageType::RogerThat) => {
                info!(worker_id = %self.id, "Dispatcher acknowledged quit");
                self.state = WorkerState::Shutdown;
                return Ok(());
            }
            Some(other) => {
                warn!(worker_id = %self.id, message_type = %other, "Ignoring unexpected control message");
            }
            None => self.on_custom_frame(frame).await?,
        }
        self.arm_idle_timer();
        self.request_exit_if_done()
    }

    async fn on_queue_frame(&mut self, frame: Frame) -> std::result::Result<(), TransportError> {
        self.received += 1;
        if self.message_handler.is_none() {
            return self.acknowledge(MessageType::Processed);
        }

        let message = match QueueEnvelope::decode(&frame.payload) {
            Ok(envelope) => envelope.into_queue_message(),
            Err(e) => {
                self.emit_error(WorkerErrorReason::DecodingMessage, e.into());
                return self.acknowledge(MessageType::Processed);
            }
        };

        if let Some(delay) = self.delay_for(&message) {
            debug!(
                worker_id = %self.id,
                message_id = %message.message_id,
                delay_ms = delay.as_millis() as u64,
                "Deferring message"
            );
            let seq = self.deferred_seq;
            self.deferred_seq += 1;
            self.deferred.insert((Instant::now() + delay, seq), message);
            return Ok(());
        }

        self.process(message).await;
        self.acknowledge(MessageType::Processed)
    }

    async fn on_custom_frame(&mut self, frame: Frame) -> std::result::Result<(), TransportError> {
        let message = match CustomMessage::try_from(frame) {
            Ok(message) => message,
            Err(e) => {
                self.emit_error(WorkerErrorReason::DecodingMessage, e.into());
                return self.acknowledge(MessageType::CustomMessageProcessed);
            }
        };
        self.events.emit(WorkerEvent::Message {
            worker_id: self.id.clone(),
            message: message.clone(),
        });

        if let Some(handler) = self.custom_handler.clone() {
            let mut ctx =
                WorkerContext::new(&self.id, self.received, &mut self.state, &self.outbox);
            let outcome = guard(execute_guarded_async(handler.handle(message, &mut ctx)).await);
            if let Err(e) = outcome {
                self.emit_error(WorkerErrorReason::ProcessingCustomMessage, e);
            }
        }
        self.acknowledge(MessageType::CustomMessageProcessed)
    }

    async fn process(&mut self, message: QueueMessage) {
        let Some(handler) = self.message_handler.clone() else {
            return;
        };
        let message_id = message.message_id.clone();
        let mut ctx = WorkerContext::new(&self.id, self.received, &mut self.state, &self.outbox);
        let outcome = guard(execute_guarded_async(handler.handle(message, &mut ctx)).await);
        if let Err(e) = outcome {
            warn!(worker_id = %self.id, message_id = %message_id, error = %e, "Message handler failed");
            self.emit_error(WorkerErrorReason::ProcessingMessage, e);
        }
    }

    async fn run_due_deferred(&mut self) -> std::result::Result<(), TransportError> {
        let now = Instant::now();
        while let Some(entry) = self.deferred.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let message = entry.remove();
            self.process(message).await;
            self.acknowledge(MessageType::Processed)?;
        }
        self.idle_deadline = None;
        self.arm_idle_timer();
        self.request_exit_if_done()
    }

    fn on_idle_timeout(&mut self) -> std::result::Result<(), TransportError> {
        self.idle_deadline = None;
        info!(worker_id = %self.id, "Worker idle, asking dispatcher to stop sending");
        self.send(MessageType::StopSending)
    }

    fn on_shutdown_requested(&mut self) -> std::result::Result<(), TransportError> {
        // Token is single-use; a dropped sender just stops watching
        let Some(token) = self.shutdown_token.take() else {
            return Ok(());
        };
        if !token.is_shutdown() {
            return Ok(());
        }
        self.shutdown();
        if self.state == WorkerState::Shutting {
            self.send(MessageType::StopSending)?;
        }
        Ok(())
    }

    /// Reply to a handled message; a shutting worker also asks to be retired
    fn acknowledge(&self, kind: MessageType) -> std::result::Result<(), TransportError> {
        self.send(kind)?;
        if self.state == WorkerState::Shutting {
            self.send(MessageType::StopSending)?;
        }
        Ok(())
    }

    fn request_exit_if_done(&self) -> std::result::Result<(), TransportError> {
        if !self.no_more || !self.deferred.is_empty() || self.state == WorkerState::Shutdown {
            return Ok(());
        }
        match self.config.exit_mode {
            ExitMode::Active => self.send(MessageType::IQuit),
            ExitMode::Passive => self.send(MessageType::KillMe),
        }
    }

    fn arm_idle_timer(&mut self) {
        if self.idle_deadline.is_none() {
            if let Some(idle) = self.config.idle_shutdown {
                self.idle_deadline = Some(Instant::now() + idle);
            }
        }
    }

    fn delay_for(&self, message: &QueueMessage) -> Option<Duration> {
        let condition = self.delay_condition.as_ref()?;
        match execute_guarded(|| condition(message)) {
            PanicGuardResult::Success(delay) => delay.filter(|d| !d.is_zero()),
            PanicGuardResult::Panicked(msg) => {
                warn!(worker_id = %self.id, panic_msg = %msg, "Delay condition panicked, handling now");
                None
            }
        }
    }

    fn send(&self, kind: MessageType) -> std::result::Result<(), TransportError> {
        self.outbox.send(Frame::signal(kind))
    }

    fn emit_error(&mut self, reason: WorkerErrorReason, cause: AppError) {
        self.events.emit(WorkerEvent::Error {
            worker_id: self.id.clone(),
            reason,
            cause: Arc::new(cause),
        });
    }
}

fn guard(outcome: PanicGuardResult<anyhow::Result<()>>) -> Result<()> {
    match outcome {
        PanicGuardResult::Success(Ok(())) => Ok(()),
        PanicGuardResult::Success(Err(e)) => Err(AppError::Handler(e)),
        PanicGuardResult::Panicked(msg) => Err(AppError::Panicked(msg)),
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_token(token: Option<&mut ShutdownToken>) {
    match token {
        Some(token) => token.wait().await,
        None => std::future::pending().await,
    }
}
