// Application Layer - Dispatcher, worker and scheduling

pub mod constants;
pub mod dispatcher;
pub mod events;
pub mod scheduler;
pub mod worker;

// Re-exports
pub use dispatcher::{
    DeliveryGuarantee, Dispatcher, DispatcherConfig, DispatcherErrorReason, DispatcherEvent,
    DispatcherHandle, DispatcherSnapshot,
};
pub use events::EventBus;
pub use scheduler::WorkerScheduler;
pub use worker::{
    custom_handler_fn, message_handler_fn, shutdown_channel, CustomMessageHandler,
    DelayCondition, MessageHandler, ShutdownSender, ShutdownToken, Worker, WorkerConfig,
    WorkerContext, WorkerErrorReason, WorkerEvent, WorkerFactory,
};
