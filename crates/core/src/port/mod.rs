// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod queue_feed;
pub mod supervisor;
pub mod transport;

// Re-exports
pub use id_provider::{IdProvider, SequentialIdProvider, UuidProvider};
pub use queue_feed::{Delivery, DeliverySink, DeliveryTag, FeedError, InboundMessage, QueueFeed};
pub use supervisor::{ExitedWorker, SpawnError, SpawnedWorker, TerminateError, WorkerSupervisor};
pub use transport::{
    worker_channel, TransportError, WorkerEndpoint, WorkerFrame, WorkerInbox, WorkerLink,
    WorkerOutbox,
};
