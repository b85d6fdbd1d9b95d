// Domain Layer - Protocol types and entities

pub mod error;
pub mod message;
pub mod stats;
pub mod worker;

// Re-exports
pub use error::DomainError;
pub use message::{
    AmqpMeta, ControlMessage, CustomMessage, EnvelopeMeta, Frame, Headers, MessageType,
    QueueEnvelope, QueueMessage,
};
pub use stats::DispatcherStats;
pub use worker::{DispatcherState, ExitMode, Pid, WorkerId, WorkerState};
