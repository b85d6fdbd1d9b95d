// Warren Infrastructure - System Adapters
// Implements: WorkerSupervisor (processes, tasks), QueueFeed (lines), MessageHandler (commands)

pub mod codec;
pub mod command_handler;
pub mod line_feed;
pub mod process_supervisor;
pub mod stdio;
pub mod task_supervisor;

pub use command_handler::{CommandHandler, CommandOutput};
pub use line_feed::LineFeed;
pub use process_supervisor::{ProcessSupervisor, WorkerCommand};
pub use stdio::{framed_endpoint, stdio_endpoint, FramedIo};
pub use task_supervisor::TaskSupervisor;
