// Dispatch constants (No magic values)
use std::time::Duration;

/// Concurrent messages a single worker accepts by default
pub const DEFAULT_WORKER_CAPACITY: usize = 1;

/// Dispatcher patrol period (5 minutes)
pub const DEFAULT_DISPATCHER_PATROL_PERIOD: Duration = Duration::from_secs(300);

/// How long shutdown waits for workers to quit (30 seconds)
/// Also bounds how long flushing may stall without progress
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker patrol period (1 minute)
pub const DEFAULT_WORKER_PATROL_PERIOD: Duration = Duration::from_secs(60);

/// How often finished worker processes are collected (100ms)
pub const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Poll step while flushing the cache or waiting for workers to quit (500ms)
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// LAST_MSG is re-sent to lingering workers at this interval (10 seconds)
pub const LAST_MSG_RESEND_INTERVAL: Duration = Duration::from_secs(10);

/// Deliveries buffered between the feed and the dispatcher loop
pub const DELIVERY_BUFFER_SIZE: usize = 256;
