// Worker configuration

use std::time::Duration;

use crate::domain::ExitMode;

use crate::application::constants::DEFAULT_WORKER_PATROL_PERIOD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Ask the dispatcher to stop sending after this long without a message
    pub idle_shutdown: Option<Duration>,
    pub exit_mode: ExitMode,
    pub patrol_period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_shutdown: None,
            exit_mode: ExitMode::Active,
            patrol_period: DEFAULT_WORKER_PATROL_PERIOD,
        }
    }
}

impl WorkerConfig {
    /// Zero leaves the current value untouched
    pub fn set_idle_shutdown(&mut self, seconds: u64) -> bool {
        if seconds == 0 {
            return false;
        }
        self.idle_shutdown = Some(Duration::from_secs(seconds));
        true
    }

    pub fn clear_idle_shutdown(&mut self) {
        self.idle_shutdown = None;
    }

    pub fn set_patrol_period(&mut self, seconds: u64) -> bool {
        if seconds == 0 {
            return false;
        }
        self.patrol_period = Duration::from_secs(seconds);
        true
    }
}
