// Worker Identity

use serde::{Deserialize, Serialize};

/// OS process id (or a synthetic id for in-process workers)
pub type Pid = u32;

/// Worker identifier, unique for the dispatcher's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Dispatcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatcherState {
    Running,
    Flushing,
    Shutdown,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatcherState::Running => write!(f, "RUNNING"),
            DispatcherState::Flushing => write!(f, "FLUSHING"),
            DispatcherState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Running,
    Shutting,
    Shutdown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Running => write!(f, "RUNNING"),
            WorkerState::Shutting => write!(f, "SHUTTING"),
            WorkerState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// How a worker asks to be ended once the dispatcher has nothing more for it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    /// Request a final acknowledgement (I_QUIT / ROGER_THAT) and stop on its own
    #[default]
    Active,
    /// Ask the dispatcher to kill the process (KILL_ME)
    Passive,
}
