// Worker Supervisor Port
// Creates workers, checks liveness, terminates and reaps them.

use crate::domain::{Pid, WorkerId};
use crate::port::transport::{WorkerInbox, WorkerLink};
use thiserror::Error;

/// Handle to a freshly spawned worker
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: Pid,
    pub link: WorkerLink,
}

/// Worker that has ended and was collected by `reap`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitedWorker {
    pub worker_id: WorkerId,
    pub pid: Pid,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("Spawn failed: {0}")]
    Failed(String),

    #[error("Worker stdio unavailable: {0}")]
    Stdio(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminateError {
    #[error("Unknown worker pid {0}")]
    UnknownPid(Pid),

    #[error("Signal delivery failed: {0}")]
    Signal(String),
}

/// Worker Supervisor trait
///
/// Implementations:
/// - ProcessSupervisor: one OS process per worker, frames over stdio
/// - TaskSupervisor: one tokio task per worker, frames over channels
pub trait WorkerSupervisor: Send + Sync {
    /// Start a worker whose outbound frames are delivered into `inbox`
    ///
    /// # Errors
    /// - SpawnError::Failed if the worker cannot be started
    fn spawn(&mut self, worker_id: &WorkerId, inbox: WorkerInbox)
        -> Result<SpawnedWorker, SpawnError>;

    fn is_alive(&self, pid: Pid) -> bool;

    /// Ask a worker to end; `forceful` kills without giving it a chance to clean up
    fn terminate(&mut self, pid: Pid, forceful: bool) -> Result<(), TerminateError>;

    /// Collect workers that have ended since the last call (non-blocking)
    fn reap(&mut self) -> Vec<ExitedWorker>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::Frame;
    use crate::port::transport::{worker_channel, WorkerEndpoint};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    struct MockWorker {
        worker_id: WorkerId,
        endpoint: Option<WorkerEndpoint>,
    }

    #[derive(Default)]
    struct Inner {
        next_pid: Pid,
        fail_spawns: bool,
        workers: BTreeMap<Pid, MockWorker>,
        exited: Vec<ExitedWorker>,
        terminated: Vec<(Pid, bool)>,
    }

    /// Supervisor whose workers are plain channels the test drives by hand
    ///
    /// Clones share state, so a test keeps one clone while the dispatcher owns another.
    #[derive(Clone, Default)]
    pub struct MockSupervisor {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockSupervisor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_spawns(&self, fail: bool) {
            self.inner.lock().unwrap().fail_spawns = fail;
        }

        pub fn spawn_count(&self) -> usize {
            self.inner.lock().unwrap().next_pid as usize
        }

        /// Live and exited workers, in spawn order
        pub fn worker_ids(&self) -> Vec<WorkerId> {
            let inner = self.inner.lock().unwrap();
            inner
                .workers
                .values()
                .map(|w| w.worker_id.clone())
                .collect()
        }

        /// Drain frames the dispatcher has sent to a worker
        pub fn take_frames(&self, worker_id: &WorkerId) -> Vec<Frame> {
            let mut inner = self.inner.lock().unwrap();
            let mut frames = Vec::new();
            if let Some(endpoint) = inner
                .workers
                .values_mut()
                .find(|w| &w.worker_id == worker_id)
                .and_then(|w| w.endpoint.as_mut())
            {
                while let Ok(frame) = endpoint.inbound.try_recv() {
                    frames.push(frame);
                }
            }
            frames
        }

        /// Send a frame to the dispatcher as if the worker wrote it
        pub fn reply(&self, worker_id: &WorkerId, frame: Frame) -> bool {
            let inner = self.inner.lock().unwrap();
            inner
                .workers
                .values()
                .find(|w| &w.worker_id == worker_id)
                .and_then(|w| w.endpoint.as_ref())
                .is_some_and(|endpoint| endpoint.outbox.send(frame).is_ok())
        }

        /// Simulate the worker process ending on its own
        pub fn exit(&self, worker_id: &WorkerId) {
            let mut inner = self.inner.lock().unwrap();
            let pid = inner
                .workers
                .iter()
                .find(|(_, w)| &w.worker_id == worker_id && w.endpoint.is_some())
                .map(|(pid, _)| *pid);
            if let Some(pid) = pid {
                Self::mark_exited(&mut inner, pid);
            }
        }

        pub fn terminated(&self) -> Vec<(Pid, bool)> {
            self.inner.lock().unwrap().terminated.clone()
        }

        fn mark_exited(inner: &mut Inner, pid: Pid) {
            if let Some(worker) = inner.workers.get_mut(&pid) {
                if worker.endpoint.take().is_some() {
                    let worker_id = worker.worker_id.clone();
                    inner.exited.push(ExitedWorker { worker_id, pid });
                }
            }
        }
    }

    impl WorkerSupervisor for MockSupervisor {
        fn spawn(
            &mut self,
            worker_id: &WorkerId,
            inbox: WorkerInbox,
        ) -> Result<SpawnedWorker, SpawnError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_spawns {
                return Err(SpawnError::Failed("mock spawn failure".to_string()));
            }
            inner.next_pid += 1;
            let pid = inner.next_pid;
            let (link, endpoint) = worker_channel(worker_id.clone(), inbox);
            inner.workers.insert(
                pid,
                MockWorker {
                    worker_id: worker_id.clone(),
                    endpoint: Some(endpoint),
                },
            );
            Ok(SpawnedWorker { pid, link })
        }

        fn is_alive(&self, pid: Pid) -> bool {
            let inner = self.inner.lock().unwrap();
            inner
                .workers
                .get(&pid)
                .is_some_and(|w| w.endpoint.is_some())
        }

        fn terminate(&mut self, pid: Pid, forceful: bool) -> Result<(), TerminateError> {
            let mut inner = self.inner.lock().unwrap();
            if !inner.workers.contains_key(&pid) {
                return Err(TerminateError::UnknownPid(pid));
            }
            inner.terminated.push((pid, forceful));
            Self::mark_exited(&mut inner, pid);
            Ok(())
        }

        fn reap(&mut self) -> Vec<ExitedWorker> {
            std::mem::take(&mut self.inner.lock().unwrap().exited)
        }
    }
}
