// Task supervisor
// Workers run as tokio tasks inside the dispatcher's process. Same contract
// as the process supervisor; pids are synthetic.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use warren_core::application::worker::{shutdown_channel, ShutdownSender, WorkerFactory};
use warren_core::domain::{Pid, WorkerId};
use warren_core::port::{
    worker_channel, ExitedWorker, SpawnError, SpawnedWorker, TerminateError, WorkerInbox,
    WorkerSupervisor,
};

struct WorkerTask {
    worker_id: WorkerId,
    handle: JoinHandle<()>,
    shutdown: ShutdownSender,
}

pub struct TaskSupervisor {
    factory: Arc<WorkerFactory>,
    next_pid: Pid,
    tasks: BTreeMap<Pid, WorkerTask>,
}

impl TaskSupervisor {
    pub fn new(factory: Arc<WorkerFactory>) -> Self {
        Self {
            factory,
            next_pid: 0,
            tasks: BTreeMap::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl WorkerSupervisor for TaskSupervisor {
    fn spawn(
        &mut self,
        worker_id: &WorkerId,
        inbox: WorkerInbox,
    ) -> Result<SpawnedWorker, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::Failed(e.to_string()))?;

        let (link, endpoint) = worker_channel(worker_id.clone(), inbox);
        let mut worker = self.factory.make_worker(worker_id.clone(), endpoint);
        let (shutdown, token) = shutdown_channel();
        worker.set_shutdown_token(token);

        let task_id = worker_id.clone();
        let handle = runtime.spawn(async move {
            if let Err(e) = worker.run().await {
                warn!(worker_id = %task_id, error = %e, "Worker task ended with error");
            }
        });

        self.next_pid += 1;
        let pid = self.next_pid;
        debug!(worker_id = %worker_id, pid, "Worker task spawned");
        self.tasks.insert(
            pid,
            WorkerTask {
                worker_id: worker_id.clone(),
                handle,
                shutdown,
            },
        );
        Ok(SpawnedWorker { pid, link })
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.tasks
            .get(&pid)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Graceful termination asks the worker to shut down on its own
    fn terminate(&mut self, pid: Pid, forceful: bool) -> Result<(), TerminateError> {
        let task = self.tasks.get(&pid).ok_or(TerminateError::UnknownPid(pid))?;
        if forceful {
            debug!(worker_id = %task.worker_id, pid, "Aborting worker task");
            task.handle.abort();
        } else {
            task.shutdown.shutdown();
        }
        Ok(())
    }

    fn reap(&mut self) -> Vec<ExitedWorker> {
        let finished: Vec<Pid> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(pid, _)| *pid)
            .collect();

        finished
            .into_iter()
            .filter_map(|pid| {
                self.tasks.remove(&pid).map(|task| ExitedWorker {
                    worker_id: task.worker_id,
                    pid,
                })
            })
            .collect()
    }
}
