// Process supervisor
// One OS child process per worker; frames travel as JSON lines over the
// child's stdin/stdout. Child environment is reduced to an allowlist.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use warren_core::domain::{Pid, WorkerId};
use warren_core::port::{
    ExitedWorker, SpawnError, SpawnedWorker, TerminateError, WorkerFrame, WorkerInbox,
    WorkerLink, WorkerSupervisor,
};

use crate::codec::{read_frames, write_frames};

/// Command line a worker is started with; `--worker-id <id>` is appended
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-run the current executable
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

struct ChildWorker {
    worker_id: WorkerId,
    child: Child,
}

pub struct ProcessSupervisor {
    command: WorkerCommand,
    env_allowlist: Vec<String>,
    children: BTreeMap<Pid, ChildWorker>,
}

impl ProcessSupervisor {
    /// # Arguments
    /// * `command` - how to launch a worker process
    /// * `env_allowlist` - environment variables passed through to workers
    pub fn new(command: WorkerCommand, env_allowlist: Vec<String>) -> Self {
        Self {
            command,
            env_allowlist,
            children: BTreeMap::new(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn filter_env(&self, env: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        env.into_iter()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }
}

impl WorkerSupervisor for ProcessSupervisor {
    fn spawn(
        &mut self,
        worker_id: &WorkerId,
        inbox: WorkerInbox,
    ) -> Result<SpawnedWorker, SpawnError> {
        let env = self.filter_env(std::env::vars());
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg("--worker-id")
            .arg(worker_id.as_str())
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::Failed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Failed("child exited before reporting a pid".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Stdio("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Stdio("stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_id = worker_id.clone();
        let writer = tokio::spawn(async move {
            if let Err(e) = write_frames(stdin, rx).await {
                warn!(worker_id = %writer_id, error = %e, "Writing to worker failed");
            }
        });

        let writer = writer.abort_handle();
        let reader_id = worker_id.clone();
        tokio::spawn(async move {
            let tag = reader_id.clone();
            let outcome = read_frames(BufReader::new(stdout), |frame| {
                inbox
                    .send(WorkerFrame {
                        worker_id: tag.clone(),
                        frame,
                    })
                    .is_ok()
            })
            .await;
            if let Err(e) = outcome {
                warn!(worker_id = %reader_id, error = %e, "Reading from worker failed");
            }
            // stdout closed: drop the frame receiver so the link reports closed
            debug!(worker_id = %reader_id, "Worker output closed");
            writer.abort();
        });

        info!(worker_id = %worker_id, pid, "Worker process spawned");
        self.children.insert(
            pid,
            ChildWorker {
                worker_id: worker_id.clone(),
                child,
            },
        );
        Ok(SpawnedWorker {
            pid,
            link: WorkerLink::new(worker_id.clone(), tx),
        })
    }

    fn is_alive(&self, pid: Pid) -> bool {
        if !self.children.contains_key(&pid) {
            return false;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid as NixPid;

            // Signal 0 checks if process exists without actually sending a signal
            kill(NixPid::from_raw(pid as i32), None).is_ok()
        }

        #[cfg(not(unix))]
        {
            true
        }
    }

    fn terminate(&mut self, pid: Pid, forceful: bool) -> Result<(), TerminateError> {
        let worker = self
            .children
            .get_mut(&pid)
            .ok_or(TerminateError::UnknownPid(pid))?;

        if !forceful {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid as NixPid;

                debug!(worker_id = %worker.worker_id, pid, "Sending SIGTERM");
                return kill(NixPid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| TerminateError::Signal(format!("SIGTERM failed: {}", e)));
            }
        }

        debug!(worker_id = %worker.worker_id, pid, "Killing worker process");
        worker
            .child
            .start_kill()
            .map_err(|e| TerminateError::Signal(e.to_string()))
    }

    fn reap(&mut self) -> Vec<ExitedWorker> {
        let mut exited = Vec::new();
        for (pid, worker) in self.children.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker_id = %worker.worker_id, pid, status = %status, "Worker process exited");
                    exited.push(ExitedWorker {
                        worker_id: worker.worker_id.clone(),
                        pid: *pid,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id = %worker.worker_id, pid, error = %e, "Cannot query worker process, dropping it");
                    exited.push(ExitedWorker {
                        worker_id: worker.worker_id.clone(),
                        pid: *pid,
                    });
                }
            }
        }
        for worker in &exited {
            self.children.remove(&worker.pid);
        }
        exited
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use warren_core::domain::{Frame, MessageType};

    fn shell(script: &str) -> WorkerCommand {
        // `$0` swallows the appended `--worker-id`, `$1` is the id
        WorkerCommand::new("/bin/sh").arg("-c").arg(script)
    }

    async fn reap_until_exit(supervisor: &mut ProcessSupervisor) -> Vec<ExitedWorker> {
        for _ in 0..100 {
            let exited = supervisor.reap();
            if !exited.is_empty() {
                return exited;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_frames_round_trip_through_child() {
        // Echo every line back: the child acts as a mirror worker
        let mut supervisor = ProcessSupervisor::new(shell("cat"), vec!["PATH".to_string()]);
        let (inbox, mut frames) = mpsc::unbounded_channel();
        let id = WorkerId::new("w1");

        let spawned = supervisor.spawn(&id, inbox).unwrap();
        assert!(supervisor.is_alive(spawned.pid));

        spawned
            .link
            .send(Frame::signal(MessageType::Processed))
            .unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.worker_id, id);
        assert_eq!(echoed.frame, Frame::signal(MessageType::Processed));

        supervisor.terminate(spawned.pid, true).unwrap();
        let exited = reap_until_exit(&mut supervisor).await;
        assert_eq!(
            exited,
            vec![ExitedWorker {
                worker_id: id,
                pid: spawned.pid
            }]
        );
        assert_eq!(supervisor.child_count(), 0);
        assert!(!supervisor.is_alive(spawned.pid));
    }

    #[tokio::test]
    async fn test_worker_id_is_passed_as_argument() {
        let mut supervisor = ProcessSupervisor::new(
            shell(r#"printf '{"type":42,"payload":"%s"}\n' "$1""#),
            vec!["PATH".to_string()],
        );
        let (inbox, mut frames) = mpsc::unbounded_channel();
        supervisor.spawn(&WorkerId::new("w7"), inbox).unwrap();

        let reported = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reported.frame, Frame::new(42, "w7"));
        assert_eq!(reap_until_exit(&mut supervisor).await.len(), 1);
    }

    #[tokio::test]
    async fn test_link_closes_when_child_output_ends() {
        // stdout closed while the process itself lingers unreaped
        let mut supervisor =
            ProcessSupervisor::new(shell("exec 1>&-; sleep 30"), vec!["PATH".to_string()]);
        let (inbox, _frames) = mpsc::unbounded_channel();
        let spawned = supervisor.spawn(&WorkerId::new("w1"), inbox).unwrap();

        for _ in 0..100 {
            if !spawned.link.is_writable() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!spawned.link.is_writable());
        assert!(spawned.link.send(Frame::signal(MessageType::Queue)).is_err());
        assert!(supervisor.is_alive(spawned.pid));

        supervisor.terminate(spawned.pid, true).unwrap();
        assert_eq!(reap_until_exit(&mut supervisor).await.len(), 1);
    }

    #[tokio::test]
    async fn test_graceful_terminate_sends_sigterm() {
        let mut supervisor = ProcessSupervisor::new(shell("sleep 30"), vec!["PATH".to_string()]);
        let (inbox, _frames) = mpsc::unbounded_channel();
        let spawned = supervisor.spawn(&WorkerId::new("w1"), inbox).unwrap();

        supervisor.terminate(spawned.pid, false).unwrap();
        assert_eq!(reap_until_exit(&mut supervisor).await.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_and_terminate_errors() {
        let mut supervisor = ProcessSupervisor::new(
            WorkerCommand::new("/nonexistent/warren-worker"),
            Vec::new(),
        );
        let (inbox, _frames) = mpsc::unbounded_channel();
        assert!(matches!(
            supervisor.spawn(&WorkerId::new("w1"), inbox),
            Err(SpawnError::Failed(_))
        ));
        assert_eq!(
            supervisor.terminate(99, true),
            Err(TerminateError::UnknownPid(99))
        );
    }

    #[test]
    fn test_env_filtering() {
        let supervisor =
            ProcessSupervisor::new(WorkerCommand::new("true"), vec!["ALLOWED_VAR".to_string()]);
        let filtered = supervisor.filter_env(vec![
            ("ALLOWED_VAR".to_string(), "value1".to_string()),
            ("BLOCKED_VAR".to_string(), "value2".to_string()),
        ]);

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("ALLOWED_VAR"));
    }
}
