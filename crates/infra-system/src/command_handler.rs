// Command handler
// Runs an external command per queue message: content on stdin, message
// metadata in the environment. Environment is reduced to an allowlist.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use warren_core::application::worker::{MessageHandler, WorkerContext};
use warren_core::domain::QueueMessage;

#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env_allowlist: Vec<String>,
    timeout: Option<Duration>,
}

/// Output of one command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env_allowlist: Vec::new(),
            timeout: None,
        }
    }

    /// Environment variables passed through from the worker
    pub fn with_env_allowlist(mut self, env_allowlist: Vec<String>) -> Self {
        self.env_allowlist = env_allowlist;
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    fn filter_env(&self, env: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
        env.into_iter()
            .filter(|(k, _)| self.env_allowlist.contains(k))
            .collect()
    }

    fn message_env(message: &QueueMessage) -> [(&'static str, String); 4] {
        [
            ("WARREN_MESSAGE_ID", message.message_id.clone()),
            ("WARREN_EXCHANGE", message.exchange.clone()),
            ("WARREN_QUEUE", message.queue.clone()),
            ("WARREN_ROUTING_KEY", message.routing_key.clone()),
        ]
    }

    /// Run the command for one message; a non-zero exit is an error
    pub async fn run(&self, message: &QueueMessage) -> anyhow::Result<CommandOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .envs(Self::message_env(message))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;

        // stdin is written while output is collected
        let stdin = child.stdin.take();
        let content = &message.content;
        let feed_stdin = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(content).await {
                    debug!(error = %e, "Command closed stdin early");
                }
            }
        };
        let program = &self.program;
        let limit = self.timeout;
        let wait = async move {
            match limit {
                Some(limit) => match timeout(limit, child.wait_with_output()).await {
                    Ok(output) => output.with_context(|| format!("failed to wait for {}", program)),
                    Err(_) => Err(anyhow!("{} timed out after {:?}", program, limit)),
                },
                None => child
                    .wait_with_output()
                    .await
                    .with_context(|| format!("failed to wait for {}", program)),
            }
        };
        let ((), output) = tokio::join!(feed_stdin, wait);
        let output = output?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(
        &self,
        message: QueueMessage,
        ctx: &mut WorkerContext<'_>,
    ) -> anyhow::Result<()> {
        info!(
            worker_id = %ctx.worker_id(),
            message_id = %message.message_id,
            command = %self.program,
            "Running command"
        );
        match self.run(&message).await {
            Ok(output) => {
                debug!(message_id = %message.message_id, stdout = %output.stdout.trim_end(), "Command finished");
                Ok(())
            }
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Command failed");
                Err(e)
            }
        }
    }
}
